use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TranslateError {
    // --- I/O ---
    #[error("Failed to read file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write file {path}: {source}")]
    FileWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Mmap failed for {path}: {source}")]
    Mmap {
        path: PathBuf,
        source: std::io::Error,
    },

    // --- Formats ---
    #[error("Bad magic: expected {expected:?}, got {got:?}")]
    BadMagic { expected: [u8; 4], got: Vec<u8> },

    #[error("Unsupported {kind} version {version}")]
    UnsupportedVersion { kind: &'static str, version: u32 },

    #[error("Data corrupt at byte offset {offset}: {reason}")]
    Corrupt { offset: usize, reason: String },

    // --- Model ---
    #[error("Shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: String, got: String },

    #[error("Invalid model settings: {0}")]
    InvalidSettings(String),

    #[error("Checkpoint does not fit the data bundle: {0}")]
    Incompatible(String),

    // --- Vocabulary ---
    #[error("Unknown token index: {0}")]
    UnknownIndex(u32),

    #[error("Duplicate vocabulary label {label:?} at index {index}")]
    DuplicateLabel { label: String, index: u32 },

    #[error("Reserved symbol {expected:?} missing at index {index}, found {found:?}")]
    ReservedSymbol {
        expected: &'static str,
        index: u32,
        found: String,
    },

    // --- Decoding ---
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Model returned {got} log-probabilities, vocabulary has {expected}")]
    DistributionWidth { expected: usize, got: usize },
}

pub type Result<T> = std::result::Result<T, TranslateError>;
