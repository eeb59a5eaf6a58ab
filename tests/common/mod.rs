//! Shared builders for integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};

use transrs::checkpoint::{write_checkpoint, ModelSettings};
use transrs::dataset::{DataBundle, Example};
use transrs::vocab::{Vocabulary, BOS, EOS};

pub const SRC_WORDS: [&str; 6] = ["ein", "hund", "eine", "katze", "lauft", "schlaft"];
pub const TRG_WORDS: [&str; 7] = ["a", "dog", "cat", "runs", "sleeps", "the", "."];

/// Minimal model shape for fast tests, matching `test_bundle`.
pub fn test_settings() -> ModelSettings {
    ModelSettings {
        src_vocab_size: 4 + SRC_WORDS.len(),
        trg_vocab_size: 4 + TRG_WORDS.len(),
        src_pad_idx: 0,
        trg_pad_idx: 0,
        d_word_vec: 16,
        d_model: 16,
        d_inner: 32,
        d_k: 4,
        d_v: 4,
        n_layers: 2,
        n_head: 4,
        n_position: 200,
        dropout: 0.1,
        embs_share_weight: false,
        proj_share_weight: true,
    }
}

/// Deterministic pseudo-random parameters in [-0.25, 0.25).
pub fn test_params(n: usize) -> Vec<f32> {
    let mut state: u64 = 0x2545F4914F6CDD1D;
    (0..n)
        .map(|_| {
            state ^= state >> 12;
            state ^= state << 25;
            state ^= state >> 27;
            let r = (state.wrapping_mul(0x2545F4914F6CDD1D) >> 40) as f32 / 16777216.0;
            (r - 0.5) * 0.5
        })
        .collect()
}

pub fn test_bundle() -> DataBundle {
    let src_vocab = Vocabulary::from_labels(SRC_WORDS).unwrap();
    let trg_vocab = Vocabulary::from_labels(TRG_WORDS).unwrap();

    let sentences: [&[u32]; 4] = [&[4, 5, 8], &[6, 7, 9], &[4, 5, 9, 6, 7, 8], &[7]];

    let test = sentences
        .iter()
        .map(|words| Example {
            src: std::iter::once(BOS)
                .chain(words.iter().copied())
                .chain(std::iter::once(EOS))
                .collect(),
            trg: vec![BOS, 4, 5, EOS],
        })
        .collect();

    DataBundle {
        src_vocab,
        trg_vocab,
        test,
    }
}

pub fn write_test_checkpoint(dir: &Path, settings: &ModelSettings, n_params: usize) -> PathBuf {
    let path = dir.join("model.chkpt");
    write_checkpoint(&path, settings, &test_params(n_params)).expect("Failed to write checkpoint");
    path
}

pub fn write_test_bundle(dir: &Path, bundle: &DataBundle) -> PathBuf {
    let path = dir.join("data.bin");
    bundle.save(&path).expect("Failed to write bundle");
    path
}
