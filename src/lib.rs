pub mod error;
pub mod functional;
pub mod vocab;
pub mod dataset;
pub mod checkpoint;
pub mod transformer;
pub mod beam;
pub mod translator;

pub use beam::{beam_search, BeamConfig, Hypothesis, Seq2Seq};
pub use error::{Result, TranslateError};
