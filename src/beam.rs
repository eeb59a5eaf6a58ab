//! Beam-search decoding over any encoder-decoder model.
//!
//! Scores are summed log-probabilities. Pruning between steps uses the raw
//! sum; the final pick among finished hypotheses divides by `len^alpha`
//! (`alpha` = `length_penalty`, 0 disables it). Ties are broken by shorter
//! length, then earlier completion, then beam position, so the result is
//! fully deterministic for a deterministic model.

use crate::error::{Result, TranslateError};
use crate::vocab::{BOS, EOS, PAD};

use std::cmp::Ordering;

/// The two calls the decoder needs from a model.
pub trait Seq2Seq {
    type Encoded;

    /// Width of the distribution returned by `decode_step`.
    fn vocab_size(&self) -> usize;

    fn encode(&self, source: &[u32]) -> Result<Self::Encoded>;

    /// Next-token log-probabilities given the target prefix (starting with BOS).
    fn decode_step(&self, encoded: &Self::Encoded, prefix: &[u32]) -> Result<Vec<f32>>;
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub struct BeamConfig {
    pub beam_width: usize,
    pub max_len: usize,
    pub length_penalty: f32,
    pub bos: u32,
    pub eos: u32,
    pub pad: u32,
}

impl BeamConfig {
    pub fn new(beam_width: usize, max_len: usize) -> BeamConfig {
        BeamConfig {
            beam_width,
            max_len,
            ..BeamConfig::default()
        }
    }

    pub fn with_length_penalty(mut self, alpha: f32) -> BeamConfig {
        self.length_penalty = alpha;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.beam_width == 0 {
            return Err(TranslateError::InvalidConfig(String::from("beam width must be positive")));
        }
        if self.max_len == 0 {
            return Err(TranslateError::InvalidConfig(String::from("max length must be positive")));
        }
        if !self.length_penalty.is_finite() || self.length_penalty < 0.0 {
            return Err(TranslateError::InvalidConfig(format!(
                "length penalty must be a non-negative number, got {}",
                self.length_penalty
            )));
        }
        Ok(())
    }

    fn rank(&self, score: f32, len: usize) -> f32 {
        if self.length_penalty == 0.0 {
            score
        } else {
            score / (len.max(1) as f32).powf(self.length_penalty)
        }
    }
}

impl Default for BeamConfig {
    fn default() -> Self {
        BeamConfig {
            beam_width: 5,
            max_len: 100,
            length_penalty: 0.7,
            bos: BOS,
            eos: EOS,
            pad: PAD,
        }
    }
}

/// A decoded sequence. `tokens` excludes BOS and the closing EOS.
#[derive(Debug, Clone, PartialEq)]
pub struct Hypothesis {
    pub tokens: Vec<u32>,
    pub score: f32,
    pub finished: bool,
}

#[derive(Debug, Clone)]
struct Beam {
    // Starts with BOS; ends with EOS once finished.
    tokens: Vec<u32>,
    score: f32,
    finished: bool,
    // Step at which EOS was emitted.
    done_at: usize,
}

impl Beam {
    fn generated(&self) -> usize {
        self.tokens.len() - 1
    }

    fn into_hypothesis(mut self, eos: u32) -> Hypothesis {
        if self.finished && self.tokens.last() == Some(&eos) {
            self.tokens.pop();
        }
        self.tokens.remove(0);

        Hypothesis {
            tokens: self.tokens,
            score: self.score,
            finished: self.finished,
        }
    }
}

#[derive(Debug, Copy, Clone)]
struct Candidate {
    score: f32,
    parent: usize,
    // None carries a finished beam over unchanged.
    token: Option<u32>,
}

fn compare_candidates(a: &Candidate, b: &Candidate) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| match (a.token, b.token) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(x), Some(y)) => x.cmp(&y),
        })
        .then_with(|| a.parent.cmp(&b.parent))
}

/// The `k` best finite entries of `log_probs`, best first, ties to the lower index.
fn top_k(log_probs: &[f32], k: usize) -> Vec<(u32, f32)> {
    let order = |a: &(u32, f32), b: &(u32, f32)| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0));

    let mut entries: Vec<(u32, f32)> = log_probs
        .iter()
        .enumerate()
        .filter(|(_, lp)| lp.is_finite())
        .map(|(i, lp)| (i as u32, *lp))
        .collect();

    if entries.len() > k {
        entries.select_nth_unstable_by(k - 1, order);
        entries.truncate(k);
    }
    entries.sort_by(order);

    entries
}

/// All hypotheses left in the final beam, best first. Finished ones always
/// rank ahead of unfinished ones.
pub fn search<M: Seq2Seq>(model: &M, source: &[u32], config: &BeamConfig) -> Result<Vec<Hypothesis>> {
    config.validate()?;

    let k = config.beam_width;
    let vocab_size = model.vocab_size();
    let encoded = model.encode(source)?;

    let mut beams = vec![Beam {
        tokens: vec![config.bos],
        score: 0.0,
        finished: false,
        done_at: 0,
    }];

    for step in 1..=config.max_len {
        let mut pool: Vec<Candidate> = Vec::with_capacity(beams.len() * k);

        for (parent, beam) in beams.iter().enumerate() {
            if beam.finished {
                pool.push(Candidate {
                    score: beam.score,
                    parent,
                    token: None,
                });
                continue;
            }

            let mut log_probs = model.decode_step(&encoded, &beam.tokens)?;

            if log_probs.len() != vocab_size {
                return Err(TranslateError::DistributionWidth {
                    expected: vocab_size,
                    got: log_probs.len(),
                });
            }

            for masked in [config.pad, config.bos] {
                if let Some(lp) = log_probs.get_mut(masked as usize) {
                    *lp = f32::NEG_INFINITY;
                }
            }

            for (token, lp) in top_k(&log_probs, k) {
                pool.push(Candidate {
                    score: beam.score + lp,
                    parent,
                    token: Some(token),
                });
            }
        }

        // Every live beam had an empty distribution; nothing left to extend.
        if pool.is_empty() {
            break;
        }

        pool.sort_by(compare_candidates);
        pool.truncate(k);

        beams = pool
            .iter()
            .map(|c| {
                let parent = &beams[c.parent];
                match c.token {
                    None => parent.clone(),
                    Some(token) => {
                        let mut tokens = Vec::with_capacity(parent.tokens.len() + 1);
                        tokens.extend_from_slice(&parent.tokens);
                        tokens.push(token);

                        let finished = token == config.eos;
                        Beam {
                            tokens,
                            score: c.score,
                            finished,
                            done_at: if finished { step } else { 0 },
                        }
                    }
                }
            })
            .collect();

        if beams.iter().all(|b| b.finished) {
            break;
        }
    }

    let mut ranked: Vec<(usize, Beam)> = beams.into_iter().enumerate().collect();
    ranked.sort_by(|(pa, a), (pb, b)| {
        b.finished
            .cmp(&a.finished)
            .then_with(|| {
                let ra = config.rank(a.score, a.generated());
                let rb = config.rank(b.score, b.generated());
                rb.total_cmp(&ra)
            })
            .then_with(|| a.generated().cmp(&b.generated()))
            .then_with(|| a.done_at.cmp(&b.done_at))
            .then_with(|| pa.cmp(pb))
    });

    Ok(ranked
        .into_iter()
        .map(|(_, beam)| beam.into_hypothesis(config.eos))
        .collect())
}

/// Best hypothesis for `source`; an unfinished one when EOS never won a slot.
pub fn beam_search<M: Seq2Seq>(model: &M, source: &[u32], config: &BeamConfig) -> Result<Hypothesis> {
    let mut ranked = search(model, source, config)?;
    // `search` always keeps at least the initial beam.
    Ok(ranked.swap_remove(0))
}
