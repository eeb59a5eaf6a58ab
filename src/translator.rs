use crate::beam::{beam_search, BeamConfig, Hypothesis, Seq2Seq};
use crate::checkpoint::{Checkpoint, ModelSettings};
use crate::dataset::{prepare_source, DataBundle, Example, MAX_TOKEN_SEQ_LEN};
use crate::error::{Result, TranslateError};
use crate::transformer::Transformer;
use crate::vocab::{Vocabulary, PAD};

use log::{debug, info, warn};
use rayon::prelude::*;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

const LOG_EVERY: usize = 100;

/// Completed-sentence counter shared by the decoding workers.
struct Progress {
    done: AtomicUsize,
    total: usize,
    start: Instant,
}

impl Progress {
    fn new(total: usize) -> Progress {
        Progress {
            done: AtomicUsize::new(0),
            total,
            start: Instant::now(),
        }
    }

    /// Records one finished sentence; returns true when that crossed a log mark.
    fn tick(&self) -> bool {
        let done = self.done.fetch_add(1, Ordering::Relaxed) + 1;
        if done % LOG_EVERY != 0 {
            return false;
        }

        info!(
            "  - (Test) {}/{} sentences, {:.1}s",
            done,
            self.total,
            self.start.elapsed().as_secs_f32()
        );
        true
    }
}

/// Everything one run of the driver needs.
#[derive(Debug, Clone)]
pub struct TranslateConfig {
    pub model: PathBuf,
    pub data: PathBuf,
    pub output: PathBuf,
    pub beam: BeamConfig,
    pub no_cuda: bool,
    pub parallel: bool,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub examples: usize,
    pub truncated: usize,
    pub unfinished: usize,
    pub elapsed: Duration,
}

/// Decodes source sentences with a model and renders them with the target vocabulary.
pub struct Translator<'m, M: Seq2Seq> {
    model: &'m M,
    trg_vocab: &'m Vocabulary,
    config: BeamConfig,
    max_token_seq_len: usize,
}

impl<'m, M: Seq2Seq> Translator<'m, M> {
    pub fn new(model: &'m M, trg_vocab: &'m Vocabulary, config: BeamConfig) -> Result<Translator<'m, M>> {
        config.validate()?;

        if model.vocab_size() != trg_vocab.len() {
            return Err(TranslateError::Incompatible(format!(
                "model predicts {} target tokens, vocabulary has {}",
                model.vocab_size(),
                trg_vocab.len()
            )));
        }

        Ok(Translator {
            model,
            trg_vocab,
            config,
            max_token_seq_len: MAX_TOKEN_SEQ_LEN,
        })
    }

    pub fn with_max_token_seq_len(mut self, max_len: usize) -> Translator<'m, M> {
        self.max_token_seq_len = max_len;
        self
    }

    pub fn translate_sentence(&self, src: &[u32]) -> Result<Hypothesis> {
        let (src, _) = prepare_source(src, self.max_token_seq_len);
        beam_search(self.model, &src, &self.config)
    }

    pub fn render(&self, hyp: &Hypothesis) -> Result<String> {
        self.trg_vocab.decode_line(&hyp.tokens)
    }

    /// One example at a time, in order.
    pub fn translate_all(&self, examples: &[Example]) -> Result<Vec<Hypothesis>> {
        let mut out = Vec::with_capacity(examples.len());
        let progress = Progress::new(examples.len());

        for ex in examples {
            out.push(self.translate_sentence(&ex.src)?);
            progress.tick();
        }

        Ok(out)
    }

    pub fn max_token_seq_len(&self) -> usize {
        self.max_token_seq_len
    }
}

impl<'m, M: Seq2Seq + Sync> Translator<'m, M> {
    /// One independent decode per example on the rayon pool; output keeps input order.
    pub fn par_translate_all(&self, examples: &[Example]) -> Result<Vec<Hypothesis>> {
        let progress = Progress::new(examples.len());

        examples
            .par_iter()
            .map(|ex| {
                let hyp = self.translate_sentence(&ex.src);
                progress.tick();
                hyp
            })
            .collect()
    }
}

/// Checks that a checkpoint can consume the bundle's indices and produce its
/// target vocabulary, and that the beam fits the model's positions.
pub fn check_compatible(settings: &ModelSettings, bundle: &DataBundle, beam: &BeamConfig) -> Result<()> {
    if settings.src_vocab_size != bundle.src_vocab.len() {
        return Err(TranslateError::Incompatible(format!(
            "source vocabulary: checkpoint {}, bundle {}",
            settings.src_vocab_size,
            bundle.src_vocab.len()
        )));
    }

    if settings.trg_vocab_size != bundle.trg_vocab.len() {
        return Err(TranslateError::Incompatible(format!(
            "target vocabulary: checkpoint {}, bundle {}",
            settings.trg_vocab_size,
            bundle.trg_vocab.len()
        )));
    }

    if settings.src_pad_idx != PAD || settings.trg_pad_idx != PAD {
        return Err(TranslateError::Incompatible(format!(
            "pad indices {}/{} differ from the vocabulary's {}",
            settings.src_pad_idx, settings.trg_pad_idx, PAD
        )));
    }

    if beam.max_len > settings.n_position {
        return Err(TranslateError::Incompatible(format!(
            "max output length {} exceeds the model's {} positions",
            beam.max_len, settings.n_position
        )));
    }

    Ok(())
}

pub fn write_predictions<P: AsRef<Path>>(path: P, lines: &[String]) -> Result<()> {
    let path = path.as_ref();
    let io_err = |source| TranslateError::FileWrite {
        path: path.to_path_buf(),
        source,
    };

    let file = File::create(path).map_err(io_err)?;
    let mut writer = BufWriter::new(file);

    for line in lines {
        writeln!(writer, "{}", line).map_err(io_err)?;
    }

    writer.flush().map_err(io_err)
}

/// Loads both artifacts, decodes the test set and writes the predictions file.
pub fn run(config: &TranslateConfig) -> Result<RunSummary> {
    config.beam.validate()?;

    if !config.no_cuda {
        warn!("No accelerator backend in this build, decoding on CPU");
    }

    let bundle = DataBundle::load(&config.data)?;
    info!(
        "Loaded {:?}: {} source / {} target tokens, {} test examples",
        config.data,
        bundle.src_vocab.len(),
        bundle.trg_vocab.len(),
        bundle.test.len()
    );

    let checkpoint = Checkpoint::open(&config.model)?;
    let settings = checkpoint.settings;
    debug!("Checkpoint settings: {:?}", settings);

    check_compatible(&settings, &bundle, &config.beam)?;

    let model = Transformer::new(&checkpoint)?;
    info!(
        "Trained model state loaded from {:?} ({} layers, {} heads, d_model {}, {} parameters)",
        checkpoint.path(),
        settings.n_layers,
        settings.n_head,
        settings.d_model,
        settings.n_params()?
    );
    if settings.dropout > 0.0 {
        debug!("Dropout {} is inactive during inference", settings.dropout);
    }

    let translator = Translator::new(&model, &bundle.trg_vocab, config.beam)?
        .with_max_token_seq_len(MAX_TOKEN_SEQ_LEN.min(settings.n_position));

    let examples = match config.limit {
        Some(n) => &bundle.test[..n.min(bundle.test.len())],
        None => &bundle.test[..],
    };

    let truncated = examples
        .iter()
        .filter(|ex| prepare_source(&ex.src, translator.max_token_seq_len()).1)
        .count();
    if truncated > 0 {
        warn!(
            "{} source sentences exceed {} tokens and were truncated",
            truncated,
            translator.max_token_seq_len()
        );
    }

    let start = Instant::now();

    let hypotheses = if config.parallel {
        info!("Decoding {} examples on {} threads", examples.len(), rayon::current_num_threads());
        translator.par_translate_all(examples)?
    } else {
        translator.translate_all(examples)?
    };

    let lines = hypotheses
        .iter()
        .map(|h| translator.render(h))
        .collect::<Result<Vec<String>>>()?;

    write_predictions(&config.output, &lines)?;

    let summary = RunSummary {
        examples: examples.len(),
        truncated,
        unfinished: hypotheses.iter().filter(|h| !h.finished).count(),
        elapsed: start.elapsed(),
    };

    if summary.unfinished > 0 {
        warn!(
            "{} hypotheses hit the {} token cap without an end marker",
            summary.unfinished, config.beam.max_len
        );
    }

    info!(
        "Wrote {} predictions to {:?} in {:.2}s",
        summary.examples,
        config.output,
        summary.elapsed.as_secs_f32()
    );

    Ok(summary)
}
