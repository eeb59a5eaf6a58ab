//! End-to-end tests for the translation driver.

mod common;

use std::fs;

use transrs::beam::{beam_search, BeamConfig, Seq2Seq};
use transrs::checkpoint::Checkpoint;
use transrs::translator::{run, TranslateConfig, Translator};
use transrs::transformer::Transformer;
use transrs::vocab::{Vocabulary, BOS, EOS, PAD};
use transrs::{Result, TranslateError};

fn config(dir: &std::path::Path, beam: BeamConfig) -> TranslateConfig {
    let settings = common::test_settings();
    TranslateConfig {
        model: common::write_test_checkpoint(dir, &settings, settings.n_params().unwrap()),
        data: common::write_test_bundle(dir, &common::test_bundle()),
        output: dir.join("pred.txt"),
        beam,
        no_cuda: true,
        parallel: false,
        limit: None,
    }
}

#[test]
fn test_run_writes_one_line_per_example() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), BeamConfig::new(3, 12));

    let summary = run(&config).unwrap();
    assert_eq!(summary.examples, 4);
    assert_eq!(summary.truncated, 0);

    let text = fs::read_to_string(&config.output).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 4);
    assert!(text.ends_with('\n'));

    for line in lines {
        assert!(line.split_whitespace().count() <= 12);
        for word in line.split_whitespace() {
            assert!(!["<blank>", "<s>", "</s>"].contains(&word), "control symbol in {:?}", line);
        }
    }
}

#[test]
fn test_run_is_deterministic_and_parallel_matches() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path(), BeamConfig::new(4, 10));

    run(&config).unwrap();
    let first = fs::read_to_string(&config.output).unwrap();

    run(&config).unwrap();
    let second = fs::read_to_string(&config.output).unwrap();

    config.parallel = true;
    run(&config).unwrap();
    let parallel = fs::read_to_string(&config.output).unwrap();

    assert_eq!(first, second);
    assert_eq!(first, parallel);
}

#[test]
fn test_run_respects_limit() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path(), BeamConfig::new(2, 8));
    config.limit = Some(2);

    let summary = run(&config).unwrap();

    assert_eq!(summary.examples, 2);
    assert_eq!(fs::read_to_string(&config.output).unwrap().lines().count(), 2);
}

#[test]
fn test_checkpoint_with_wrong_parameter_count_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let settings = common::test_settings();

    for n in [settings.n_params().unwrap() - 1, settings.n_params().unwrap() + 1] {
        let path = common::write_test_checkpoint(dir.path(), &settings, n);
        let checkpoint = Checkpoint::open(&path).unwrap();

        assert!(matches!(
            Transformer::new(&checkpoint),
            Err(TranslateError::ShapeMismatch { .. })
        ));
    }
}

#[test]
fn test_checkpoint_for_other_vocabulary_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path(), BeamConfig::default());

    let mut settings = common::test_settings();
    settings.trg_vocab_size += 1;
    config.model = common::write_test_checkpoint(dir.path(), &settings, settings.n_params().unwrap());

    assert!(matches!(run(&config), Err(TranslateError::Incompatible(_))));
}

#[test]
fn test_missing_artifacts_are_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path(), BeamConfig::default());
    config.data = dir.path().join("missing.bin");

    assert!(matches!(run(&config), Err(TranslateError::FileRead { .. })));
    assert!(!config.output.exists());
}

#[test]
fn test_width_one_is_greedy_on_transformer() {
    let dir = tempfile::tempdir().unwrap();
    let settings = common::test_settings();
    let path = common::write_test_checkpoint(dir.path(), &settings, settings.n_params().unwrap());
    let checkpoint = Checkpoint::open(&path).unwrap();
    let model = Transformer::new(&checkpoint).unwrap();

    let source = [BOS, 4, 5, 9, EOS];
    let max_len = 8;

    let enc = model.encode(&source).unwrap();
    let mut prefix = vec![BOS];
    for _ in 0..max_len {
        let mut lp = model.decode_step(&enc, &prefix).unwrap();
        lp[PAD as usize] = f32::NEG_INFINITY;
        lp[BOS as usize] = f32::NEG_INFINITY;

        let mut best = 0;
        for (i, v) in lp.iter().enumerate() {
            if *v > lp[best] {
                best = i;
            }
        }
        prefix.push(best as u32);
        if best as u32 == EOS {
            break;
        }
    }
    if prefix.last() == Some(&EOS) {
        prefix.pop();
    }

    let hyp = beam_search(&model, &source, &BeamConfig::new(1, max_len)).unwrap();

    assert_eq!(hyp.tokens, prefix[1..].to_vec());
    assert!(hyp.tokens.len() <= max_len);
}

/// Emits one content token, then the end marker.
struct ContentThenEnd {
    content: u32,
    vocab: usize,
}

impl Seq2Seq for ContentThenEnd {
    type Encoded = ();

    fn vocab_size(&self) -> usize {
        self.vocab
    }

    fn encode(&self, _source: &[u32]) -> Result<()> {
        Ok(())
    }

    fn decode_step(&self, _encoded: &(), prefix: &[u32]) -> Result<Vec<f32>> {
        let next = if prefix.len() == 1 { self.content } else { EOS };
        let mut lp = vec![f32::NEG_INFINITY; self.vocab];
        lp[next as usize] = 0.0;
        Ok(lp)
    }
}

#[test]
fn test_content_then_end_renders_single_word() {
    let vocab = Vocabulary::from_labels(["hello"]).unwrap();
    let model = ContentThenEnd {
        content: vocab.index("hello"),
        vocab: vocab.len(),
    };
    let translator = Translator::new(&model, &vocab, BeamConfig::new(1, 5)).unwrap();

    let hyp = translator.translate_sentence(&[BOS, EOS]).unwrap();

    assert_eq!(hyp.tokens, vec![4]);
    assert!(hyp.finished);
    assert_eq!(translator.render(&hyp).unwrap(), "hello");
}
