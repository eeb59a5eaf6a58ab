use clap::Parser;
use log::{error, info};

use transrs::beam::BeamConfig;
use transrs::translator::{run, TranslateConfig};

use chrono::Local;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

/// Translate the test set of a data bundle with a trained checkpoint
#[derive(Parser)]
#[command(name = "translate")]
#[command(version = "0.1")]
struct Args {
    /// Path to model weight file
    #[arg(long)]
    model: PathBuf,
    /// Bundle with both vocabularies and the test instances
    #[arg(long)]
    data: PathBuf,
    /// Predictions file, one decoded sentence per line
    #[arg(long, default_value = "pred.txt")]
    output: PathBuf,
    #[arg(long, default_value_t = 5)]
    beam_size: usize,
    #[arg(long, default_value_t = 100)]
    max_seq_len: usize,
    /// Exponent of the length normalization used to pick the final hypothesis
    #[arg(long, default_value_t = 0.7f32)]
    length_penalty: f32,
    #[arg(long, default_value_t = false)]
    no_cuda: bool,
    /// Decode examples concurrently
    #[arg(long, default_value_t = false)]
    parallel: bool,
    /// Only decode the first N examples
    #[arg(long)]
    limit: Option<usize>,
}

fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {}] {}",
                Local::now().format("%H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .init();
}

fn main() -> ExitCode {
    init_logging();

    let args = Args::parse();

    println!("transrs: beam search translation");

    let config = TranslateConfig {
        model: args.model,
        data: args.data,
        output: args.output,
        beam: BeamConfig::new(args.beam_size, args.max_seq_len).with_length_penalty(args.length_penalty),
        no_cuda: args.no_cuda,
        parallel: args.parallel,
        limit: args.limit,
    };

    info!(
        "Beam size {}, max length {}, length penalty {}",
        config.beam.beam_width, config.beam.max_len, config.beam.length_penalty
    );

    match run(&config) {
        Ok(summary) => {
            info!(
                "Finished: {} sentences, {} truncated, {} unfinished",
                summary.examples, summary.truncated, summary.unfinished
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
