// main.rs
//
// Copyright (c) 2024 Junpei Kawamoto
//
// This software is released under the MIT License.
//
// http://opensource.org/licenses/mit-license.php

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use spinners::{Spinner, Spinners};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tagmt::encode::Encoder;
use tagmt::engine::{Backend, GenerationOptions, ModelFactory};
use tagmt::model::{self, DEFAULT_FILES, DEFAULT_MODEL, DEFAULT_REPO};
use tagmt::sink::{write_encoded, write_translations};
use tagmt::source::{read_encoded, read_raw};
use tagmt::vocab::Vocabulary;
use tagmt::{Client, EncodedUnit, Mode, Report, WorkerPool};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Tokenizes raw tags into encoded tags.
    Encode {
        #[command(flatten)]
        model: ModelArgs,
        /// Raw tags file.
        #[arg(short, long, value_name = "FILE", default_value = "rawTags.txt")]
        input: PathBuf,
        /// Encoded tags file to write.
        #[arg(short, long, value_name = "FILE", default_value = "encodedTags.txt")]
        output: PathBuf,
        #[arg(long, value_enum, default_value_t = Mode::Chapter)]
        mode: Mode,
    },
    /// Translates encoded tags with a pool of workers.
    Translate {
        #[command(flatten)]
        model: ModelArgs,
        #[command(flatten)]
        pool: PoolArgs,
        /// Encoded tags file.
        #[arg(short, long, value_name = "FILE", default_value = "encodedTags.txt")]
        input: PathBuf,
        /// Translated tags file to write.
        #[arg(short, long, value_name = "FILE", default_value = "translatedTags.txt")]
        output: PathBuf,
        #[arg(long, value_enum, default_value_t = Mode::Chapter)]
        mode: Mode,
        /// Sends the units to a running daemon instead of loading the model.
        #[arg(long, value_name = "PATH")]
        socket: Option<PathBuf>,
    },
    /// Tokenizes and translates raw tags in one go.
    Run {
        #[command(flatten)]
        model: ModelArgs,
        #[command(flatten)]
        pool: PoolArgs,
        /// Raw tags file.
        #[arg(short, long, value_name = "FILE", default_value = "rawTags.txt")]
        input: PathBuf,
        /// Translated tags file to write.
        #[arg(short, long, value_name = "FILE", default_value = "translatedTags.txt")]
        output: PathBuf,
        #[arg(long, value_enum, default_value_t = Mode::Chapter)]
        mode: Mode,
    },
    /// Downloads model files from the Hugging Face Hub.
    Fetch {
        #[command(flatten)]
        model: ModelArgs,
        /// Repository to download from.
        #[arg(long, default_value = DEFAULT_REPO)]
        repo: String,
        /// Files to download. Defaults to the vocabulary and tokenizer models.
        #[arg(long = "file", value_name = "NAME")]
        files: Vec<String>,
    },
}

#[derive(Args, Debug)]
struct ModelArgs {
    /// Name of the model to be used.
    #[arg(short, long, value_name = "NAME", default_value = DEFAULT_MODEL)]
    model: String,
    /// Loads the model from the specified directory.
    #[arg(long, value_name = "DIR", env = "TAGMT_MODEL_DIR")]
    model_dir: Option<PathBuf>,
}

impl ModelArgs {
    fn dir(&self) -> Result<PathBuf> {
        model::model_dir(&self.model, self.model_dir.clone())
    }
}

#[derive(Args, Debug)]
struct PoolArgs {
    /// Number of worker threads, each with its own model instance.
    #[arg(short, long, env = "TAGMT_WORKERS", default_value_t = 4)]
    workers: usize,
    /// Translates only the first N units.
    #[arg(long, value_name = "N")]
    limit: Option<usize>,
    #[arg(long, value_enum, default_value_t = Backend::Ct2)]
    backend: Backend,
    #[arg(long, default_value_t = 1)]
    beam_size: usize,
    #[arg(long, default_value_t = 1.5)]
    repetition_penalty: f32,
    #[arg(long, default_value_t = 3)]
    no_repeat_ngram_size: usize,
    #[arg(long, default_value_t = 512)]
    max_decoding_length: usize,
    /// Intra-op threads per worker.
    #[arg(long, default_value_t = 1)]
    threads: usize,
}

impl PoolArgs {
    fn options(&self) -> GenerationOptions {
        GenerationOptions {
            beam_size: self.beam_size,
            repetition_penalty: self.repetition_penalty,
            no_repeat_ngram_size: self.no_repeat_ngram_size,
            max_decoding_length: self.max_decoding_length,
            threads: self.threads,
        }
    }

    fn limit<T>(&self, units: &mut Vec<T>) {
        if let Some(limit) = self.limit {
            units.truncate(limit);
        }
    }
}

fn open(path: &Path) -> Result<BufReader<File>> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    Ok(BufReader::new(file))
}

fn translate_locally(
    model: &ModelArgs,
    pool: &PoolArgs,
    units: Vec<EncodedUnit>,
) -> Result<Report> {
    let factory = ModelFactory::new(pool.backend, model.dir()?, pool.options())?;
    WorkerPool::start_checked(pool.workers, factory)?.dispatch(units)
}

fn translate_remotely(socket: PathBuf, units: Vec<EncodedUnit>) -> Result<Report> {
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async move {
        let mut client = Client::new(socket.clone())
            .await
            .with_context(|| format!("failed to connect to {}", socket.display()))?;
        let mut sp = Spinner::new(Spinners::Dots, "Translating...".to_string());
        let res = client.translate(units).await;
        sp.stop_with_newline();
        let report = res?;
        log_remote_report(&report);
        Ok::<_, anyhow::Error>(report)
    })
}

/// Logs what the daemon reported, as a local dispatch would.
fn log_remote_report(report: &Report) {
    for failure in &report.failures {
        warn!("failed to translate {}: {}", failure.key, failure.reason);
    }
    info!(
        "received {} results, {} failed",
        report.translations.len(),
        report.failures.len()
    );
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tagmt=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match Cli::parse().command {
        Command::Encode {
            model,
            input,
            output,
            mode,
        } => {
            let dir = model.dir()?;
            let units = read_raw(mode, open(&input)?)?;
            let vocab = Vocabulary::from_model_dir(&dir)?.into();
            let encoded = Encoder::from_model_dir(&dir, vocab)?.encode_all(&units);
            write_encoded(&output, &encoded)?;
        }
        Command::Translate {
            model,
            pool,
            input,
            output,
            mode,
            socket,
        } => {
            let mut units = read_encoded(mode, open(&input)?)?;
            pool.limit(&mut units);
            let report = match socket {
                Some(socket) => translate_remotely(socket, units)?,
                None => translate_locally(&model, &pool, units)?,
            };
            write_translations(&output, &report.translations)?;
        }
        Command::Run {
            model,
            pool,
            input,
            output,
            mode,
        } => {
            let dir = model.dir()?;
            let mut raw = read_raw(mode, open(&input)?)?;
            pool.limit(&mut raw);
            let factory = ModelFactory::new(pool.backend, dir.clone(), pool.options())?;
            let encoder = Encoder::from_model_dir(&dir, factory.vocab().clone())?;
            let workers = WorkerPool::start_checked(pool.workers, factory)?;
            let report = workers.dispatch(encoder.encode_all(&raw))?;
            write_translations(&output, &report.translations)?;
        }
        Command::Fetch { model, repo, files } => {
            let dir = model.dir()?;
            if files.is_empty() {
                model::fetch(&repo, &DEFAULT_FILES[..], &dir)?;
            } else {
                model::fetch(&repo, &files[..], &dir)?;
            }
            info!("model files are in {}", dir.display());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::{Arc, Mutex};

    use tagmt::{Failure, UnitKey};

    use super::*;

    fn pool_args(args: &[&str]) -> PoolArgs {
        let mut argv = vec!["tagmt", "translate"];
        argv.extend_from_slice(args);
        match Cli::try_parse_from(argv).unwrap().command {
            Command::Translate { pool, .. } => pool,
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn limit_keeps_the_first_units() {
        let mut units: Vec<u32> = (0..10).collect();
        pool_args(&["--limit", "3"]).limit(&mut units);
        assert_eq!(units, vec![0, 1, 2]);
    }

    #[test]
    fn no_limit_keeps_everything() {
        let mut units: Vec<u32> = (0..10).collect();
        pool_args(&[]).limit(&mut units);
        assert_eq!(units.len(), 10);
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn remote_failures_are_logged() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();

        let report = Report {
            translations: vec![],
            failures: vec![Failure {
                key: UnitKey::chapter(2, 5),
                reason: "inference panicked".to_string(),
            }],
        };
        tracing::subscriber::with_default(subscriber, || log_remote_report(&report));

        let logs = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        assert!(logs.contains("WARN"), "{logs}");
        assert!(
            logs.contains("failed to translate chapter 2 position 5: inference panicked"),
            "{logs}"
        );
        assert!(logs.contains("received 0 results, 1 failed"), "{logs}");
    }

    #[test]
    fn generation_defaults_match_the_library() {
        assert_eq!(pool_args(&[]).options(), GenerationOptions::default());
    }
}
