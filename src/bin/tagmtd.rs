// tagmtd.rs
//
// Copyright (c) 2024 Junpei Kawamoto
//
// This software is released under the MIT License.
//
// http://opensource.org/licenses/mit-license.php

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tokio::signal;
use tokio::sync::oneshot;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tagmt::engine::{Backend, GenerationOptions, ModelFactory};
use tagmt::model::{model_dir, DEFAULT_MODEL};
use tagmt::socket::SocketFile;
use tagmt::{Server, WorkerPool};

#[derive(Parser, Debug)]
#[command(author, version, about = "Serves a resident translation worker pool", long_about = None)]
struct Args {
    /// Specifies the name of the model to be used.
    #[arg(short, long, value_name = "NAME", default_value = DEFAULT_MODEL)]
    model: String,
    /// Loads the model from the specified directory.
    #[arg(long, value_name = "DIR", env = "TAGMT_MODEL_DIR")]
    model_dir: Option<PathBuf>,
    /// Specifies the path to the socket file.
    #[arg(long)]
    socket_file: Option<PathBuf>,
    /// Number of worker threads.
    #[arg(short, long, env = "TAGMT_WORKERS", default_value_t = 4)]
    workers: usize,
    #[arg(long, value_enum, default_value_t = Backend::Ct2)]
    backend: Backend,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("tagmt=info,tagmtd=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let model_dir = model_dir(&args.model, args.model_dir)?;

    let (tx, rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            tx.send(()).ok();
        }
    });

    let socket_file = match args.socket_file {
        Some(path) => SocketFile::with_path(path)?,
        None => SocketFile::new()?,
    };
    let factory = ModelFactory::new(args.backend, model_dir, GenerationOptions::default())?;
    let server = Server::new(WorkerPool::start_checked(args.workers, factory)?);
    server
        .serve(&socket_file, async move {
            if let Err(e) = rx.await {
                warn!("failed to receive a signal: {e}");
            }
        })
        .await?;
    info!("shut down");

    Ok(())
}
