// lib.rs
//
// Copyright (c) 2024 Junpei Kawamoto
//
// This software is released under the MIT License.
//
// http://opensource.org/licenses/mit-license.php

//! Parallel batch translation of tokenized text units.
//!
//! Units are read from a tag file ([`source`]), translated by a fixed pool of
//! workers ([`pool`]) and written back keyed by their original identity
//! ([`sink`]). A resident pool can also be served over a Unix socket
//! ([`Server`]) and used remotely ([`Client`]).

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Error, Result};
use tokio::net::{UnixListener, UnixStream};
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::{Channel, Endpoint, Server as TonicServer, Uri};
use tonic::{Request, Response, Status};
use tower::service_fn;
use tracing::info;

use proto::translator_client::TranslatorClient;
use proto::translator_server::{Translator as TranslationService, TranslatorServer};
use proto::{Request as TranslationRequest, Response as TranslationResponse};

pub mod encode;
pub mod engine;
pub mod error;
pub mod model;
pub mod pool;
pub mod sink;
pub mod socket;
pub mod source;
pub mod unit;
pub mod vocab;

pub use pool::WorkerPool;
pub use unit::{EncodedUnit, Failure, Mode, RawUnit, Report, Translation, UnitKey};

mod proto {
    tonic::include_proto!("tagmt");
}

impl From<UnitKey> for proto::Key {
    fn from(key: UnitKey) -> Self {
        Self {
            chapter: key.chapter,
            position: key.position,
        }
    }
}

impl From<proto::Key> for UnitKey {
    fn from(key: proto::Key) -> Self {
        Self {
            chapter: key.chapter,
            position: key.position,
        }
    }
}

fn required_key(key: Option<proto::Key>) -> Result<UnitKey, Status> {
    key.map(UnitKey::from)
        .ok_or_else(|| Status::invalid_argument("unit without a key"))
}

impl From<EncodedUnit> for proto::Unit {
    fn from(unit: EncodedUnit) -> Self {
        Self {
            key: Some(unit.key.into()),
            input_ids: unit.input_ids,
            attention_mask: unit.attention_mask,
        }
    }
}

impl TryFrom<proto::Unit> for EncodedUnit {
    type Error = Status;

    fn try_from(unit: proto::Unit) -> Result<Self, Self::Error> {
        if unit.input_ids.is_empty() {
            return Err(Status::invalid_argument("unit without input_ids"));
        }
        Ok(Self {
            key: required_key(unit.key)?,
            input_ids: unit.input_ids,
            attention_mask: unit.attention_mask,
        })
    }
}

impl From<Report> for TranslationResponse {
    fn from(report: Report) -> Self {
        Self {
            results: report
                .translations
                .into_iter()
                .map(|t| proto::Translation {
                    key: Some(t.key.into()),
                    text: t.text,
                })
                .collect(),
            failures: report
                .failures
                .into_iter()
                .map(|f| proto::Failure {
                    key: Some(f.key.into()),
                    reason: f.reason,
                })
                .collect(),
        }
    }
}

impl TryFrom<TranslationResponse> for Report {
    type Error = Status;

    fn try_from(res: TranslationResponse) -> Result<Self, Self::Error> {
        let mut report = Report::default();
        for t in res.results {
            report.translations.push(Translation {
                key: required_key(t.key)?,
                text: t.text,
            });
        }
        for f in res.failures {
            report.failures.push(Failure {
                key: required_key(f.key)?,
                reason: f.reason,
            });
        }
        report.sort();
        Ok(report)
    }
}

pub struct Client {
    inner: TranslatorClient<Channel>,
}

impl Client {
    pub async fn new(socket_file: PathBuf) -> Result<Self> {
        let channel = Endpoint::try_from("http://[::]:50051")?
            .connect_with_connector(service_fn(move |_: Uri| {
                // Connect to a Uds socket
                UnixStream::connect(socket_file.clone())
            }))
            .await?;
        Ok(Self {
            inner: TranslatorClient::new(channel),
        })
    }

    pub async fn translate(&mut self, units: Vec<EncodedUnit>) -> Result<Report> {
        let res = self
            .inner
            .translate(Request::new(TranslationRequest {
                units: units.into_iter().map(proto::Unit::from).collect(),
            }))
            .await?;
        Ok(Report::try_from(res.into_inner())?)
    }
}

/// Serves a resident worker pool.
pub struct Server {
    pool: Arc<WorkerPool>,
}

impl Server {
    pub fn new(pool: WorkerPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub async fn serve<P, F>(self, socket_file: P, signal: F) -> Result<()>
    where
        P: AsRef<Path>,
        F: Future<Output = ()>,
    {
        info!("listening on {}", socket_file.as_ref().display());
        TonicServer::builder()
            .add_service(TranslatorServer::new(self))
            .serve_with_incoming_shutdown(
                // Use a reference to `socket_file` to ensure it remains valid until the function
                // ends.
                UnixListenerStream::new(UnixListener::bind(&socket_file)?),
                signal,
            )
            .await
            .map_err(Error::from)
    }
}

#[tonic::async_trait]
impl TranslationService for Server {
    async fn translate(
        &self,
        req: Request<TranslationRequest>,
    ) -> Result<Response<TranslationResponse>, Status> {
        let units = req
            .into_inner()
            .units
            .into_iter()
            .map(EncodedUnit::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        let pool = self.pool.clone();
        let report = tokio::task::spawn_blocking(move || pool.dispatch(units))
            .await
            .map_err(|e| Status::internal(e.to_string()))?
            .map_err(|e| Status::unavailable(format!("{e:#}")))?;
        Ok(Response::new(report.into()))
    }
}
