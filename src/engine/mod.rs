// mod.rs
//
// Copyright (c) 2024 Junpei Kawamoto
//
// This software is released under the MIT License.
//
// http://opensource.org/licenses/mit-license.php

//! Inference backends.
//!
//! An [`Engine`] is owned by a single worker and is never shared between
//! threads. The [`EngineFactory`] that builds engines is shared by all
//! workers, so it must be `Send + Sync`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::ValueEnum;
use ct2rs::auto::Tokenizer as AutoTokenizer;

use crate::unit::EncodedUnit;
use crate::vocab::Vocabulary;

mod ct2;
pub mod decode;
#[cfg(feature = "onnx")]
mod onnx;

pub use ct2::Ct2Engine;
#[cfg(feature = "onnx")]
pub use onnx::OnnxEngine;

pub trait Engine {
    /// Generates a translation of `unit` and returns it as text.
    fn translate(&self, unit: &EncodedUnit) -> Result<String>;
}

pub trait EngineFactory: Send + Sync {
    fn load(&self) -> Result<Box<dyn Engine>>;

    /// Fails if engines cannot be built at all. Loads one engine by default.
    fn check(&self) -> Result<()> {
        self.load().map(drop)
    }
}

impl<F> EngineFactory for F
where
    F: Fn() -> Result<Box<dyn Engine>> + Send + Sync,
{
    fn load(&self) -> Result<Box<dyn Engine>> {
        self()
    }
}

pub(crate) const CT2_MODEL_FILE: &str = "model.bin";
pub(crate) const ONNX_ENCODER_FILE: &str = "encoder_model.onnx";
pub(crate) const ONNX_DECODER_FILE: &str = "decoder_model.onnx";

/// Loads the SentencePiece tokenizers of a model directory.
pub(crate) fn load_tokenizer(model_dir: &Path) -> Result<AutoTokenizer> {
    AutoTokenizer::new(model_dir)
        .with_context(|| format!("failed to load a tokenizer from {}", model_dir.display()))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    /// CTranslate2 conversion of the model.
    #[default]
    Ct2,
    /// ONNX encoder/decoder export of the model.
    Onnx,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOptions {
    pub beam_size: usize,
    pub repetition_penalty: f32,
    pub no_repeat_ngram_size: usize,
    pub max_decoding_length: usize,
    /// Intra-op threads given to each worker's engine.
    pub threads: usize,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            beam_size: 1,
            repetition_penalty: 1.5,
            no_repeat_ngram_size: 3,
            max_decoding_length: 512,
            threads: 1,
        }
    }
}

/// Loads engines for a model directory.
pub struct ModelFactory {
    backend: Backend,
    model_dir: PathBuf,
    options: GenerationOptions,
    vocab: Arc<Vocabulary>,
}

impl ModelFactory {
    pub fn new(backend: Backend, model_dir: PathBuf, options: GenerationOptions) -> Result<Self> {
        let vocab = Arc::new(Vocabulary::from_model_dir(&model_dir)?);
        Ok(Self {
            backend,
            model_dir,
            options,
            vocab,
        })
    }

    pub fn vocab(&self) -> &Arc<Vocabulary> {
        &self.vocab
    }
}

impl Backend {
    /// Files a model directory must hold for this backend.
    pub fn model_files(self) -> &'static [&'static str] {
        match self {
            Backend::Ct2 => &[CT2_MODEL_FILE],
            Backend::Onnx => &[ONNX_ENCODER_FILE, ONNX_DECODER_FILE],
        }
    }
}

impl EngineFactory for ModelFactory {
    fn check(&self) -> Result<()> {
        for file in self.backend.model_files() {
            if !self.model_dir.join(file).is_file() {
                bail!(
                    "{file} not found in {}; the {:?} backend needs a converted model there",
                    self.model_dir.display(),
                    self.backend
                );
            }
        }
        self.load().map(drop)
    }

    fn load(&self) -> Result<Box<dyn Engine>> {
        match self.backend {
            Backend::Ct2 => Ok(Box::new(Ct2Engine::new(
                &self.model_dir,
                &self.options,
                self.vocab.clone(),
            )?)),
            #[cfg(feature = "onnx")]
            Backend::Onnx => Ok(Box::new(OnnxEngine::new(
                &self.model_dir,
                &self.options,
                self.vocab.clone(),
            )?)),
            #[cfg(not(feature = "onnx"))]
            Backend::Onnx => Err(anyhow::anyhow!(
                "the onnx backend requires building with the `onnx` feature"
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs::write;

    use super::*;
    use crate::vocab::VOCAB_FILE;

    fn model_dir_with_vocab() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path().join(VOCAB_FILE),
            r#"{"</s>": 0, "<unk>": 1, "<pad>": 2}"#,
        )
        .unwrap();
        dir
    }

    #[test]
    fn missing_model_file_fails_the_check() {
        let dir = model_dir_with_vocab();
        let factory = ModelFactory::new(
            Backend::Ct2,
            dir.path().to_path_buf(),
            GenerationOptions::default(),
        )
        .unwrap();

        let err = factory.check().unwrap_err().to_string();
        assert!(err.contains(CT2_MODEL_FILE), "{err}");
    }

    #[test]
    fn onnx_backend_needs_both_graphs() {
        let dir = model_dir_with_vocab();
        write(dir.path().join(ONNX_ENCODER_FILE), b"").unwrap();
        let factory = ModelFactory::new(
            Backend::Onnx,
            dir.path().to_path_buf(),
            GenerationOptions::default(),
        )
        .unwrap();

        let err = factory.check().unwrap_err().to_string();
        assert!(err.contains(ONNX_DECODER_FILE), "{err}");
    }

    #[test]
    fn default_check_loads_one_engine() {
        let failing = || -> Result<Box<dyn Engine>> { bail!("no model") };
        assert!(failing.check().is_err());
    }
}
