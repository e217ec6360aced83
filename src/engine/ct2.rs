// ct2.rs
//
// Copyright (c) 2024 Junpei Kawamoto
//
// This software is released under the MIT License.
//
// http://opensource.org/licenses/mit-license.php

use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use ct2rs::auto::Tokenizer as AutoTokenizer;
use ct2rs::config::Config;
use ct2rs::sys::Translator;
use ct2rs::{Tokenizer, TranslationOptions};
use tracing::debug;

use super::{load_tokenizer, Engine, GenerationOptions};
use crate::unit::EncodedUnit;
use crate::vocab::Vocabulary;

/// Runs a CTranslate2 model on pre-tokenized input.
///
/// The model consumes SentencePiece pieces, so input ids are mapped back to
/// pieces through the Marian vocabulary before translation. Output pieces are
/// decoded with the model's target tokenizer.
pub struct Ct2Engine {
    inner: Translator,
    tokenizer: AutoTokenizer,
    options: TranslationOptions<String>,
    vocab: Arc<Vocabulary>,
}

impl Ct2Engine {
    pub fn new<P: AsRef<Path>>(
        model_path: P,
        options: &GenerationOptions,
        vocab: Arc<Vocabulary>,
    ) -> Result<Self> {
        let model_path = model_path.as_ref();
        let config = Config {
            num_threads_per_replica: options.threads.max(1),
            ..Default::default()
        };
        let inner = Translator::new(model_path, &config).with_context(|| {
            format!(
                "failed to initialize a translator from {}",
                model_path.display()
            )
        })?;
        let tokenizer = load_tokenizer(model_path)?;
        debug!("loaded CTranslate2 model from {}", model_path.display());

        Ok(Self {
            inner,
            tokenizer,
            options: TranslationOptions {
                beam_size: options.beam_size.max(1),
                repetition_penalty: options.repetition_penalty,
                no_repeat_ngram_size: options.no_repeat_ngram_size,
                max_decoding_length: options.max_decoding_length,
                ..Default::default()
            },
            vocab,
        })
    }
}

impl Engine for Ct2Engine {
    fn translate(&self, unit: &EncodedUnit) -> Result<String> {
        let source = vec![self.vocab.to_pieces(&unit.input_ids)?];
        let result = self
            .inner
            .translate_batch(&source, &self.options, None)?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("translator returned no result"))?;
        let hypothesis = result
            .hypotheses
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("translator returned no hypothesis"))?;

        self.tokenizer.decode(hypothesis)
    }
}
