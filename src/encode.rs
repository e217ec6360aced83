// encode.rs
//
// Copyright (c) 2024 Junpei Kawamoto
//
// This software is released under the MIT License.
//
// http://opensource.org/licenses/mit-license.php

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use ct2rs::auto::Tokenizer as AutoTokenizer;
use tracing::{debug, info, warn};

use crate::engine::load_tokenizer;
use crate::unit::{EncodedUnit, RawUnit};
use crate::vocab::Vocabulary;

/// Splits source text into vocabulary pieces.
pub trait SourceTokenizer {
    fn pieces(&self, text: &str) -> Result<Vec<String>>;
}

impl SourceTokenizer for AutoTokenizer {
    fn pieces(&self, text: &str) -> Result<Vec<String>> {
        ct2rs::Tokenizer::encode(self, text)
    }
}

/// Turns raw text units into model input.
pub struct Encoder<T> {
    tokenizer: T,
    vocab: Arc<Vocabulary>,
}

impl Encoder<AutoTokenizer> {
    /// Uses the tokenizer files found in the model directory.
    pub fn from_model_dir<P: AsRef<Path>>(model_dir: P, vocab: Arc<Vocabulary>) -> Result<Self> {
        Ok(Self::new(load_tokenizer(model_dir.as_ref())?, vocab))
    }
}

impl<T: SourceTokenizer> Encoder<T> {
    pub fn new(tokenizer: T, vocab: Arc<Vocabulary>) -> Self {
        Self { tokenizer, vocab }
    }

    pub fn encode(&self, unit: &RawUnit) -> Result<EncodedUnit> {
        let mut ids: Vec<i64> = self
            .tokenizer
            .pieces(&unit.text)?
            .iter()
            .map(|p| self.vocab.piece_to_id(p))
            .collect();
        if ids.last() != Some(&self.vocab.eos_id()) {
            ids.push(self.vocab.eos_id());
        }
        Ok(EncodedUnit::new(unit.key, ids))
    }

    /// Encodes every unit, skipping the ones the tokenizer rejects.
    pub fn encode_all(&self, units: &[RawUnit]) -> Vec<EncodedUnit> {
        info!("tokenizing {} units", units.len());
        let encoded: Vec<EncodedUnit> = units
            .iter()
            .filter_map(|unit| match self.encode(unit) {
                Ok(encoded) => {
                    debug!("tokenized {} into {} ids", unit.key, encoded.input_ids.len());
                    Some(encoded)
                }
                Err(e) => {
                    warn!("failed to tokenize {}: {e:#}", unit.key);
                    None
                }
            })
            .collect();
        info!("tokenized {} of {} units", encoded.len(), units.len());
        encoded
    }
}
