// onnx.rs
//
// Copyright (c) 2024 Junpei Kawamoto
//
// This software is released under the MIT License.
//
// http://opensource.org/licenses/mit-license.php

use std::cell::RefCell;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use ct2rs::auto::Tokenizer as AutoTokenizer;
use ct2rs::Tokenizer;
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Value;
use tracing::{debug, warn};

use super::decode::next_token;
use super::{load_tokenizer, Engine, GenerationOptions, ONNX_DECODER_FILE, ONNX_ENCODER_FILE};
use crate::unit::EncodedUnit;
use crate::vocab::Vocabulary;

/// Greedy decoding over an encoder/decoder ONNX export.
///
/// The decoder runs without a key/value cache, so every step feeds the whole
/// prefix generated so far. Beam search is not supported.
pub struct OnnxEngine {
    encoder: RefCell<Session>,
    decoder: RefCell<Session>,
    tokenizer: AutoTokenizer,
    options: GenerationOptions,
    vocab: Arc<Vocabulary>,
}

fn build_session(path: &Path, threads: usize) -> Result<Session> {
    if !path.exists() {
        bail!("ONNX model not found at {}", path.display());
    }
    Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_intra_threads(threads.max(1))?
        .commit_from_file(path)
        .with_context(|| format!("failed to load ONNX model {}", path.display()))
}

impl OnnxEngine {
    pub fn new<P: AsRef<Path>>(
        model_dir: P,
        options: &GenerationOptions,
        vocab: Arc<Vocabulary>,
    ) -> Result<Self> {
        let model_dir = model_dir.as_ref();
        if options.beam_size > 1 {
            warn!(
                "the onnx backend decodes greedily, ignoring beam size {}",
                options.beam_size
            );
        }
        let encoder = build_session(&model_dir.join(ONNX_ENCODER_FILE), options.threads)?;
        let decoder = build_session(&model_dir.join(ONNX_DECODER_FILE), options.threads)?;
        let tokenizer = load_tokenizer(model_dir)?;
        debug!("loaded ONNX encoder and decoder from {}", model_dir.display());

        Ok(Self {
            encoder: RefCell::new(encoder),
            decoder: RefCell::new(decoder),
            tokenizer,
            options: options.clone(),
            vocab,
        })
    }

    /// Returns the encoder hidden states and their shape.
    fn encode(&self, unit: &EncodedUnit) -> Result<([usize; 3], Vec<f32>)> {
        let len = unit.input_ids.len();
        let input_ids = Value::from_array(([1usize, len], unit.input_ids.clone()))?;
        let attention_mask = Value::from_array(([1usize, len], self.mask(unit)))?;

        let mut encoder = self.encoder.borrow_mut();
        let outputs = encoder.run(ort::inputs![
            "input_ids" => input_ids,
            "attention_mask" => attention_mask
        ])?;
        let (shape, data) = match outputs.get("last_hidden_state") {
            Some(output) => output.try_extract_tensor::<f32>()?,
            None => bail!("encoder produced no last_hidden_state"),
        };
        if shape.len() != 3 {
            bail!("unexpected encoder output shape {:?}", shape);
        }
        let dims = [shape[0] as usize, shape[1] as usize, shape[2] as usize];
        Ok((dims, data.to_vec()))
    }

    /// The model expects a mask as long as the input, whatever the file said.
    fn mask(&self, unit: &EncodedUnit) -> Vec<i64> {
        let mut mask = unit.attention_mask.clone();
        mask.resize(unit.input_ids.len(), 1);
        mask
    }

    fn step(
        &self,
        tokens: &[i64],
        mask: &[i64],
        hidden: &([usize; 3], Vec<f32>),
    ) -> Result<Vec<f32>> {
        let input_ids = Value::from_array(([1usize, tokens.len()], tokens.to_vec()))?;
        let encoder_attention_mask = Value::from_array(([1usize, mask.len()], mask.to_vec()))?;
        let encoder_hidden_states = Value::from_array((hidden.0, hidden.1.clone()))?;

        let mut decoder = self.decoder.borrow_mut();
        let outputs = decoder.run(ort::inputs![
            "input_ids" => input_ids,
            "encoder_attention_mask" => encoder_attention_mask,
            "encoder_hidden_states" => encoder_hidden_states
        ])?;
        let (shape, data) = match outputs.get("logits") {
            Some(output) => output.try_extract_tensor::<f32>()?,
            None => bail!("decoder produced no logits"),
        };
        let vocab_size = match shape.last() {
            Some(&v) if v > 0 => v as usize,
            _ => bail!("unexpected decoder output shape {:?}", shape),
        };
        if data.len() < vocab_size {
            bail!(
                "decoder returned {} logits for vocabulary of {}",
                data.len(),
                vocab_size
            );
        }
        Ok(data[data.len() - vocab_size..].to_vec())
    }
}

impl Engine for OnnxEngine {
    fn translate(&self, unit: &EncodedUnit) -> Result<String> {
        let hidden = self.encode(unit)?;
        let mask = self.mask(unit);

        let mut tokens = vec![self.vocab.pad_id()];
        while tokens.len() <= self.options.max_decoding_length {
            let mut logits = self.step(&tokens, &mask, &hidden)?;
            let Some(next) = next_token(
                &mut logits,
                &tokens,
                &[self.vocab.pad_id()],
                self.options.repetition_penalty,
                self.options.no_repeat_ngram_size,
            ) else {
                break;
            };
            tokens.push(next);
            if next == self.vocab.eos_id() {
                break;
            }
        }

        self.tokenizer.decode(self.vocab.output_pieces(&tokens))
    }
}
