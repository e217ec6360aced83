// vocab.rs
//
// Copyright (c) 2024 Junpei Kawamoto
//
// This software is released under the MIT License.
//
// http://opensource.org/licenses/mit-license.php

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use anyhow::{anyhow, Context, Result};

pub const VOCAB_FILE: &str = "vocab.json";

const EOS: &str = "</s>";
const PAD: &str = "<pad>";
const UNK: &str = "<unk>";

/// Shared source/target vocabulary of a Marian model.
#[derive(Debug, Clone)]
pub struct Vocabulary {
    pieces: HashMap<i64, String>,
    ids: HashMap<String, i64>,
    eos: i64,
    pad: i64,
    unk: i64,
}

impl Vocabulary {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("failed to open vocabulary {}", path.display()))?;
        let ids: HashMap<String, i64> = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("failed to parse vocabulary {}", path.display()))?;
        Self::from_ids(ids)
    }

    pub fn from_model_dir<P: AsRef<Path>>(model_dir: P) -> Result<Self> {
        Self::from_file(model_dir.as_ref().join(VOCAB_FILE))
    }

    pub fn from_ids(ids: HashMap<String, i64>) -> Result<Self> {
        let special = |piece: &str| {
            ids.get(piece)
                .copied()
                .ok_or_else(|| anyhow!("vocabulary has no {piece} entry"))
        };
        let eos = special(EOS)?;
        let pad = special(PAD)?;
        let unk = special(UNK)?;
        let pieces = ids.iter().map(|(p, &id)| (id, p.clone())).collect();

        Ok(Self {
            pieces,
            ids,
            eos,
            pad,
            unk,
        })
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn eos_id(&self) -> i64 {
        self.eos
    }

    /// Also the decoder start token of Marian models.
    pub fn pad_id(&self) -> i64 {
        self.pad
    }

    pub fn piece_to_id(&self, piece: &str) -> i64 {
        self.ids.get(piece).copied().unwrap_or(self.unk)
    }

    pub fn id_to_piece(&self, id: i64) -> Option<&str> {
        self.pieces.get(&id).map(String::as_str)
    }

    pub fn is_special(&self, id: i64) -> bool {
        id == self.eos || id == self.pad || id == self.unk
    }

    /// Maps input ids to pieces, dropping trailing padding.
    pub fn to_pieces(&self, ids: &[i64]) -> Result<Vec<String>> {
        let end = ids
            .iter()
            .rposition(|&id| id != self.pad)
            .map_or(0, |i| i + 1);
        ids[..end]
            .iter()
            .map(|&id| {
                self.id_to_piece(id)
                    .map(str::to_string)
                    .ok_or_else(|| anyhow!("token id {id} is not in the vocabulary"))
            })
            .collect()
    }

    /// Pieces of generated ids, without special or out of vocabulary ids.
    pub fn output_pieces(&self, ids: &[i64]) -> Vec<String> {
        ids.iter()
            .filter(|&&id| !self.is_special(id))
            .filter_map(|&id| self.id_to_piece(id))
            .map(str::to_string)
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample() -> Vocabulary {
        let ids = [
            ("</s>", 0),
            ("<unk>", 1),
            ("\u{2581}Hello", 2),
            (",", 3),
            ("\u{2581}how", 4),
            ("\u{2581}are", 5),
            ("\u{2581}you", 6),
            ("?", 7),
            ("こんにちは", 8),
            ("<pad>", 9),
        ]
        .into_iter()
        .map(|(p, id)| (p.to_string(), id))
        .collect();
        Vocabulary::from_ids(ids).unwrap()
    }

    #[test]
    fn output_pieces_skip_special_tokens() {
        let vocab = sample();
        assert_eq!(
            vocab.output_pieces(&[9, 2, 3, 4, 1, 0, 4242]),
            vec!["\u{2581}Hello", ",", "\u{2581}how"]
        );
        assert!(vocab.output_pieces(&[9, 1, 0]).is_empty());
    }

    #[test]
    fn to_pieces_drops_padding_and_rejects_unknown_ids() {
        let vocab = sample();
        assert_eq!(vocab.to_pieces(&[8, 0, 9, 9]).unwrap(), vec!["こんにちは", "</s>"]);
        assert!(vocab.to_pieces(&[8, 4242]).is_err());
    }

    #[test]
    fn unknown_pieces_map_to_unk() {
        let vocab = sample();
        assert_eq!(vocab.piece_to_id("\u{2581}you"), 6);
        assert_eq!(vocab.piece_to_id("\u{2581}zebra"), 1);
    }

    #[test]
    fn missing_special_tokens_are_rejected() {
        let ids = [("</s>".to_string(), 0)].into_iter().collect();
        assert!(Vocabulary::from_ids(ids).is_err());
    }

    #[test]
    fn loads_vocab_json() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(VOCAB_FILE),
            r#"{"</s>": 0, "<unk>": 1, "<pad>": 60715, "▁cat": 12}"#,
        )
        .unwrap();
        let vocab = Vocabulary::from_model_dir(dir.path()).unwrap();
        assert_eq!(vocab.len(), 4);
        assert_eq!(vocab.pad_id(), 60715);
        assert_eq!(vocab.output_pieces(&[60715, 12, 0]), vec!["▁cat"]);
    }
}
