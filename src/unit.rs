// unit.rs
//
// Copyright (c) 2024 Junpei Kawamoto
//
// This software is released under the MIT License.
//
// http://opensource.org/licenses/mit-license.php

use std::fmt::{Display, Formatter};

use clap::ValueEnum;

/// How units are identified in the tag files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// Units keyed by chapter and position (EPUB).
    #[value(alias = "0")]
    Chapter,
    /// Units keyed by position only (PDF).
    #[value(alias = "1")]
    Flat,
}

impl Mode {
    /// Number of leading identity fields on a line.
    pub fn key_fields(self) -> usize {
        match self {
            Mode::Chapter => 2,
            Mode::Flat => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitKey {
    pub chapter: Option<u32>,
    pub position: u32,
}

impl UnitKey {
    pub fn chapter(chapter: u32, position: u32) -> Self {
        Self {
            chapter: Some(chapter),
            position,
        }
    }

    pub fn flat(position: u32) -> Self {
        Self {
            chapter: None,
            position,
        }
    }
}

impl Display for UnitKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.chapter {
            Some(chapter) => write!(f, "chapter {} position {}", chapter, self.position),
            None => write!(f, "position {}", self.position),
        }
    }
}

/// A tokenized unit ready for inference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedUnit {
    pub key: UnitKey,
    pub input_ids: Vec<i64>,
    pub attention_mask: Vec<i64>,
}

impl EncodedUnit {
    pub fn new(key: UnitKey, input_ids: Vec<i64>) -> Self {
        let attention_mask = vec![1; input_ids.len()];
        Self {
            key,
            input_ids,
            attention_mask,
        }
    }
}

/// A source text unit before tokenization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawUnit {
    pub key: UnitKey,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Translation {
    pub key: UnitKey,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub key: UnitKey,
    pub reason: String,
}

/// Outcome of translating a set of units.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Report {
    pub translations: Vec<Translation>,
    pub failures: Vec<Failure>,
}

impl Report {
    pub fn sort(&mut self) {
        self.translations.sort_by_key(|t| t.key);
        self.failures.sort_by_key(|f| f.key);
    }

    pub fn total(&self) -> usize {
        self.translations.len() + self.failures.len()
    }
}
