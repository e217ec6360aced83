// error.rs
//
// Copyright (c) 2024 Junpei Kawamoto
//
// This software is released under the MIT License.
//
// http://opensource.org/licenses/mit-license.php

use std::num::ParseIntError;

use thiserror::Error;

/// Reasons a line of a tag file is rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("expected {expected} comma separated fields, found {found}")]
    FieldCount { expected: usize, found: usize },

    #[error("invalid {field}: {source}")]
    Identity {
        field: &'static str,
        #[source]
        source: ParseIntError,
    },

    #[error("invalid tag type: {0}")]
    TagType(String),

    #[error("no input_ids/attention_mask tensor pair found")]
    TensorMismatch,

    #[error("summarised tensor cannot be recovered")]
    Summarised,

    #[error("invalid element {value:?} in {tensor}")]
    Element { tensor: &'static str, value: String },

    #[error("input_ids is empty")]
    EmptyInput,
}
