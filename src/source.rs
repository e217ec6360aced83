// source.rs
//
// Copyright (c) 2024 Junpei Kawamoto
//
// This software is released under the MIT License.
//
// http://opensource.org/licenses/mit-license.php

//! Readers for the line oriented tag files produced by the document tooling.
//!
//! Both readers are lenient: a line that cannot be parsed is logged and
//! skipped, and only I/O errors abort reading.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::io::BufRead;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use regex::Regex;
use tracing::{debug, warn};

use crate::error::ParseError;
use crate::unit::{EncodedUnit, Mode, RawUnit, UnitKey};

/// Tag type of translatable paragraphs in chapter mode raw tags.
const TEXT_TAG: u32 = 0;

fn tensor_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^\s*tensor\(\[\[(.*?)\]\]\)\s*,\s*tensor\(\[\[(.*?)\]\]\)\s*$")
            .expect("tensor pattern is a valid regex")
    })
}

fn strip_line_end(line: &str) -> &str {
    line.trim_end_matches(['\r', '\n'])
}

/// Splits `line` into the identity fields of `mode` and the remainder.
fn split_key<'a>(
    mode: Mode,
    line: &'a str,
    extra: usize,
) -> Result<(UnitKey, &'a str), ParseError> {
    let expected = mode.key_fields() + extra;
    let fields: Vec<&str> = line.splitn(mode.key_fields() + 1, ',').collect();
    if fields.len() != mode.key_fields() + 1 {
        return Err(ParseError::FieldCount {
            expected,
            found: fields.len(),
        });
    }

    let key = match mode {
        Mode::Chapter => UnitKey::chapter(
            parse_identity("chapter", fields[0])?,
            parse_identity("position", fields[1])?,
        ),
        Mode::Flat => UnitKey::flat(parse_identity("position", fields[0])?),
    };
    Ok((key, fields[mode.key_fields()]))
}

fn parse_identity(field: &'static str, value: &str) -> Result<u32, ParseError> {
    value
        .trim()
        .parse()
        .map_err(|source| ParseError::Identity { field, source })
}

fn parse_elements(tensor: &'static str, body: &str) -> Result<Vec<i64>, ParseError> {
    if body.contains("...") {
        return Err(ParseError::Summarised);
    }
    body.split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(|v| {
            v.parse().map_err(|_| ParseError::Element {
                tensor,
                value: v.to_string(),
            })
        })
        .collect()
}

/// Tells extra leading fields apart from a broken tensor pair.
fn tensor_error(mode: Mode, rest: &str) -> ParseError {
    match rest.find("tensor(") {
        Some(start) if start > 0 => ParseError::FieldCount {
            expected: mode.key_fields() + 1,
            found: mode.key_fields() + rest[..start].matches(',').count() + 1,
        },
        _ => ParseError::TensorMismatch,
    }
}

/// Parses one line of an encoded tags file.
pub fn parse_encoded_line(mode: Mode, line: &str) -> Result<EncodedUnit, ParseError> {
    let (key, rest) = split_key(mode, strip_line_end(line), 1)?;

    let captures = tensor_pattern()
        .captures(rest)
        .ok_or_else(|| tensor_error(mode, rest))?;
    let input_ids = parse_elements("input_ids", &captures[1])?;
    let attention_mask = parse_elements("attention_mask", &captures[2])?;
    if input_ids.is_empty() {
        return Err(ParseError::EmptyInput);
    }

    Ok(EncodedUnit {
        key,
        input_ids,
        attention_mask,
    })
}

/// Reads every well formed unit of an encoded tags file.
///
/// A later line with an already seen key replaces the earlier unit in place.
pub fn read_encoded<R: BufRead>(mode: Mode, reader: R) -> Result<Vec<EncodedUnit>> {
    let mut units: Vec<EncodedUnit> = Vec::new();
    let mut index: HashMap<UnitKey, usize> = HashMap::new();

    for (n, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("failed to read line {}", n + 1))?;
        if line.trim().is_empty() {
            continue;
        }

        let unit = match parse_encoded_line(mode, &line) {
            Ok(unit) => unit,
            Err(e) => {
                warn!(line = n + 1, "skipping malformed line: {e}");
                continue;
            }
        };
        if unit.input_ids.len() != unit.attention_mask.len() {
            warn!(
                "shape mismatch at {}: input_ids {}, attention_mask {}",
                unit.key,
                unit.input_ids.len(),
                unit.attention_mask.len()
            );
        }

        match index.entry(unit.key) {
            Entry::Occupied(e) => {
                debug!("{} appears again on line {}", unit.key, n + 1);
                units[*e.get()] = unit;
            }
            Entry::Vacant(e) => {
                e.insert(units.len());
                units.push(unit);
            }
        }
    }

    Ok(units)
}

/// Removes a leading target language marker such as `>>jpn<<`.
fn strip_language_marker(text: &str) -> &str {
    let trimmed = text.trim_start();
    if let Some(rest) = trimmed.strip_prefix(">>") {
        if let Some(end) = rest.find("<<") {
            let code = &rest[..end];
            if !code.is_empty() && code.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return &rest[end + 2..];
            }
        }
    }
    text
}

/// Parses one line of a raw tags file.
///
/// Returns `None` for lines that carry nothing to translate: non-text tags
/// in chapter mode and blank text.
pub fn parse_raw_line(mode: Mode, line: &str) -> Result<Option<RawUnit>, ParseError> {
    let line = strip_line_end(line);
    let rest = match mode {
        Mode::Chapter => {
            let (tag, rest) = line.split_once(',').ok_or(ParseError::FieldCount {
                expected: 4,
                found: 1,
            })?;
            let tag: u32 = tag
                .trim()
                .parse()
                .map_err(|_| ParseError::TagType(tag.to_string()))?;
            if tag != TEXT_TAG {
                return Ok(None);
            }
            rest
        }
        Mode::Flat => line,
    };

    let (key, text) = split_key(mode, rest, 1).map_err(|e| match e {
        ParseError::FieldCount { expected, found } if mode == Mode::Chapter => {
            ParseError::FieldCount {
                expected: expected + 1,
                found: found + 1,
            }
        }
        e => e,
    })?;
    let text = strip_language_marker(text).trim();
    if text.is_empty() {
        return Ok(None);
    }

    Ok(Some(RawUnit {
        key,
        text: text.to_string(),
    }))
}

/// Reads every translatable unit of a raw tags file.
pub fn read_raw<R: BufRead>(mode: Mode, reader: R) -> Result<Vec<RawUnit>> {
    let mut units = Vec::new();
    for (n, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("failed to read line {}", n + 1))?;
        if line.trim().is_empty() {
            continue;
        }
        match parse_raw_line(mode, &line) {
            Ok(Some(unit)) => units.push(unit),
            Ok(None) => {}
            Err(e) => warn!(line = n + 1, "skipping malformed line: {e}"),
        }
    }
    Ok(units)
}

pub(crate) fn format_key(key: &UnitKey) -> String {
    match key.chapter {
        Some(chapter) => format!("{},{}", chapter, key.position),
        None => key.position.to_string(),
    }
}

fn format_tensor(values: &[i64]) -> String {
    let body = values
        .iter()
        .map(i64::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    format!("tensor([[{body}]])")
}

/// Formats a unit as one line of an encoded tags file, without the newline.
pub fn format_encoded(unit: &EncodedUnit) -> String {
    format!(
        "{},{},{}",
        format_key(&unit.key),
        format_tensor(&unit.input_ids),
        format_tensor(&unit.attention_mask)
    )
}
