// sink.rs
//
// Copyright (c) 2024 Junpei Kawamoto
//
// This software is released under the MIT License.
//
// http://opensource.org/licenses/mit-license.php

use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use tempfile::NamedTempFile;
use tracing::info;

use crate::source::{format_encoded, format_key};
use crate::unit::{EncodedUnit, Translation};

/// Formats a translation as one line of a translated tags file, without the
/// newline.
pub fn format_translation(translation: &Translation) -> String {
    let text: String = translation
        .text
        .chars()
        .map(|c| if c == '\r' || c == '\n' { ' ' } else { c })
        .collect();
    format!("{},{}", format_key(&translation.key), text)
}

/// Writes `lines` to `path` through a temporary file in the same directory,
/// so readers never observe a partially written file.
pub fn write_lines<P, I>(path: P, lines: I) -> Result<usize>
where
    P: AsRef<Path>,
    I: IntoIterator<Item = String>,
{
    let path = path.as_ref();
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };

    let file = NamedTempFile::new_in(dir)
        .with_context(|| format!("failed to create a temporary file in {}", dir.display()))?;
    let mut writer = BufWriter::new(file);
    let mut count = 0;
    for line in lines {
        writeln!(writer, "{line}")?;
        count += 1;
    }
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.persist(path)
        .with_context(|| format!("failed to write {}", path.display()))?;

    Ok(count)
}

pub fn write_translations<P: AsRef<Path>>(path: P, translations: &[Translation]) -> Result<()> {
    let count = write_lines(&path, translations.iter().map(format_translation))?;
    info!("results written to {} ({} lines)", path.as_ref().display(), count);
    Ok(())
}

pub fn write_encoded<P: AsRef<Path>>(path: P, units: &[EncodedUnit]) -> Result<()> {
    let count = write_lines(&path, units.iter().map(format_encoded))?;
    info!("encoded units written to {} ({} lines)", path.as_ref().display(), count);
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs::read_to_string;

    use super::*;
    use crate::unit::UnitKey;

    #[test]
    fn translations_stay_on_one_line() {
        let t = Translation {
            key: UnitKey::chapter(2, 9),
            text: "Hello,\r\nworld\n".to_string(),
        };
        assert_eq!(format_translation(&t), "2,9,Hello,  world ");

        let t = Translation {
            key: UnitKey::flat(4),
            text: "I am a cat.".to_string(),
        };
        assert_eq!(format_translation(&t), "4,I am a cat.");
    }

    #[test]
    fn writes_replace_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("translatedTags.txt");
        std::fs::write(&path, "stale\n").unwrap();

        write_translations(
            &path,
            &[
                Translation {
                    key: UnitKey::chapter(0, 1),
                    text: "One".to_string(),
                },
                Translation {
                    key: UnitKey::chapter(0, 2),
                    text: "Two".to_string(),
                },
            ],
        )
        .unwrap();
        assert_eq!(read_to_string(&path).unwrap(), "0,1,One\n0,2,Two\n");
    }

    #[test]
    fn empty_output_is_an_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        assert_eq!(write_lines(&path, Vec::new()).unwrap(), 0);
        assert_eq!(read_to_string(&path).unwrap(), "");
    }
}
