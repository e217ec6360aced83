// model.rs
//
// Copyright (c) 2024 Junpei Kawamoto
//
// This software is released under the MIT License.
//
// http://opensource.org/licenses/mit-license.php

use std::fs::{copy, create_dir_all};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::crate_name;
use directories::ProjectDirs;
use hf_hub::api::sync::Api;
use tracing::info;

pub const APP_NAME: &str = crate_name!();

pub const DEFAULT_MODEL: &str = "opus-mt-ja-en";

pub const DEFAULT_REPO: &str = "Helsinki-NLP/opus-mt-ja-en";

/// Files needed to tokenize input and decode output.
pub const DEFAULT_FILES: [&str; 3] = ["vocab.json", "source.spm", "target.spm"];

pub fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("", "", APP_NAME).ok_or_else(|| anyhow!("failed to find home directory"))
}

/// Default daemon socket, in the per-user data directory.
pub fn default_socket_file() -> Result<PathBuf> {
    let dirs = project_dirs()?;
    let data_dir = dirs.data_dir();
    create_dir_all(data_dir)
        .with_context(|| format!("failed to create {}", data_dir.display()))?;
    Ok(data_dir.join(format!("{APP_NAME}.socket")))
}

/// Resolves the directory of a model, preferring an explicit location.
pub fn model_dir(name: &str, explicit: Option<PathBuf>) -> Result<PathBuf> {
    match explicit {
        Some(dir) => Ok(dir),
        None => Ok(project_dirs()?.cache_dir().join(name)),
    }
}

/// Downloads `files` of a Hugging Face repository into `model_dir`.
pub fn fetch<P: AsRef<Path>, S: AsRef<str>>(repo: &str, files: &[S], model_dir: P) -> Result<()> {
    let model_dir = model_dir.as_ref();
    create_dir_all(model_dir)
        .with_context(|| format!("failed to create {}", model_dir.display()))?;

    let api = Api::new()?.model(repo.to_string());
    for file in files {
        let file = file.as_ref();
        let cached = api
            .get(file)
            .with_context(|| format!("failed to download {file} from {repo}"))?;
        copy(&cached, model_dir.join(file))
            .with_context(|| format!("failed to copy {file} into {}", model_dir.display()))?;
        info!("fetched {file} from {repo}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_directory_wins() {
        let dir = PathBuf::from("/models/custom");
        assert_eq!(model_dir(DEFAULT_MODEL, Some(dir.clone())).unwrap(), dir);
    }

    #[test]
    fn named_models_live_in_the_cache_dir() {
        if let Ok(dirs) = project_dirs() {
            let dir = model_dir("opus-mt-ja-en", None).unwrap();
            assert_eq!(dir, dirs.cache_dir().join("opus-mt-ja-en"));
        }
    }
}
