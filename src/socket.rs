// socket.rs
//
// Copyright (c) 2024 Junpei Kawamoto
//
// This software is released under the MIT License.
//
// http://opensource.org/licenses/mit-license.php

use std::fmt::{Display, Formatter};
use std::fs::{remove_file, symlink_metadata};
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tracing::{debug, warn};

use crate::model::default_socket_file;

/// Unix socket path owned by the daemon.
///
/// A stale socket left by an earlier daemon is removed before binding. Any
/// other file at the path is refused, so a mistyped `--socket-file` cannot
/// delete data. The socket is removed again on drop.
#[derive(Debug)]
pub struct SocketFile {
    path: PathBuf,
}

fn is_socket(path: &Path) -> bool {
    symlink_metadata(path).is_ok_and(|m| m.file_type().is_socket())
}

impl SocketFile {
    /// Uses the default socket in the per-user data directory.
    pub fn new() -> Result<Self> {
        SocketFile::with_path(default_socket_file()?)
    }

    pub fn with_path(path: PathBuf) -> Result<Self> {
        if is_socket(&path) {
            debug!("removing stale socket {}", path.display());
            remove_file(&path)
                .with_context(|| format!("failed to remove stale socket {}", path.display()))?;
        } else if symlink_metadata(&path).is_ok() {
            bail!("{} exists and is not a socket", path.display());
        }
        Ok(Self { path })
    }
}

impl Display for SocketFile {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.path.display().fmt(f)
    }
}

impl AsRef<Path> for SocketFile {
    fn as_ref(&self) -> &Path {
        self.path.as_path()
    }
}

impl Drop for SocketFile {
    fn drop(&mut self) {
        if !is_socket(&self.path) {
            return;
        }
        if let Err(e) = remove_file(&self.path) {
            warn!("failed to remove socket file {}: {}", self, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::net::UnixListener;

    use super::*;

    #[test]
    fn stale_socket_is_replaced_and_cleaned_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tagmt.socket");
        drop(UnixListener::bind(&path).unwrap());
        assert!(is_socket(&path));

        let socket = SocketFile::with_path(path.clone()).unwrap();
        assert!(!path.exists());
        assert_eq!(socket.to_string(), path.display().to_string());

        let _listener = UnixListener::bind(&path).unwrap();
        drop(socket);
        assert!(!path.exists());
    }

    #[test]
    fn regular_files_are_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("translatedTags.txt");
        std::fs::write(&path, "1,0,keep me\n").unwrap();

        assert!(SocketFile::with_path(path.clone()).is_err());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "1,0,keep me\n");
    }
}
