//! Status snapshots written to a well-known path.
//!
//! Snapshots are JSON, written to a sibling temporary file and renamed into place so readers
//! never observe a partially written file.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use serde::{de::DeserializeOwned, Serialize};

use crate::Result;

/// A status file at a fixed path.
#[derive(Debug, Clone)]
pub struct StatusFile {
    path: PathBuf,
}

impl StatusFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Atomically replaces the file contents with `snapshot`.
    pub fn write<T: Serialize>(&self, snapshot: &T) -> Result<()> {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let json = serde_json::to_vec_pretty(snapshot)?;
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;

        tracing::trace!(path = %self.path.display(), "status written");
        Ok(())
    }

    /// Reads the last snapshot back. Returns `Ok(None)` if no snapshot was ever written.
    pub fn read<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Removes the file, ignoring a missing file.
    pub fn remove(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
