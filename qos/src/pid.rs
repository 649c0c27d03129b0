//! Pid files for the daemons.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use nix::{
    errno::Errno,
    sys::signal::{kill, Signal},
    unistd::Pid,
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("pid file {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("failed to signal {pid}: {source}")]
    Signal { pid: Pid, source: Errno },
}

#[derive(Debug, Clone)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The pid recorded in the file, if the file exists and holds a number.
    pub fn read(&self) -> Option<Pid> {
        let text = fs::read_to_string(&self.path).ok()?;
        text.trim().parse::<i32>().ok().filter(|pid| *pid > 0).map(Pid::from_raw)
    }

    /// The recorded pid, if that process is still alive.
    pub fn running(&self) -> Option<Pid> {
        self.read().filter(|pid| alive(*pid))
    }

    /// Records the current process.
    pub fn write(&self) -> Result<(), Error> {
        let err = |source| Error::Io { path: self.path.clone(), source };
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(err)?;
        }
        fs::write(&self.path, format!("{}\n", std::process::id())).map_err(err)
    }

    pub fn remove(&self) -> Result<(), Error> {
        match fs::remove_file(&self.path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => {
                Err(Error::Io { path: self.path.clone(), source: e })
            }
            _ => Ok(()),
        }
    }

    /// Sends `signal` to the recorded process. Returns `false` if nothing is running, removing a
    /// stale file.
    pub fn signal(&self, signal: Signal) -> Result<bool, Error> {
        let Some(pid) = self.running() else {
            self.remove()?;
            return Ok(false);
        };

        kill(pid, signal).map_err(|source| Error::Signal { pid, source })?;
        tracing::debug!(%pid, ?signal, "signal sent");
        Ok(true)
    }
}

fn alive(pid: Pid) -> bool {
    // EPERM means the process exists but belongs to someone else
    matches!(kill(pid, None), Ok(()) | Err(Errno::EPERM))
}
