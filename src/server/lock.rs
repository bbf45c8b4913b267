//! Data directory lockfile.
//!
//! A pidfile guards the data directory against concurrent server
//! instances. Stale files (whose recorded process is gone) are replaced
//! atomically; a live owner refuses startup.

use std::fs;
use std::fs::OpenOptions;
use std::io;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use thiserror::Error;
use tracing::info;

/// File name of the lock inside the data directory.
pub const LOCK_FILE: &str = "lock";

#[derive(Debug, Error)]
pub enum LockError {
    #[error("data directory is locked by running process {0}")]
    Held(i32),
    #[error("lockfile error: {0}")]
    Io(#[from] io::Error),
}

/// An acquired lock; dropping it releases the file.
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
}

/// True if a process with that pid is alive (signal 0 probe).
fn pid_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    unsafe { libc::kill(pid, 0) == 0 }
}

impl LockFile {
    /// Takes the lock in `dir`, probing and replacing a stale file.
    pub fn acquire(dir: &Path) -> Result<LockFile, LockError> {
        let path = dir.join(LOCK_FILE);
        let pid = std::process::id() as i32;

        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                write!(file, "{}", pid)?;
                Ok(LockFile { path })
            }
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                let holder: i32 = fs::read_to_string(&path)?
                    .trim()
                    .parse()
                    .unwrap_or(0);
                if pid_alive(holder) {
                    return Err(LockError::Held(holder));
                }
                info!(stale_pid = holder, "replacing stale lockfile");
                // Replace atomically so a concurrent starter sees either
                // the old or the new pid, never a torn file.
                let mut temp = tempfile::NamedTempFile::new_in(dir)?;
                write!(temp, "{}", pid)?;
                temp.persist(&path).map_err(|e| e.error)?;
                Ok(LockFile { path })
            }
            Err(err) => Err(err.into()),
        }
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}
