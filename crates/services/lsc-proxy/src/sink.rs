//! Byte sinks feeding the transcoder
//!
//! A [`ByteSink`] is the write end of one named pipe. Failures come back as
//! [`SinkError`] values; what the owning loop does about them is decided by
//! its [`RecoveryPolicy`].

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Reaction to a failed write on an open sink
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryPolicy {
    /// Close the handle and open the pipe again before the next write
    #[default]
    Reopen,

    /// Drop the frame and keep the current handle
    Discard,
}

/// Write target for one media stream
pub trait ByteSink: Send {
    /// Open the write end; a sink that is already open is reopened
    fn open(&mut self) -> Result<(), SinkError>;

    /// Write a whole frame, returning the number of bytes written
    fn write(&mut self, bytes: &[u8]) -> Result<usize, SinkError>;

    /// Drop the write handle, if any
    fn close(&mut self);

    fn is_open(&self) -> bool;

    /// Human readable target, used in logs
    fn target(&self) -> String;
}

/// Error type for sink operations
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// Nobody has the pipe open for reading
    #[error("no reader on {0}")]
    NoReader(String),

    #[error("failed to open {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Write attempted while no handle is held
    #[error("sink is not open")]
    NotOpen,

    /// The reader went away mid-stream
    #[error("reader disconnected")]
    Disconnected,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SinkError {
    fn from_write(e: std::io::Error) -> Self {
        if e.kind() == ErrorKind::BrokenPipe {
            SinkError::Disconnected
        } else {
            SinkError::Io(e)
        }
    }
}

/// Named pipe sink
///
/// Opening never blocks: without a reader the open fails with
/// [`SinkError::NoReader`]. Once open, writes block until the reader drains
/// the pipe, which keeps the device pull rate tied to the transcoder.
#[derive(Debug)]
pub struct FifoSink {
    path: PathBuf,
    file: Option<File>,
    opened_at: Option<Instant>,
}

impl FifoSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
            opened_at: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// When the current handle was opened
    pub fn opened_at(&self) -> Option<Instant> {
        self.opened_at
    }
}

impl ByteSink for FifoSink {
    fn open(&mut self) -> Result<(), SinkError> {
        self.close();

        let file = OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&self.path)
            .map_err(|e| match e.raw_os_error() {
                Some(libc::ENXIO) => SinkError::NoReader(self.path.display().to_string()),
                _ => SinkError::Open {
                    path: self.path.display().to_string(),
                    source: e,
                },
            })?;

        // Back to blocking writes now that a reader is attached
        let flags = fcntl(&file, FcntlArg::F_GETFL).map_err(errno_to_io)?;
        let flags = OFlag::from_bits_truncate(flags);
        fcntl(&file, FcntlArg::F_SETFL(flags - OFlag::O_NONBLOCK)).map_err(errno_to_io)?;

        tracing::debug!("Opened {}", self.path.display());
        self.file = Some(file);
        self.opened_at = Some(Instant::now());
        Ok(())
    }

    fn write(&mut self, bytes: &[u8]) -> Result<usize, SinkError> {
        let file = self.file.as_mut().ok_or(SinkError::NotOpen)?;
        file.write_all(bytes).map_err(SinkError::from_write)?;
        Ok(bytes.len())
    }

    fn close(&mut self) {
        if self.file.take().is_some() {
            tracing::debug!("Closed {}", self.path.display());
        }
        self.opened_at = None;
    }

    fn is_open(&self) -> bool {
        self.file.is_some()
    }

    fn target(&self) -> String {
        self.path.display().to_string()
    }
}

/// Create `path` as a FIFO (and its parent directory) unless it exists
///
/// Returns `true` when something was created.
pub fn ensure_fifo(path: &Path) -> Result<bool, SinkError> {
    let mut created = false;

    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        if !dir.exists() {
            std::fs::create_dir_all(dir).map_err(|e| SinkError::Open {
                path: dir.display().to_string(),
                source: e,
            })?;
            tracing::info!("Directory '{}' created", dir.display());
            created = true;
        }
    }

    match std::fs::metadata(path) {
        Ok(meta) if meta.file_type().is_fifo() => return Ok(created),
        Ok(_) => {
            tracing::warn!("{} exists but is not a FIFO", path.display());
            return Ok(created);
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => {
            return Err(SinkError::Open {
                path: path.display().to_string(),
                source: e,
            })
        }
    }

    nix::unistd::mkfifo(path, nix::sys::stat::Mode::from_bits_truncate(0o644)).map_err(|e| {
        SinkError::Open {
            path: path.display().to_string(),
            source: std::io::Error::from(e),
        }
    })?;
    tracing::info!("FIFO '{}' created", path.display());
    Ok(true)
}

fn errno_to_io(errno: Errno) -> SinkError {
    SinkError::Io(std::io::Error::from(errno))
}
