//! Configuration database session
//!
//! The wire protocol behind the database (QMI PDC on most modems) is provided
//! by a [`ConfigWriter`]. Each `write` is independent; no transaction spans
//! several writes.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Result, ResultExt, UpdateError};
use crate::locker::Lockable;
use crate::logging::dump_bytes;

/// An open config database client
pub trait ConfigHandle: Send {
    /// Store `data` under `name`
    fn write(&mut self, name: &str, data: &[u8]) -> Result<()>;

    fn close(&mut self) -> Result<()>;
}

/// Opens config database clients on a control port
pub trait ConfigWriter: Send + Sync {
    fn open(&self, port: &Path) -> Result<Box<dyn ConfigHandle>>;
}

/// Scoped config database client, opened through a [`crate::locker::DeviceLocker`]
pub struct ConfigDbSession<'w> {
    writer: &'w dyn ConfigWriter,
    path: PathBuf,
    verbose: bool,
    handle: Option<Box<dyn ConfigHandle>>,
}

impl fmt::Debug for ConfigDbSession<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigDbSession")
            .field("path", &self.path)
            .field("open", &self.handle.is_some())
            .finish()
    }
}

impl<'w> ConfigDbSession<'w> {
    pub fn new(writer: &'w dyn ConfigWriter, path: impl Into<PathBuf>, verbose: bool) -> Self {
        Self {
            writer,
            path: path.into(),
            verbose,
            handle: None,
        }
    }

    pub fn write(&mut self, name: &str, data: &[u8]) -> Result<()> {
        let handle = self.handle.as_mut().ok_or_else(|| {
            UpdateError::io(
                format!("failed to write {name}"),
                io::Error::new(io::ErrorKind::NotConnected, "config database session is closed"),
            )
        })?;
        dump_bytes(self.verbose, name, data);
        handle
            .write(name, data)
            .with_context(|| format!("failed to write {name}"))?;
        debug!("wrote {} ({} bytes) to {}", name, data.len(), self.path.display());
        Ok(())
    }
}

impl Lockable for ConfigDbSession<'_> {
    fn describe(&self) -> String {
        format!("config database on {}", self.path.display())
    }

    fn open(&mut self) -> Result<()> {
        let handle = self
            .writer
            .open(&self.path)
            .with_context(|| format!("failed to open config database on {}", self.path.display()))?;
        self.handle = Some(handle);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        match self.handle.take() {
            Some(mut handle) => handle.close(),
            None => Ok(()),
        }
    }
}
