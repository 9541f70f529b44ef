//! AT command channel used for the fastboot detach
//!
//! Only the strict acknowledgement form is accepted: the response must be
//! exactly [`AT_ACK`]. Anything else, including an `OK` with extra text, is a
//! protocol failure carrying the trimmed response.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use crate::error::{Result, UpdateError};
use crate::locker::Lockable;
use crate::logging::dump_bytes;

/// The only response accepted as command success
pub const AT_ACK: &[u8] = b"\r\nOK\r\n";

/// Neutral command sent before the detach command
pub const AT_PROBE: &str = "AT";

/// An open byte stream to an AT-capable port
pub trait AtChannel: Send {
    /// Write all of `data` within `timeout`, optionally discarding pending input first
    fn write(&mut self, data: &[u8], timeout: Duration, flush_input: bool) -> io::Result<()>;

    /// Return whatever a single read yields within `timeout`
    fn read(&mut self, timeout: Duration) -> io::Result<Vec<u8>>;
}

/// Opens AT channels; the channel is closed when dropped
pub trait AtTransport: Send + Sync {
    fn open(&self, path: &Path) -> io::Result<Box<dyn AtChannel>>;
}

/// Check a command response against the strict acknowledgement
pub fn check_ack(cmd: &str, response: &[u8]) -> Result<()> {
    let message = format!("failed to read valid response for {cmd}");
    if response.len() < AT_ACK.len() {
        return Err(UpdateError::protocol(message, None));
    }
    if response != AT_ACK {
        let body = String::from_utf8_lossy(response);
        return Err(UpdateError::protocol(message, Some(&body)));
    }
    Ok(())
}

/// AT port of a modem, opened through a [`crate::locker::DeviceLocker`]
pub struct AtPort<'t> {
    transport: &'t dyn AtTransport,
    path: PathBuf,
    timeout: Duration,
    verbose: bool,
    channel: Option<Box<dyn AtChannel>>,
}

impl std::fmt::Debug for AtPort<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AtPort")
            .field("path", &self.path)
            .field("timeout", &self.timeout)
            .field("open", &self.channel.is_some())
            .finish()
    }
}

impl<'t> AtPort<'t> {
    pub fn new(
        transport: &'t dyn AtTransport,
        path: impl Into<PathBuf>,
        timeout: Duration,
        verbose: bool,
    ) -> Self {
        Self {
            transport,
            path: path.into(),
            timeout,
            verbose,
            channel: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Send `cmd` and require the strict acknowledgement
    pub fn command(&mut self, cmd: &str) -> Result<()> {
        let channel = self.channel.as_mut().ok_or_else(|| {
            UpdateError::io(
                format!("failed to write {cmd}"),
                io::Error::new(io::ErrorKind::NotConnected, "AT port is not open"),
            )
        })?;

        let request = format!("{cmd}\r\n");
        dump_bytes(self.verbose, "writing", request.as_bytes());
        channel
            .write(request.as_bytes(), self.timeout, true)
            .map_err(|e| UpdateError::io(format!("failed to write {cmd}"), e))?;

        let response = channel
            .read(self.timeout)
            .map_err(|e| UpdateError::io(format!("failed to read response for {cmd}"), e))?;
        dump_bytes(self.verbose, "read", &response);

        check_ack(cmd, &response)?;
        debug!("{} acknowledged on {}", cmd, self.path.display());
        Ok(())
    }
}

impl Lockable for AtPort<'_> {
    fn describe(&self) -> String {
        format!("AT port {}", self.path.display())
    }

    fn open(&mut self) -> Result<()> {
        let channel = self.transport.open(&self.path).map_err(|e| {
            UpdateError::io(format!("failed to open {}", self.path.display()), e)
        })?;
        self.channel = Some(channel);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.channel = None;
        Ok(())
    }
}
