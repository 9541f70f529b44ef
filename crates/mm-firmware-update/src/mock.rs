//! Recording test doubles for the external collaborators

use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::at::{AtChannel, AtTransport};
use crate::bhi::{BhiBackend, BhiDevice, BhiDeviceInfo, MHI_EE_EDL};
use crate::config_db::{ConfigHandle, ConfigWriter};
use crate::device::ModemDevice;
use crate::error::{Result, UpdateError};
use crate::orchestrator::ReplugHandler;

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// AT transport answering from a response queue
///
/// A read with nothing queued times out, like a silent modem.
#[derive(Debug, Clone, Default)]
pub struct MockAtTransport {
    responses: Arc<Mutex<VecDeque<Vec<u8>>>>,
    writes: Arc<Mutex<Vec<Vec<u8>>>>,
    opened: Arc<Mutex<Vec<PathBuf>>>,
    flushes: Arc<AtomicUsize>,
    open_channels: Arc<AtomicUsize>,
    fail_open: Arc<Mutex<bool>>,
}

impl MockAtTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue_response(&self, response: &[u8]) {
        lock(&self.responses).push_back(response.to_vec());
    }

    pub fn set_fail_open(&self, fail: bool) {
        *lock(&self.fail_open) = fail;
    }

    /// Raw bytes of every write
    pub fn writes(&self) -> Vec<Vec<u8>> {
        lock(&self.writes).clone()
    }

    /// Every write decoded as a command, without the trailing CR/LF
    pub fn commands(&self) -> Vec<String> {
        lock(&self.writes)
            .iter()
            .map(|w| String::from_utf8_lossy(w).trim_end_matches("\r\n").to_string())
            .collect()
    }

    pub fn flushes(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }

    pub fn opened_paths(&self) -> Vec<PathBuf> {
        lock(&self.opened).clone()
    }

    /// Channels opened and not yet dropped
    pub fn open_channels(&self) -> usize {
        self.open_channels.load(Ordering::SeqCst)
    }
}

impl AtTransport for MockAtTransport {
    fn open(&self, path: &Path) -> io::Result<Box<dyn AtChannel>> {
        if *lock(&self.fail_open) {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no such port"));
        }
        lock(&self.opened).push(path.to_path_buf());
        self.open_channels.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockAtChannel {
            transport: self.clone(),
        }))
    }
}

struct MockAtChannel {
    transport: MockAtTransport,
}

impl AtChannel for MockAtChannel {
    fn write(&mut self, data: &[u8], _timeout: Duration, flush_input: bool) -> io::Result<()> {
        if flush_input {
            self.transport.flushes.fetch_add(1, Ordering::SeqCst);
        }
        lock(&self.transport.writes).push(data.to_vec());
        Ok(())
    }

    fn read(&mut self, _timeout: Duration) -> io::Result<Vec<u8>> {
        lock(&self.transport.responses)
            .pop_front()
            .ok_or_else(|| io::Error::new(io::ErrorKind::TimedOut, "no response queued"))
    }
}

impl Drop for MockAtChannel {
    fn drop(&mut self) {
        self.transport.open_channels.fetch_sub(1, Ordering::SeqCst);
    }
}

/// One ioctl issued on a mock BHI node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BhiIoctl {
    GetDevInfo,
    WriteImage(Vec<u8>),
}

/// BHI backend recording every ioctl
///
/// Reports emergency download mode unless told otherwise.
#[derive(Debug, Clone)]
pub struct MockBhiBackend {
    ee: Arc<Mutex<u32>>,
    ioctls: Arc<Mutex<Vec<BhiIoctl>>>,
    fail_write: Arc<Mutex<Option<(usize, i32)>>>,
    opens: Arc<AtomicUsize>,
    open_devices: Arc<AtomicUsize>,
}

impl Default for MockBhiBackend {
    fn default() -> Self {
        Self {
            ee: Arc::new(Mutex::new(MHI_EE_EDL)),
            ioctls: Arc::new(Mutex::new(Vec::new())),
            fail_write: Arc::new(Mutex::new(None)),
            opens: Arc::new(AtomicUsize::new(0)),
            open_devices: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl MockBhiBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_execution_environment(&self, ee: u32) {
        *lock(&self.ee) = ee;
    }

    /// Fail the `index`th write ioctl (0-based) with `errno`
    pub fn fail_write_at(&self, index: usize, errno: i32) {
        *lock(&self.fail_write) = Some((index, errno));
    }

    pub fn ioctls(&self) -> Vec<BhiIoctl> {
        lock(&self.ioctls).clone()
    }

    /// Buffers of every write ioctl, including failed ones
    pub fn write_ioctls(&self) -> Vec<Vec<u8>> {
        lock(&self.ioctls)
            .iter()
            .filter_map(|ioctl| match ioctl {
                BhiIoctl::WriteImage(buf) => Some(buf.clone()),
                BhiIoctl::GetDevInfo => None,
            })
            .collect()
    }

    /// Write ioctl buffers with the length prefix stripped
    pub fn written_images(&self) -> Vec<Vec<u8>> {
        self.write_ioctls()
            .iter()
            .map(|buf| {
                buf.get(std::mem::size_of::<usize>()..)
                    .unwrap_or_default()
                    .to_vec()
            })
            .collect()
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Devices opened and not yet dropped
    pub fn open_devices(&self) -> usize {
        self.open_devices.load(Ordering::SeqCst)
    }
}

impl BhiBackend for MockBhiBackend {
    fn open(&self, _path: &Path) -> io::Result<Box<dyn BhiDevice>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.open_devices.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockBhiDevice {
            backend: self.clone(),
        }))
    }
}

struct MockBhiDevice {
    backend: MockBhiBackend,
}

impl BhiDevice for MockBhiDevice {
    fn device_info(&mut self) -> io::Result<BhiDeviceInfo> {
        lock(&self.backend.ioctls).push(BhiIoctl::GetDevInfo);
        Ok(BhiDeviceInfo {
            ver_major: 1,
            ee: *lock(&self.backend.ee),
            sernum: 0x1234_5678,
            ..BhiDeviceInfo::default()
        })
    }

    fn write_image(&mut self, framed: &[u8]) -> io::Result<()> {
        let index = {
            let mut ioctls = lock(&self.backend.ioctls);
            let index = ioctls
                .iter()
                .filter(|i| matches!(i, BhiIoctl::WriteImage(_)))
                .count();
            ioctls.push(BhiIoctl::WriteImage(framed.to_vec()));
            index
        };
        match *lock(&self.backend.fail_write) {
            Some((fail_index, errno)) if fail_index == index => {
                Err(io::Error::from_raw_os_error(errno))
            }
            _ => Ok(()),
        }
    }
}

impl Drop for MockBhiDevice {
    fn drop(&mut self) {
        self.backend.open_devices.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Config database writer recording every write attempt
#[derive(Debug, Clone, Default)]
pub struct MockConfigWriter {
    attempts: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
    opened: Arc<Mutex<Vec<PathBuf>>>,
    fail_on: Arc<Mutex<Option<usize>>>,
    fail_open: Arc<Mutex<bool>>,
    closes: Arc<AtomicUsize>,
}

impl MockConfigWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject the `attempt`th write (1-based)
    pub fn fail_on_attempt(&self, attempt: usize) {
        *lock(&self.fail_on) = Some(attempt);
    }

    pub fn set_fail_open(&self, fail: bool) {
        *lock(&self.fail_open) = fail;
    }

    /// Names of every write attempt, including a rejected one
    pub fn attempted(&self) -> Vec<String> {
        lock(&self.attempts).iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn attempts(&self) -> Vec<(String, Vec<u8>)> {
        lock(&self.attempts).clone()
    }

    pub fn opened_ports(&self) -> Vec<PathBuf> {
        lock(&self.opened).clone()
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl ConfigWriter for MockConfigWriter {
    fn open(&self, port: &Path) -> Result<Box<dyn ConfigHandle>> {
        if *lock(&self.fail_open) {
            return Err(UpdateError::NotReady(format!(
                "{} is not responding",
                port.display()
            )));
        }
        lock(&self.opened).push(port.to_path_buf());
        Ok(Box::new(MockConfigHandle {
            writer: self.clone(),
        }))
    }
}

struct MockConfigHandle {
    writer: MockConfigWriter,
}

impl ConfigHandle for MockConfigHandle {
    fn write(&mut self, name: &str, data: &[u8]) -> Result<()> {
        let attempt = {
            let mut attempts = lock(&self.writer.attempts);
            attempts.push((name.to_string(), data.to_vec()));
            attempts.len()
        };
        if *lock(&self.writer.fail_on) == Some(attempt) {
            return Err(UpdateError::protocol(
                format!("device rejected {name}"),
                Some("QMI_PROTOCOL_ERROR_INVALID_ARGUMENT"),
            ));
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.writer.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Replug handler recording every declared window
///
/// Devices queued with [`RecordingReplugHandler::reenumerate_as`] are handed
/// back one per wait, in queue order.
#[derive(Debug, Clone, Default)]
pub struct RecordingReplugHandler {
    calls: Arc<Mutex<Vec<(String, Duration)>>>,
    fail: Arc<Mutex<bool>>,
    replacements: Arc<Mutex<VecDeque<ModemDevice>>>,
}

impl RecordingReplugHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// A handler whose device never comes back
    pub fn failing() -> Self {
        let handler = Self::default();
        *lock(&handler.fail) = true;
        handler
    }

    /// Have the next wait report the modem as `device`
    pub fn reenumerate_as(&self, device: ModemDevice) {
        lock(&self.replacements).push_back(device);
    }

    pub fn windows(&self) -> Vec<Duration> {
        lock(&self.calls).iter().map(|(_, window)| *window).collect()
    }

    pub fn calls(&self) -> Vec<(String, Duration)> {
        lock(&self.calls).clone()
    }
}

impl ReplugHandler for RecordingReplugHandler {
    fn wait_for_replug(
        &self,
        device: &ModemDevice,
        window: Duration,
    ) -> Result<Option<ModemDevice>> {
        lock(&self.calls).push((device.physical_id().to_string(), window));
        if *lock(&self.fail) {
            return Err(UpdateError::NotReady(format!(
                "{} did not come back within {} ms",
                device.physical_id(),
                window.as_millis()
            )));
        }
        Ok(lock(&self.replacements).pop_front())
    }
}
