//! Serial TTY transport for AT commands
//!
//! Ports are opened non-blocking and without becoming the controlling
//! terminal; deadlines are enforced with `poll` so a silent modem cannot
//! stall the caller past the configured AT timeout.

#![allow(unsafe_code, reason = "tcflush and poll have no safe std equivalent")]

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::at::{AtChannel, AtTransport};

const READ_BUFFER_SIZE: usize = 4096;

/// [`AtTransport`] over a kernel TTY node
#[derive(Debug, Default, Clone, Copy)]
pub struct TtyTransport;

impl AtTransport for TtyTransport {
    fn open(&self, path: &Path) -> io::Result<Box<dyn AtChannel>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NOCTTY | libc::O_NONBLOCK)
            .open(path)?;
        debug!("opened tty {}", path.display());
        Ok(Box::new(TtyChannel { file }))
    }
}

/// An open TTY; the descriptor is closed on drop
#[derive(Debug)]
pub struct TtyChannel {
    file: File,
}

impl TtyChannel {
    fn flush_input(&self) -> io::Result<()> {
        // SAFETY: the descriptor is owned by `self.file` and open for the call.
        let rc = unsafe { libc::tcflush(self.file.as_raw_fd(), libc::TCIFLUSH) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl AtChannel for TtyChannel {
    fn write(&mut self, data: &[u8], timeout: Duration, flush_input: bool) -> io::Result<()> {
        if flush_input {
            self.flush_input()?;
        }
        let deadline = Instant::now() + timeout;
        let mut remaining = data;
        while !remaining.is_empty() {
            wait_for(self.file.as_raw_fd(), libc::POLLOUT, deadline)?;
            match self.file.write(remaining) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(n) => remaining = remaining.get(n..).unwrap_or_default(),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn read(&mut self, timeout: Duration) -> io::Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            wait_for(self.file.as_raw_fd(), libc::POLLIN, deadline)?;
            match self.file.read(&mut buf) {
                Ok(n) => {
                    buf.truncate(n);
                    return Ok(buf);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

fn wait_for(fd: RawFd, events: libc::c_short, deadline: Instant) -> io::Result<()> {
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        let millis = libc::c_int::try_from(left.as_millis()).unwrap_or(libc::c_int::MAX);
        let mut pfd = libc::pollfd {
            fd,
            events,
            revents: 0,
        };
        // SAFETY: `pfd` is a single valid pollfd that outlives the call.
        let rc = unsafe { libc::poll(&mut pfd, 1, millis) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        if rc == 0 {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "port timed out"));
        }
        if pfd.revents & events == 0 {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "port hung up"));
        }
        return Ok(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    fn make_fifo(path: &Path) -> io::Result<()> {
        let c_path = CString::new(path.as_os_str().as_bytes())?;
        // SAFETY: `c_path` is a valid NUL-terminated string for the call.
        let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[test]
    fn test_open_missing_node_fails() {
        let err = TtyTransport.open(Path::new("/dev/does-not-exist-ttyUSB99")).err();
        assert_eq!(err.map(|e| e.kind()), Some(io::ErrorKind::NotFound));
    }

    #[test]
    fn test_fifo_round_trip() -> io::Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("tty");
        make_fifo(&path)?;

        let mut channel = TtyTransport.open(&path)?;
        channel.write(b"AT\r\n", Duration::from_millis(500), false)?;
        let read = channel.read(Duration::from_millis(500))?;
        assert_eq!(read, b"AT\r\n");
        Ok(())
    }

    #[test]
    fn test_read_times_out_when_silent() -> io::Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("tty");
        make_fifo(&path)?;

        let mut channel = TtyTransport.open(&path)?;
        let err = channel.read(Duration::from_millis(20)).err();
        assert_eq!(err.map(|e| e.kind()), Some(io::ErrorKind::TimedOut));
        Ok(())
    }
}
