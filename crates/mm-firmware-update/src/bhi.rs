//! Boot host interface raw image loader
//!
//! In emergency download mode the modem's MHI `BHI` node accepts a single
//! image per ioctl. The wire buffer is the image length as a native-endian
//! `usize` followed by the image bytes. There is no acknowledgement frame and
//! no partial progress: the ioctl either accepts the whole buffer or fails,
//! and a failed transfer restarts from the beginning.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Result, UpdateError};
use crate::locker::Lockable;
use crate::logging::dump_bytes;

/// Base of the vendor ioctl range
pub const BHI_IOCTL_BASE: u32 = 0x8BE0;
/// Read [`BhiDeviceInfo`]
pub const BHI_IOCTL_GETDEVINFO: u32 = BHI_IOCTL_BASE + 1;
/// Write one length-prefixed image
pub const BHI_IOCTL_WRITEIMAGE: u32 = BHI_IOCTL_BASE + 2;

/// Execution environment code of emergency download mode
pub const MHI_EE_EDL: u32 = 0x6;

/// Boot stage reported by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionEnvironment {
    Pbl,
    Sbl,
    Amss,
    Rddm,
    Wfw,
    Pthru,
    /// Emergency download
    Edl,
    Fp,
    Unknown(u32),
}

impl From<u32> for ExecutionEnvironment {
    fn from(code: u32) -> Self {
        match code {
            0x0 => ExecutionEnvironment::Pbl,
            0x1 => ExecutionEnvironment::Sbl,
            0x2 => ExecutionEnvironment::Amss,
            0x3 => ExecutionEnvironment::Rddm,
            0x4 => ExecutionEnvironment::Wfw,
            0x5 => ExecutionEnvironment::Pthru,
            MHI_EE_EDL => ExecutionEnvironment::Edl,
            0x7 => ExecutionEnvironment::Fp,
            other => ExecutionEnvironment::Unknown(other),
        }
    }
}

impl fmt::Display for ExecutionEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionEnvironment::Pbl => write!(f, "PBL"),
            ExecutionEnvironment::Sbl => write!(f, "SBL"),
            ExecutionEnvironment::Amss => write!(f, "AMSS"),
            ExecutionEnvironment::Rddm => write!(f, "RDDM"),
            ExecutionEnvironment::Wfw => write!(f, "WFW"),
            ExecutionEnvironment::Pthru => write!(f, "PTHRU"),
            ExecutionEnvironment::Edl => write!(f, "EDL"),
            ExecutionEnvironment::Fp => write!(f, "FP"),
            ExecutionEnvironment::Unknown(code) => write!(f, "unknown(0x{code:x})"),
        }
    }
}

/// Device info record filled by `BHI_IOCTL_GETDEVINFO`; layout matches the driver
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BhiDeviceInfo {
    pub ver_minor: u32,
    pub ver_major: u32,
    pub image_address_low: u32,
    pub image_address_high: u32,
    pub image_size: u32,
    pub rsvd1: u32,
    pub imgtxdb: u32,
    pub rsvd2: u32,
    pub msivec: u32,
    pub rsvd3: u32,
    pub ee: u32,
    pub status: u32,
    pub errorcode: u32,
    pub errdbg1: u32,
    pub errdbg2: u32,
    pub errdbg3: u32,
    pub sernum: u32,
    pub sblantirollbackver: u32,
    pub numsegs: u32,
    pub msmhwid: [u32; 6],
    pub oempkhash: [u32; 48],
    pub rsvd5: u32,
}

impl Default for BhiDeviceInfo {
    fn default() -> Self {
        Self {
            ver_minor: 0,
            ver_major: 0,
            image_address_low: 0,
            image_address_high: 0,
            image_size: 0,
            rsvd1: 0,
            imgtxdb: 0,
            rsvd2: 0,
            msivec: 0,
            rsvd3: 0,
            ee: 0,
            status: 0,
            errorcode: 0,
            errdbg1: 0,
            errdbg2: 0,
            errdbg3: 0,
            sernum: 0,
            sblantirollbackver: 0,
            numsegs: 0,
            msmhwid: [0; 6],
            oempkhash: [0; 48],
            rsvd5: 0,
        }
    }
}

impl BhiDeviceInfo {
    pub fn execution_environment(&self) -> ExecutionEnvironment {
        ExecutionEnvironment::from(self.ee)
    }
}

/// Build the wire buffer for `BHI_IOCTL_WRITEIMAGE`
pub fn frame_image(image: &[u8]) -> Vec<u8> {
    let prefix = image.len().to_ne_bytes();
    let mut buf = Vec::with_capacity(prefix.len().saturating_add(image.len()));
    buf.extend_from_slice(&prefix);
    buf.extend_from_slice(image);
    buf
}

/// An open BHI node; closed when dropped
pub trait BhiDevice: Send {
    /// Issue `BHI_IOCTL_GETDEVINFO`
    fn device_info(&mut self) -> io::Result<BhiDeviceInfo>;

    /// Issue exactly one `BHI_IOCTL_WRITEIMAGE` with an already framed buffer
    fn write_image(&mut self, framed: &[u8]) -> io::Result<()>;
}

/// Opens BHI nodes
pub trait BhiBackend: Send + Sync {
    fn open(&self, path: &Path) -> io::Result<Box<dyn BhiDevice>>;
}

/// Raw image channel to a modem in emergency download mode
pub struct BhiChannel<'b> {
    backend: &'b dyn BhiBackend,
    path: PathBuf,
    verbose: bool,
    device: Option<Box<dyn BhiDevice>>,
    info: Option<BhiDeviceInfo>,
}

impl fmt::Debug for BhiChannel<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BhiChannel")
            .field("path", &self.path)
            .field("open", &self.device.is_some())
            .field("info", &self.info)
            .finish()
    }
}

impl<'b> BhiChannel<'b> {
    pub fn new(backend: &'b dyn BhiBackend, path: impl Into<PathBuf>, verbose: bool) -> Self {
        Self {
            backend,
            path: path.into(),
            verbose,
            device: None,
            info: None,
        }
    }

    /// Device info read when the channel was last opened
    pub fn info(&self) -> Option<&BhiDeviceInfo> {
        self.info.as_ref()
    }

    pub fn is_open(&self) -> bool {
        self.device.is_some()
    }

    /// Send one image as a single framed ioctl
    pub fn write(&mut self, image: &[u8]) -> Result<()> {
        let device = self.device.as_mut().ok_or_else(|| {
            UpdateError::io(
                "failed to write to MHI BHI device",
                io::Error::new(io::ErrorKind::NotConnected, "BHI channel is closed"),
            )
        })?;

        let framed = frame_image(image);
        dump_bytes(self.verbose, "writing", &framed);
        device
            .write_image(&framed)
            .map_err(|e| UpdateError::io("failed to write to MHI BHI device", e))?;
        debug!("wrote {} byte image to {}", image.len(), self.path.display());
        Ok(())
    }
}

impl Lockable for BhiChannel<'_> {
    fn describe(&self) -> String {
        format!("BHI port {}", self.path.display())
    }

    fn open(&mut self) -> Result<()> {
        let mut device = self
            .backend
            .open(&self.path)
            .map_err(|e| UpdateError::io(format!("failed to open {}", self.path.display()), e))?;

        let info = device
            .device_info()
            .map_err(|e| UpdateError::io("failed to get MHI BHI device info", e))?;
        self.info = Some(info);

        if info.ee != MHI_EE_EDL {
            return Err(UpdateError::NotReady(format!(
                "Device is not in emergency download mode: 0x{:x} (expected 0x{:x})",
                info.ee, MHI_EE_EDL
            )));
        }
        info!(
            "{} is in emergency download mode (BHI {}.{}, serial 0x{:08x})",
            self.path.display(),
            info.ver_major,
            info.ver_minor,
            info.sernum
        );
        self.device = Some(device);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.device = None;
        Ok(())
    }
}

#[cfg(target_os = "linux")]
pub use mhi::MhiBhiBackend;

#[cfg(target_os = "linux")]
mod mhi {
    #![allow(unsafe_code, reason = "the BHI ioctls have no safe wrapper")]

    use std::fs::{File, OpenOptions};
    use std::io;
    use std::os::unix::io::AsRawFd;
    use std::path::Path;

    use super::{BHI_IOCTL_GETDEVINFO, BHI_IOCTL_WRITEIMAGE, BhiBackend, BhiDevice, BhiDeviceInfo};

    /// [`BhiBackend`] over the MHI driver's `BHI` character device
    #[derive(Debug, Default, Clone, Copy)]
    pub struct MhiBhiBackend;

    impl BhiBackend for MhiBhiBackend {
        fn open(&self, path: &Path) -> io::Result<Box<dyn BhiDevice>> {
            let file = OpenOptions::new().read(true).write(true).open(path)?;
            Ok(Box::new(MhiBhiDevice { file }))
        }
    }

    struct MhiBhiDevice {
        file: File,
    }

    impl BhiDevice for MhiBhiDevice {
        fn device_info(&mut self) -> io::Result<BhiDeviceInfo> {
            let mut info = BhiDeviceInfo::default();
            // SAFETY: `info` is a repr(C) record of the size the driver fills and
            // outlives the call; the descriptor is owned by `self.file`.
            let rc = unsafe { libc::ioctl(self.file.as_raw_fd(), BHI_IOCTL_GETDEVINFO as _, &mut info) };
            if rc != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(info)
        }

        fn write_image(&mut self, framed: &[u8]) -> io::Result<()> {
            // SAFETY: `framed` starts with its own payload length, so the driver
            // never reads past the slice, and the slice outlives the call.
            let rc =
                unsafe { libc::ioctl(self.file.as_raw_fd(), BHI_IOCTL_WRITEIMAGE as _, framed.as_ptr()) };
            if rc != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }
    }
}
