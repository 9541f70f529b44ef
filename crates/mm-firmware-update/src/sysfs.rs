//! Port resolution through sysfs
//!
//! A modem node such as `/dev/ttyUSB2` or `/dev/cdc-wdm0` is resolved by
//! following `<root>/class/<subsystem>/<node>/device` to the USB interface
//! directory, which carries `bInterfaceNumber`. The interface's parent is the
//! USB device itself, whose path is stable across re-enumeration and serves as
//! the modem's physical id.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::port::{PortInfo, PortInfoResolver};

const SUBSYSTEMS: [&str; 4] = ["tty", "usbmisc", "mhi", "wwan"];

/// [`PortInfoResolver`] backed by a sysfs tree
#[derive(Debug, Clone)]
pub struct SysfsResolver {
    root: PathBuf,
}

impl Default for SysfsResolver {
    fn default() -> Self {
        Self::new("/sys")
    }
}

impl SysfsResolver {
    /// Resolve against a sysfs tree mounted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl PortInfoResolver for SysfsResolver {
    fn resolve(&self, port: &Path) -> Option<PortInfo> {
        let node = port.file_name()?;
        for subsystem in SUBSYSTEMS {
            let link = self
                .root
                .join("class")
                .join(subsystem)
                .join(node)
                .join("device");
            let Ok(target) = fs::canonicalize(&link) else {
                continue;
            };
            if let Some(info) = find_usb_interface(&target) {
                debug!(
                    "resolved {} to {} (interface {:?})",
                    port.display(),
                    info.device_sysfs_path.display(),
                    info.interface_number
                );
                return Some(info);
            }
        }
        debug!("no sysfs entry for {}", port.display());
        None
    }
}

fn find_usb_interface(device_dir: &Path) -> Option<PortInfo> {
    for dir in device_dir.ancestors() {
        let Ok(raw) = fs::read_to_string(dir.join("bInterfaceNumber")) else {
            continue;
        };
        let interface_number = u8::from_str_radix(raw.trim(), 16).ok();
        let device_sysfs_path = dir.parent()?.to_path_buf();
        return Some(PortInfo {
            device_sysfs_path,
            interface_number,
        });
    }
    None
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;

    fn fake_tty(root: &Path, node: &str, interface: &str, ifnum: &str) -> std::io::Result<PathBuf> {
        let usb_device = root.join("devices/pci0000:00/usb1/1-1");
        let iface = usb_device.join(interface);
        let port_dir = iface.join(node);
        fs::create_dir_all(&port_dir)?;
        fs::write(iface.join("bInterfaceNumber"), format!("{ifnum}\n"))?;
        let class_dir = root.join("class/tty").join(node);
        fs::create_dir_all(&class_dir)?;
        symlink(&port_dir, class_dir.join("device"))?;
        Ok(usb_device)
    }

    #[test]
    fn test_resolves_interface_and_device() -> Result<(), Box<dyn std::error::Error>> {
        let tmp = tempfile::tempdir()?;
        let usb_device = fake_tty(tmp.path(), "ttyUSB2", "1-1:1.2", "02")?;

        let resolver = SysfsResolver::new(tmp.path());
        let info = resolver
            .resolve(Path::new("/dev/ttyUSB2"))
            .ok_or("port did not resolve")?;

        assert_eq!(info.interface_number, Some(2));
        assert_eq!(info.device_sysfs_path, fs::canonicalize(usb_device)?);
        Ok(())
    }

    #[test]
    fn test_interface_number_is_hex() -> Result<(), Box<dyn std::error::Error>> {
        let tmp = tempfile::tempdir()?;
        fake_tty(tmp.path(), "ttyUSB9", "1-1:1.12", "0c")?;
        let info = SysfsResolver::new(tmp.path())
            .resolve(Path::new("/dev/ttyUSB9"))
            .ok_or("port did not resolve")?;
        assert_eq!(info.interface_number, Some(12));
        Ok(())
    }

    #[test]
    fn test_unknown_node_is_none() -> Result<(), Box<dyn std::error::Error>> {
        let tmp = tempfile::tempdir()?;
        let resolver = SysfsResolver::new(tmp.path());
        assert!(resolver.resolve(Path::new("/dev/ttyUSB0")).is_none());
        Ok(())
    }
}
