//! Device ports resolved at probe time

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Role a port plays in an update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortKind {
    /// AT-capable TTY used for the fastboot detach command
    At,
    /// QMI/MBIM control node carrying the configuration database protocol
    ConfigDb,
    /// Boot host interface node used in emergency download mode
    Bhi,
    /// Anything the updater does not use
    Other,
}

/// A device node exposed by the modem
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    /// Kernel subsystem the node belongs to (`tty`, `usbmisc`, `mhi`, ...)
    pub subsystem: String,
    /// Absolute device node path
    pub path: PathBuf,
    /// USB interface number, when known
    pub interface_number: Option<u8>,
}

impl Port {
    pub fn new(
        subsystem: impl Into<String>,
        path: impl Into<PathBuf>,
        interface_number: Option<u8>,
    ) -> Self {
        Self {
            subsystem: subsystem.into(),
            path: path.into(),
            interface_number,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.path.display(), self.subsystem)?;
        if let Some(ifnum) = self.interface_number {
            write!(f, " if{ifnum}")?;
        }
        Ok(())
    }
}

/// The ports an update may need; first port of each kind wins
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSet {
    pub at: Option<Port>,
    pub config_db: Option<Port>,
    pub bhi: Option<Port>,
}

impl PortSet {
    /// Record `port` under `kind` unless a port of that kind is already set.
    ///
    /// Returns whether the port was taken.
    pub fn offer(&mut self, kind: PortKind, port: Port) -> bool {
        let slot = match kind {
            PortKind::At => &mut self.at,
            PortKind::ConfigDb => &mut self.config_db,
            PortKind::Bhi => &mut self.bhi,
            PortKind::Other => return false,
        };
        if slot.is_some() {
            return false;
        }
        *slot = Some(port);
        true
    }

    pub fn get(&self, kind: PortKind) -> Option<&Port> {
        match kind {
            PortKind::At => self.at.as_ref(),
            PortKind::ConfigDb => self.config_db.as_ref(),
            PortKind::Bhi => self.bhi.as_ref(),
            PortKind::Other => None,
        }
    }
}

/// Data resolved for a device node from the platform device tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortInfo {
    /// Sysfs path of the USB device owning the node; used as the physical id
    pub device_sysfs_path: PathBuf,
    /// USB interface number of the node
    pub interface_number: Option<u8>,
}

/// Resolves a device node to its owning device and interface
pub trait PortInfoResolver: Send + Sync {
    fn resolve(&self, port: &Path) -> Option<PortInfo>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_port_of_each_kind_wins() {
        let mut ports = PortSet::default();
        assert!(ports.offer(PortKind::At, Port::new("tty", "/dev/ttyUSB2", Some(2))));
        assert!(!ports.offer(PortKind::At, Port::new("tty", "/dev/ttyUSB3", Some(3))));
        assert!(!ports.offer(PortKind::Other, Port::new("net", "/dev/wwan0", None)));
        assert_eq!(
            ports.get(PortKind::At).map(|p| p.path.clone()),
            Some(PathBuf::from("/dev/ttyUSB2"))
        );
        assert!(ports.get(PortKind::ConfigDb).is_none());
    }

    #[test]
    fn test_port_display() {
        let port = Port::new("tty", "/dev/ttyUSB2", Some(2));
        assert_eq!(port.to_string(), "/dev/ttyUSB2 (tty) if2");
        let port = Port::new("usbmisc", "/dev/cdc-wdm0", None);
        assert_eq!(port.to_string(), "/dev/cdc-wdm0 (usbmisc)");
    }
}
