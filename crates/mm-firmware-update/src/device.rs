//! Modem devices and probing
//!
//! A [`ModemDevice`] is created once per discovered modem. Modems still
//! managed by the modem management service are probed from the
//! [`ModemProperties`] it exposes; modems that re-enumerated in a programming
//! mode (and are therefore no longer managed) are rebuilt from raw bus nodes
//! with [`ModemDevice::udev`] and [`ModemDevice::add_udev_port`], inheriting
//! the update settings of the managed device they replace.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Result, UpdateError};
use crate::methods::UpdateMethods;
use crate::port::{Port, PortInfoResolver, PortKind, PortSet};
use crate::state::UpdateState;

/// How the device was discovered
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceKind {
    /// Exposed by the modem management service, which must be inhibited for the update
    ModemManager {
        /// Id used to inhibit the modem in the management service
        inhibition_uid: String,
    },
    /// Raw bus device; already out of the management service's hands
    Udev,
}

/// Stable identity of a modem
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Sysfs path of the owning USB device
    pub physical_id: String,
    pub vendor: Option<String>,
    pub name: Option<String>,
    /// Firmware version, usually `<firmware>_<carrier config>`
    pub version: Option<String>,
    /// Stable identifiers used to match firmware to the device
    pub device_ids: Vec<String>,
}

/// Port types reported by the modem management service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModemPortType {
    At,
    Qmi,
    Mbim,
    Bhi,
    Net,
    Other,
}

/// A port as reported by the modem management service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModemPortDescriptor {
    /// Node name without `/dev/`
    pub name: String,
    pub port_type: ModemPortType,
}

impl ModemPortDescriptor {
    pub fn new(name: impl Into<String>, port_type: ModemPortType) -> Self {
        Self {
            name: name.into(),
            port_type,
        }
    }
}

/// Modem data read from the modem management service
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModemProperties {
    /// The modem's `Device` property; doubles as the inhibition id
    pub device: String,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub update_methods: UpdateMethods,
    /// AT command that reboots the modem into fastboot
    pub fastboot_at: Option<String>,
    pub device_ids: Vec<String>,
    pub version: Option<String>,
    pub ports: Vec<ModemPortDescriptor>,
}

/// Observable per-device update status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub state: UpdateState,
    /// How long the device may be absent from the bus before it is considered gone
    pub remove_delay: Duration,
    /// Whether the device is expected to disappear and reappear
    pub wait_for_replug: bool,
}

/// A modem that can be updated
#[derive(Debug)]
pub struct ModemDevice {
    kind: DeviceKind,
    identity: DeviceIdentity,
    methods: UpdateMethods,
    fastboot_at: Option<String>,
    at_interface: Option<u8>,
    ports: PortSet,
    updating: AtomicBool,
    status: RwLock<DeviceStatus>,
}

/// Exclusive hold on a device for one update attempt; released on drop
#[derive(Debug)]
pub struct UpdateGuard<'a> {
    device: &'a ModemDevice,
}

impl Drop for UpdateGuard<'_> {
    fn drop(&mut self) {
        self.device.updating.store(false, Ordering::Release);
        debug!("released device {}", self.device.physical_id());
    }
}

impl ModemDevice {
    fn new(
        kind: DeviceKind,
        identity: DeviceIdentity,
        methods: UpdateMethods,
        fastboot_at: Option<String>,
        at_interface: Option<u8>,
        ports: PortSet,
    ) -> Self {
        Self {
            kind,
            identity,
            methods,
            fastboot_at,
            at_interface,
            ports,
            updating: AtomicBool::new(false),
            status: RwLock::new(DeviceStatus::default()),
        }
    }

    /// Probe a modem exposed by the modem management service
    pub fn probe_modem_manager(
        props: &ModemProperties,
        resolver: &dyn PortInfoResolver,
    ) -> Result<Self> {
        let methods = props.update_methods;
        if methods.is_empty() {
            return Err(UpdateError::NotSupported(
                "modem cannot be put in programming mode".to_string(),
            ));
        }

        let fastboot_at = if methods.contains(UpdateMethods::FASTBOOT) {
            let cmd = props.fastboot_at.clone().ok_or_else(|| {
                UpdateError::NotSupported("modem does not set fastboot command".to_string())
            })?;
            Some(cmd)
        } else {
            None
        };

        if props.device_ids.is_empty() {
            return Err(UpdateError::NotSupported(
                "modem did not specify any device IDs".to_string(),
            ));
        }

        let version = props.version.clone().ok_or_else(|| {
            UpdateError::NotSupported("modem did not specify a firmware version".to_string())
        })?;

        let mut ports = PortSet::default();
        for desc in &props.ports {
            let (kind, subsystem) = match desc.port_type {
                ModemPortType::At if methods.contains(UpdateMethods::FASTBOOT) => {
                    (PortKind::At, "tty")
                }
                ModemPortType::Qmi | ModemPortType::Mbim
                    if methods.contains(UpdateMethods::CONFIG_DB) =>
                {
                    (PortKind::ConfigDb, "usbmisc")
                }
                ModemPortType::Bhi if methods.contains(UpdateMethods::RAW_IMAGE) => {
                    (PortKind::Bhi, "mhi")
                }
                _ => continue,
            };
            let path = PathBuf::from("/dev").join(&desc.name);
            ports.offer(kind, Port::new(subsystem, path, None));
        }
        check_ports(methods, &ports)?;

        // The AT port is preferred: its interface number is needed to find it
        // again once the modem re-enumerates outside the management service.
        let primary = ports
            .at
            .as_mut()
            .or(ports.config_db.as_mut())
            .or(ports.bhi.as_mut())
            .ok_or_else(|| UpdateError::NotSupported("modem exposes no usable port".to_string()))?;
        let info = resolver.resolve(&primary.path).ok_or_else(|| {
            UpdateError::NotSupported("failed to find device sysfs path".to_string())
        })?;
        primary.interface_number = info.interface_number;
        let at_interface = ports.at.as_ref().and_then(|p| p.interface_number);

        let identity = DeviceIdentity {
            physical_id: info.device_sysfs_path.to_string_lossy().into_owned(),
            vendor: props.manufacturer.clone(),
            name: props.model.clone(),
            version: Some(version),
            device_ids: props.device_ids.clone(),
        };
        info!(
            "probed modem {} ({}) methods={}",
            identity.physical_id,
            identity.name.as_deref().unwrap_or("unknown"),
            methods
        );

        Ok(Self::new(
            DeviceKind::ModemManager {
                inhibition_uid: props.device.clone(),
            },
            identity,
            methods,
            fastboot_at,
            at_interface,
            ports,
        ))
    }

    /// Create a device for a modem found directly on the bus
    ///
    /// Update settings come from the managed device this one replaces, on the
    /// assumption that the update does not change the USB layout.
    pub fn udev(
        identity: DeviceIdentity,
        methods: UpdateMethods,
        fastboot_at: Option<String>,
        at_interface: Option<u8>,
    ) -> Self {
        debug!("creating udev-based modem device at {}", identity.physical_id);
        Self::new(
            DeviceKind::Udev,
            identity,
            methods,
            fastboot_at,
            at_interface,
            PortSet::default(),
        )
    }

    /// Offer a bus node to a udev-based device
    ///
    /// Control nodes (`usbmisc`) become the config-db port, the TTY on the
    /// remembered AT interface becomes the AT port and an `mhi`/`wwan` node
    /// named `*BHI*` becomes the boot host interface port. Everything else is
    /// ignored. Returns the role the port was given, if any.
    pub fn add_udev_port(
        &mut self,
        subsystem: &str,
        path: impl Into<PathBuf>,
        interface_number: Option<u8>,
    ) -> Option<PortKind> {
        let path = path.into();
        let node_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let kind = match subsystem {
            "usbmisc" => PortKind::ConfigDb,
            "tty" if interface_number.is_some() && interface_number == self.at_interface => {
                PortKind::At
            }
            "mhi" | "wwan" if node_name.contains("BHI") => PortKind::Bhi,
            _ => PortKind::Other,
        };
        let port = Port::new(subsystem, path.clone(), interface_number);
        if self.ports.offer(kind, port) {
            debug!("added {:?} port {} ({})", kind, path.display(), subsystem);
            Some(kind)
        } else {
            debug!("ignoring port {} ({})", path.display(), subsystem);
            None
        }
    }

    /// Verify the ports required by the advertised methods are present
    pub fn check_ports(&self) -> Result<()> {
        check_ports(self.methods, &self.ports)
    }

    pub fn kind(&self) -> &DeviceKind {
        &self.kind
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn physical_id(&self) -> &str {
        &self.identity.physical_id
    }

    pub fn methods(&self) -> UpdateMethods {
        self.methods
    }

    pub fn fastboot_command(&self) -> Option<&str> {
        self.fastboot_at.as_deref()
    }

    /// USB interface number of the AT port, carried across re-enumeration
    pub fn at_interface(&self) -> Option<u8> {
        self.at_interface
    }

    pub fn ports(&self) -> &PortSet {
        &self.ports
    }

    /// Inhibition id for managed devices
    pub fn inhibition_uid(&self) -> Option<&str> {
        match &self.kind {
            DeviceKind::ModemManager { inhibition_uid } => Some(inhibition_uid),
            DeviceKind::Udev => None,
        }
    }

    /// Take exclusive hold of the device for an update attempt
    ///
    /// Fails with [`UpdateError::Busy`] instead of blocking when another
    /// attempt holds the device.
    pub fn begin_update(&self) -> Result<UpdateGuard<'_>> {
        if self
            .updating
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(UpdateError::Busy(self.physical_id().to_string()));
        }
        debug!("locked device {}", self.physical_id());
        Ok(UpdateGuard { device: self })
    }

    /// Whether an update attempt currently holds the device
    pub fn is_locked(&self) -> bool {
        self.updating.load(Ordering::Acquire)
    }

    pub fn status(&self) -> DeviceStatus {
        self.status.read().clone()
    }

    pub fn state(&self) -> UpdateState {
        self.status.read().state.clone()
    }

    pub(crate) fn set_state(&self, state: UpdateState) {
        let mut status = self.status.write();
        if status.state != state {
            debug!(
                "device {}: {:?} -> {:?}",
                self.identity.physical_id, status.state, state
            );
            status.state = state;
        }
    }

    /// Declare that the device will leave the bus and come back within `window`
    pub(crate) fn expect_replug(&self, window: Duration) {
        let mut status = self.status.write();
        status.remove_delay = window;
        status.wait_for_replug = true;
        status.state = UpdateState::WaitingForReplug;
    }

    /// Called by the device management layer once the device is back
    pub fn replug_complete(&self) {
        let mut status = self.status.write();
        status.wait_for_replug = false;
        if status.state == UpdateState::WaitingForReplug {
            status.state = UpdateState::Idle;
        }
    }

    /// Multi-line description of the device's ports
    pub fn to_string_summary(&self) -> String {
        let mut out = format!("ModemDevice: {}\n", self.identity.physical_id);
        out.push_str(&format!("  methods:\t\t{}\n", self.methods));
        for (label, port) in [
            ("at-port", &self.ports.at),
            ("qmi-port", &self.ports.config_db),
            ("bhi-port", &self.ports.bhi),
        ] {
            if let Some(port) = port {
                out.push_str(&format!("  {label}:\t\t{}\n", port.path.display()));
            }
        }
        out
    }
}

fn check_ports(methods: UpdateMethods, ports: &PortSet) -> Result<()> {
    if methods.contains(UpdateMethods::FASTBOOT) && ports.at.is_none() {
        return Err(UpdateError::NotSupported("failed to find AT port".to_string()));
    }
    if methods.contains(UpdateMethods::CONFIG_DB) && ports.config_db.is_none() {
        return Err(UpdateError::NotSupported("failed to find QMI port".to_string()));
    }
    if methods.contains(UpdateMethods::RAW_IMAGE) && ports.bhi.is_none() {
        return Err(UpdateError::NotSupported("failed to find BHI port".to_string()));
    }
    Ok(())
}
