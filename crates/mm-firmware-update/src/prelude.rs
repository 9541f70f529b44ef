//! Convenience re-exports for common modem update types

pub use crate::archive::{FirmwareArchive, FirmwareBundle};
pub use crate::at::AtTransport;
#[cfg(target_os = "linux")]
pub use crate::bhi::MhiBhiBackend;
pub use crate::bhi::{BhiBackend, BhiDevice, BhiDeviceInfo};
pub use crate::config::UpdaterConfig;
pub use crate::config_db::{ConfigHandle, ConfigWriter};
pub use crate::device::{DeviceIdentity, ModemDevice, ModemProperties};
pub use crate::error::{ErrorKind, ResultExt, UpdateError};
pub use crate::manifest::{ManifestAction, ManifestValidator};
pub use crate::methods::UpdateMethods;
pub use crate::orchestrator::{
    Collaborators, ReplugHandler, TransferReport, UpdateOrchestrator, UpdateSummary,
};
pub use crate::port::{PortInfoResolver, PortKind};
pub use crate::state::{UpdatePhase, UpdateState};
pub use crate::sysfs::SysfsResolver;
#[cfg(unix)]
pub use crate::tty::TtyTransport;
