//! Firmware updates for mobile-broadband modems
//!
//! Modems advertise one or more update methods:
//! - `FASTBOOT`: a vendor AT command reboots the modem into its bootloader
//! - `CONFIG_DB`: `mcfg.<token>.mbn` blobs are written to the device-resident
//!   configuration database
//! - `RAW_IMAGE`: images listed in a rawprogram manifest are pushed through the
//!   boot host interface while the modem is in emergency download mode
//!
//! Every update runs the same fixed lifecycle, `detach -> transfer -> attach`,
//! skipping the phases a device's methods do not need. The modem may drop off
//! the bus and come back between phases; the crate only declares how long
//! that may take and leaves the waiting to the device-management layer
//! through a [`ReplugHandler`].
//!
//! # Architecture
//!
//! - [`device`]: device probing and the per-device update lock
//! - [`orchestrator`]: the phase state machine
//! - [`at`], [`tty`]: AT command channel used for the fastboot detach
//! - [`bhi`]: boot host interface raw image loader
//! - [`config_db`]: configuration database session
//! - [`manifest`]: rawprogram manifest parsing and validation
//! - [`archive`]: firmware bundle decoding and payload selection
//! - [`locker`]: scoped open/close of device resources
//! - [`mock`]: recording doubles of every external collaborator
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use mm_firmware_update::prelude::*;
//!
//! let collaborators = Collaborators::new(
//!     Arc::new(TtyTransport),
//!     Arc::new(my_qmi_pdc_writer),
//!     Arc::new(MhiBhiBackend),
//! );
//! let orchestrator = UpdateOrchestrator::new(UpdaterConfig::default(), collaborators)?;
//!
//! let device = ModemDevice::probe_modem_manager(&properties, &SysfsResolver::default())?;
//! let summary = orchestrator.update(&device, &firmware_zip)?;
//! println!("wrote {:?}", summary.transfer.config_files);
//! ```

#![deny(unsafe_op_in_unsafe_fn, clippy::unwrap_used)]
#![warn(rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod archive;
pub mod at;
pub mod bhi;
pub mod config;
pub mod config_db;
pub mod device;
pub mod error;
pub mod locker;
pub mod logging;
pub mod manifest;
pub mod methods;
pub mod mock;
pub mod orchestrator;
pub mod port;
pub mod prelude;
pub mod state;
pub mod sysfs;
#[cfg(unix)]
pub mod tty;

pub use archive::{ArchiveEntry, FirmwareArchive, FirmwareBundle, config_payloads, is_config_payload};
pub use at::{AT_ACK, AtChannel, AtPort, AtTransport, check_ack};
#[cfg(target_os = "linux")]
pub use bhi::MhiBhiBackend;
pub use bhi::{
    BhiBackend, BhiChannel, BhiDevice, BhiDeviceInfo, ExecutionEnvironment, MHI_EE_EDL,
    frame_image,
};
pub use config::UpdaterConfig;
pub use config_db::{ConfigDbSession, ConfigHandle, ConfigWriter};
pub use device::{
    DeviceIdentity, DeviceKind, DeviceStatus, ModemDevice, ModemPortDescriptor, ModemPortType,
    ModemProperties, UpdateGuard,
};
pub use error::{ErrorKind, Result, ResultExt, UpdateError};
pub use locker::{DeviceLocker, Lockable};
pub use manifest::{ActionKind, ManifestAction, ManifestValidator, ValidatedManifest, find_manifest};
pub use methods::UpdateMethods;
pub use orchestrator::{
    Collaborators, DeclareOnly, ReplugHandler, TransferReport, UpdateOrchestrator, UpdateSummary,
};
pub use port::{Port, PortInfo, PortInfoResolver, PortKind, PortSet};
pub use state::{UpdatePhase, UpdateState};
pub use sysfs::SysfsResolver;
#[cfg(unix)]
pub use tty::TtyTransport;
