//! Update orchestration: detach, transfer, attach
//!
//! The orchestrator drives one device through the fixed phase order
//! `detach -> transfer -> attach`. Which phases do real work depends only on
//! the device's [`UpdateMethods`]:
//!
//! - `FASTBOOT`: detach sends the vendor AT command and the device is expected
//!   to re-enumerate in programming mode.
//! - `RAW_IMAGE`: transfer validates the bundle's rawprogram manifest and
//!   pushes every payload through the boot host interface, in manifest order.
//! - `CONFIG_DB`: transfer writes every `mcfg.<token>.mbn` payload to the
//!   configuration database, in archive order.
//!
//! Attach always runs and only declares the replug window for the device to
//! come back under its permanent identity. When the [`ReplugHandler`] hands
//! back a re-enumerated device after detach, transfer and attach continue on
//! that device and its new port nodes. No phase retries anything; the
//! first error aborts the attempt, marks the device `Failed` and is returned
//! with the phase and device prefixed.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::archive::{FirmwareArchive, FirmwareBundle, config_payloads};
use crate::at::{AT_PROBE, AtPort, AtTransport};
use crate::bhi::{BhiBackend, BhiChannel};
use crate::config::UpdaterConfig;
use crate::config_db::{ConfigDbSession, ConfigWriter};
use crate::device::ModemDevice;
use crate::error::{Result, ResultExt, UpdateError};
use crate::locker::DeviceLocker;
use crate::manifest::{ManifestValidator, find_manifest};
use crate::methods::UpdateMethods;
use crate::state::{UpdatePhase, UpdateState};

/// Hook for the device-management layer that owns replug waits
pub trait ReplugHandler: Send + Sync {
    /// Block until `device` has left and rejoined the bus, or give up after `window`
    ///
    /// Returns the device the modem re-enumerated as, or `None` when `device`
    /// and its ports are still valid.
    fn wait_for_replug(
        &self,
        device: &ModemDevice,
        window: Duration,
    ) -> Result<Option<ModemDevice>>;
}

/// [`ReplugHandler`] that only records the declared window
#[derive(Debug, Default, Clone, Copy)]
pub struct DeclareOnly;

impl ReplugHandler for DeclareOnly {
    fn wait_for_replug(
        &self,
        device: &ModemDevice,
        window: Duration,
    ) -> Result<Option<ModemDevice>> {
        info!(
            "device {} expected to replug within {} ms",
            device.physical_id(),
            window.as_millis()
        );
        Ok(None)
    }
}

/// External services the orchestrator drives
#[derive(Clone)]
pub struct Collaborators {
    pub at: Arc<dyn AtTransport>,
    pub config_db: Arc<dyn ConfigWriter>,
    pub bhi: Arc<dyn BhiBackend>,
    pub replug: Arc<dyn ReplugHandler>,
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

impl Collaborators {
    /// Collaborators with the [`DeclareOnly`] replug handler
    pub fn new(
        at: Arc<dyn AtTransport>,
        config_db: Arc<dyn ConfigWriter>,
        bhi: Arc<dyn BhiBackend>,
    ) -> Self {
        Self {
            at,
            config_db,
            bhi,
            replug: Arc::new(DeclareOnly),
        }
    }

    pub fn with_replug_handler(mut self, replug: Arc<dyn ReplugHandler>) -> Self {
        self.replug = replug;
        self
    }
}

/// Payloads moved during a transfer phase
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferReport {
    /// Config database payloads written, in write order
    pub config_files: Vec<String>,
    /// Raw images pushed through the boot host interface, in write order
    pub raw_images: Vec<String>,
}

/// Outcome of a complete [`UpdateOrchestrator::update`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateSummary {
    /// Physical id of the device
    pub device_id: String,

    pub methods: UpdateMethods,

    /// Phases that did work, in order
    pub phases: Vec<UpdatePhase>,

    #[serde(flatten)]
    pub transfer: TransferReport,

    /// Replug windows declared, in milliseconds
    pub replug_windows_ms: Vec<u64>,

    /// Wall time of the attempt
    #[serde(with = "duration_serde")]
    pub duration: Duration,
}

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        u64::try_from(duration.as_millis())
            .unwrap_or(u64::MAX)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Drives devices through detach, transfer and attach
#[derive(Debug, Clone)]
pub struct UpdateOrchestrator {
    config: UpdaterConfig,
    collaborators: Collaborators,
}

impl UpdateOrchestrator {
    /// Create an orchestrator; `config` is validated first
    pub fn new(config: UpdaterConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            collaborators,
        })
    }

    pub fn config(&self) -> &UpdaterConfig {
        &self.config
    }

    /// Put the device into programming mode
    ///
    /// A no-op for devices without `FASTBOOT`. On success the device is
    /// marked as expecting a replug within the fastboot window.
    pub fn detach(&self, device: &ModemDevice) -> Result<()> {
        let _guard = device.begin_update()?;
        self.run_phase(device, UpdatePhase::Detach, || self.detach_locked(device))
            .map(|_| ())
    }

    /// Decode `firmware` and transfer it
    ///
    /// Devices with neither `CONFIG_DB` nor `RAW_IMAGE` need nothing on the
    /// data path; the blob is not even decoded for them.
    pub fn write_firmware(&self, device: &ModemDevice, firmware: &[u8]) -> Result<TransferReport> {
        let _guard = device.begin_update()?;
        self.run_phase(device, UpdatePhase::Transfer, || {
            self.write_firmware_locked(device, firmware)
        })
        .map(|(_, report)| report)
    }

    /// Transfer an already decoded bundle
    pub fn write_archive(
        &self,
        device: &ModemDevice,
        archive: &dyn FirmwareArchive,
    ) -> Result<TransferReport> {
        let _guard = device.begin_update()?;
        self.run_phase(device, UpdatePhase::Transfer, || {
            device.check_ports()?;
            self.transfer_locked(device, archive)
        })
        .map(|(_, report)| report)
    }

    /// Release the device back to normal operation
    pub fn attach(&self, device: &ModemDevice) -> Result<()> {
        let _guard = device.begin_update()?;
        self.attach_locked(device);
        Ok(())
    }

    /// Run the whole update under one device lock
    ///
    /// If the modem comes back from detach as a new device, that device is
    /// locked as well and the remaining phases run against it.
    pub fn update(&self, device: &ModemDevice, firmware: &[u8]) -> Result<UpdateSummary> {
        let _guard = device.begin_update()?;
        let start = Instant::now();
        let methods = device.methods();
        info!(
            "starting update of {} (methods: {})",
            device.physical_id(),
            methods
        );

        let mut phases = Vec::new();
        let mut replug_windows_ms = Vec::new();

        let (detached, replugged) = self.run_phase(device, UpdatePhase::Detach, || {
            let detached = self.detach_locked(device)?;
            let replugged = self.settle(device, &mut replug_windows_ms)?;
            Ok((detached, replugged))
        })?;
        if detached {
            phases.push(UpdatePhase::Detach);
        }

        let _replugged_guard = replugged
            .as_ref()
            .map(ModemDevice::begin_update)
            .transpose()?;
        let target = match replugged.as_ref() {
            Some(fresh) => {
                info!("{} re-enumerated, continuing on the new nodes", device.physical_id());
                debug!("{}", fresh.to_string_summary().trim_end());
                fresh
            }
            None => device,
        };

        let (transferred, transfer) = self.run_phase(target, UpdatePhase::Transfer, || {
            self.write_firmware_locked(target, firmware)
        })?;
        if transferred {
            phases.push(UpdatePhase::Transfer);
        }

        // a device handed back after attach belongs to the caller
        self.run_phase(target, UpdatePhase::Attach, || {
            self.attach_locked(target);
            self.settle(target, &mut replug_windows_ms).map(|_| ())
        })?;
        phases.push(UpdatePhase::Attach);

        target.set_state(UpdateState::Idle);
        let duration = start.elapsed();
        info!(
            "update of {} complete in {} ms ({} config files, {} raw images)",
            target.physical_id(),
            duration.as_millis(),
            transfer.config_files.len(),
            transfer.raw_images.len()
        );

        Ok(UpdateSummary {
            device_id: target.physical_id().to_string(),
            methods,
            phases,
            transfer,
            replug_windows_ms,
            duration,
        })
    }

    fn run_phase<T>(
        &self,
        device: &ModemDevice,
        phase: UpdatePhase,
        f: impl FnOnce() -> Result<T>,
    ) -> Result<T> {
        f().map_err(|e| {
            device.set_state(UpdateState::Failed { phase });
            error!(
                "{} failed for {} ({}): {}",
                phase,
                device.physical_id(),
                e.kind(),
                e
            );
            e.context(format!("{phase} failed for {}", device.physical_id()))
        })
    }

    /// Returns whether a detach command was sent
    fn detach_locked(&self, device: &ModemDevice) -> Result<bool> {
        if !device.methods().contains(UpdateMethods::FASTBOOT) {
            debug!("{} does not need detaching", device.physical_id());
            return Ok(false);
        }

        let command = device.fastboot_command().ok_or_else(|| {
            UpdateError::NotSupported("modem does not set fastboot command".to_string())
        })?;
        let port = device
            .ports()
            .at
            .as_ref()
            .ok_or_else(|| UpdateError::NotSupported("failed to find AT port".to_string()))?;

        device.set_state(UpdateState::Detaching);
        let mut at = AtPort::new(
            self.collaborators.at.as_ref(),
            port.path.clone(),
            self.config.at_timeout(),
            self.config.verbose,
        );
        let mut locker = DeviceLocker::new(&mut at)?;
        locker.command(AT_PROBE)?;
        locker.command(command)?;
        locker.close()?;

        info!("{} detached with {}", device.physical_id(), command);
        device.expect_replug(self.config.fastboot_remove_delay());
        Ok(true)
    }

    /// Returns whether the device needed a transfer at all
    fn write_firmware_locked(
        &self,
        device: &ModemDevice,
        firmware: &[u8],
    ) -> Result<(bool, TransferReport)> {
        device.check_ports()?;
        if !device.methods().has_transfer() {
            debug!(
                "{} needs no data transfer, ignoring {} byte firmware",
                device.physical_id(),
                firmware.len()
            );
            return Ok((false, TransferReport::default()));
        }
        let bundle = FirmwareBundle::from_zip(firmware)?;
        self.transfer_locked(device, &bundle)
    }

    fn transfer_locked(
        &self,
        device: &ModemDevice,
        archive: &dyn FirmwareArchive,
    ) -> Result<(bool, TransferReport)> {
        let methods = device.methods();
        let mut report = TransferReport::default();
        if !methods.has_transfer() {
            return Ok((false, report));
        }

        device.set_state(UpdateState::Transferring);
        if methods.contains(UpdateMethods::RAW_IMAGE) {
            self.write_raw_images(device, archive, &mut report)?;
        }
        if methods.contains(UpdateMethods::CONFIG_DB) {
            self.write_config_payloads(device, archive, &mut report)?;
        }
        device.set_state(UpdateState::Idle);
        Ok((true, report))
    }

    fn write_raw_images(
        &self,
        device: &ModemDevice,
        archive: &dyn FirmwareArchive,
        report: &mut TransferReport,
    ) -> Result<()> {
        let port = device
            .ports()
            .bhi
            .as_ref()
            .ok_or_else(|| UpdateError::NotSupported("failed to find BHI port".to_string()))?;

        let prefix = self.config.manifest_prefix.as_str();
        let suffix = self.config.manifest_suffix.as_str();
        let manifest = find_manifest(archive, prefix, suffix).ok_or_else(|| {
            UpdateError::Validation(format!("no {prefix}*{suffix} manifest in firmware archive"))
        })?;
        let validated = ManifestValidator
            .validate(manifest.data, archive)
            .with_context(|| format!("validating {}", manifest.name))?;

        let mut channel = BhiChannel::new(
            self.collaborators.bhi.as_ref(),
            port.path.clone(),
            self.config.verbose,
        );
        let mut locker = DeviceLocker::new(&mut channel)?;
        for action in validated.payload_actions() {
            let Some(filename) = action.payload() else {
                continue;
            };
            let data = archive.lookup(filename).ok_or_else(|| {
                UpdateError::Validation(format!("{filename} not found in firmware archive"))
            })?;
            info!(
                "writing {} ({} bytes) to {}",
                filename,
                data.len(),
                device.physical_id()
            );
            locker
                .write(data)
                .with_context(|| format!("writing {filename}"))?;
            report.raw_images.push(filename.to_string());
        }
        locker.close()
    }

    fn write_config_payloads(
        &self,
        device: &ModemDevice,
        archive: &dyn FirmwareArchive,
        report: &mut TransferReport,
    ) -> Result<()> {
        let port = device
            .ports()
            .config_db
            .as_ref()
            .ok_or_else(|| UpdateError::NotSupported("failed to find QMI port".to_string()))?;

        let mut session = ConfigDbSession::new(
            self.collaborators.config_db.as_ref(),
            port.path.clone(),
            self.config.verbose,
        );
        let mut locker = DeviceLocker::new(&mut session)?;
        for entry in config_payloads(archive) {
            info!(
                "writing {} ({} bytes) to {}",
                entry.name,
                entry.data.len(),
                device.physical_id()
            );
            locker.write(entry.name, entry.data)?;
            report.config_files.push(entry.name.to_string());
        }
        if report.config_files.is_empty() {
            warn!("no configuration payloads in firmware archive");
        }
        locker.close()
    }

    fn attach_locked(&self, device: &ModemDevice) {
        device.set_state(UpdateState::Attaching);
        device.expect_replug(self.config.reprobe_remove_delay());
        debug!("{} attached", device.physical_id());
    }

    fn settle(
        &self,
        device: &ModemDevice,
        windows_ms: &mut Vec<u64>,
    ) -> Result<Option<ModemDevice>> {
        let status = device.status();
        if !status.wait_for_replug {
            return Ok(None);
        }
        windows_ms.push(u64::try_from(status.remove_delay.as_millis()).unwrap_or(u64::MAX));
        let replugged = self
            .collaborators
            .replug
            .wait_for_replug(device, status.remove_delay)?;
        device.replug_complete();
        Ok(replugged)
    }
}
