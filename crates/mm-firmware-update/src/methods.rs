//! Firmware update methods advertised by a modem

use std::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Update mechanisms a modem supports.
    ///
    /// Bits are independent; a modem may advertise several at once. The bit
    /// values match the modem management service's wire encoding.
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct UpdateMethods: u32 {
        /// Reboot into the bootloader with a vendor AT command
        const FASTBOOT  = 0b0000_0001;

        /// Write named blobs into the device-resident configuration database
        const CONFIG_DB = 0b0000_0010;

        /// Push images through the boot host interface in emergency download mode
        const RAW_IMAGE = 0b0000_0100;
    }
}

impl Default for UpdateMethods {
    fn default() -> Self {
        UpdateMethods::empty()
    }
}

impl UpdateMethods {
    /// Whether the write phase moves any data to the device
    pub fn has_transfer(self) -> bool {
        self.intersects(UpdateMethods::CONFIG_DB | UpdateMethods::RAW_IMAGE)
    }
}

impl fmt::Display for UpdateMethods {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("none");
        }
        let mut first = true;
        for (flag, name) in [
            (UpdateMethods::FASTBOOT, "fastboot"),
            (UpdateMethods::CONFIG_DB, "config-db"),
            (UpdateMethods::RAW_IMAGE, "raw-image"),
        ] {
            if self.contains(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_values() {
        assert_eq!(UpdateMethods::FASTBOOT.bits(), 1);
        assert_eq!(UpdateMethods::CONFIG_DB.bits(), 2);
        assert_eq!(UpdateMethods::RAW_IMAGE.bits(), 4);
        assert_eq!(UpdateMethods::from_bits_truncate(3), UpdateMethods::FASTBOOT | UpdateMethods::CONFIG_DB);
    }

    #[test]
    fn test_display() {
        assert_eq!(UpdateMethods::empty().to_string(), "none");
        assert_eq!(
            (UpdateMethods::FASTBOOT | UpdateMethods::CONFIG_DB).to_string(),
            "fastboot|config-db"
        );
        assert_eq!(UpdateMethods::RAW_IMAGE.to_string(), "raw-image");
    }

    #[test]
    fn test_has_transfer() {
        assert!(!UpdateMethods::FASTBOOT.has_transfer());
        assert!(UpdateMethods::CONFIG_DB.has_transfer());
        assert!((UpdateMethods::FASTBOOT | UpdateMethods::RAW_IMAGE).has_transfer());
    }
}
