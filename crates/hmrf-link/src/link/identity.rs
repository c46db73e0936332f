// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Identity of the attached radio module, filled in by detection.

use serde::Serialize;
use std::fmt;

/// Hardware flavour of the attached module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum ModuleType {
    /// Nothing detected (yet).
    #[default]
    None,
    /// HM-MOD-RPI-PCB, legacy or dual co-processor firmware.
    HmModRpiPcb,
    /// RPI-RF-MOD.
    RpiRfMod,
}

impl fmt::Display for ModuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleType::None => write!(f, "-"),
            ModuleType::HmModRpiPcb => write!(f, "HM-MOD-RPI-PCB"),
            ModuleType::RpiRfMod => write!(f, "RPI-RF-MOD"),
        }
    }
}

/// What detection learned about the module.
///
/// Fields are only meaningful once `module_type != ModuleType::None`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleIdentity {
    /// 10-character serial, or the SGTIN hex string on RPI-RF-MOD.
    pub serial: String,
    /// 24 uppercase hex characters, empty on legacy firmware.
    pub sgtin: String,
    /// 24-bit BidCoS radio address, 0 when unset.
    pub bidcos_radio_mac: u32,
    /// 24-bit HmIP radio address, 0 when unset.
    pub hmip_radio_mac: u32,
    pub firmware_version: [u8; 3],
    pub module_type: ModuleType,
}

impl ModuleIdentity {
    pub fn is_detected(&self) -> bool {
        self.module_type != ModuleType::None
    }

    pub fn firmware_version_string(&self) -> String {
        let [a, b, c] = self.firmware_version;
        format!("{}.{}.{}", a, b, c)
    }

    /// Serializable status view, as shown on a status page.
    pub fn status(&self) -> IdentityStatus {
        IdentityStatus {
            module_type: self.module_type.to_string(),
            serial: self.serial.clone(),
            sgtin: self.sgtin.clone(),
            bidcos_radio_mac: format!("0x{:06X}", self.bidcos_radio_mac),
            hmip_radio_mac: format!("0x{:06X}", self.hmip_radio_mac),
            firmware_version: self.firmware_version_string(),
        }
    }
}

/// Display form of [`ModuleIdentity`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdentityStatus {
    pub module_type: String,
    pub serial: String,
    pub sgtin: String,
    pub bidcos_radio_mac: String,
    pub hmip_radio_mac: String,
    pub firmware_version: String,
}
