//! Device profiles: where a device type keeps its slave ID and baud rate.
//!
//! Profiles are held in memory only. Additional profiles can be read from YAML
//! with the `serde` feature:
//!
//! ```yaml
//! - name: Energy Meter
//!   slave_id_register: 20
//!   baud_rate_register: 21
//!   description: DIN rail energy meter
//! ```

use crate::protocol::{self as proto, SlaveId};
use std::collections::BTreeMap;

/// Register layout of a configurable device type.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceProfile {
    pub name: String,
    pub slave_id_register: u16,
    pub baud_rate_register: u16,
    #[cfg_attr(feature = "serde", serde(default))]
    pub description: String,
}

impl DeviceProfile {
    pub fn new(
        name: impl Into<String>,
        slave_id_register: u16,
        baud_rate_register: u16,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            slave_id_register,
            baud_rate_register,
            description: description.into(),
        }
    }

    /// Register values that give a device a new slave ID and baud rate.
    ///
    /// The baud rate is written as its plain value, so rates above 65535 can not
    /// be stored by this kind of device.
    pub fn register_updates(
        &self,
        new_slave_id: u8,
        new_baud_rate: u32,
    ) -> Result<BTreeMap<u16, u16>, proto::Error> {
        let slave_id = SlaveId::try_from(new_slave_id)?;
        let baud_rate = u16::try_from(new_baud_rate)
            .map_err(|_| proto::Error::RegisterValueOutOfRange(new_baud_rate))?;
        Ok(BTreeMap::from([
            (self.slave_id_register, u16::from(*slave_id)),
            (self.baud_rate_register, baud_rate),
        ]))
    }
}

/// Named profiles, in insertion order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceProfiles(Vec<DeviceProfile>);

impl Default for DeviceProfiles {
    /// The built-in profiles.
    fn default() -> Self {
        Self(vec![
            DeviceProfile::new("Generic", 2048, 2051, "Generic Modbus device"),
            DeviceProfile::new("Custom Device 1", 1000, 1001, "Custom device type 1"),
            DeviceProfile::new("Custom Device 2", 40001, 40002, "Custom device type 2"),
        ])
    }
}

impl DeviceProfiles {
    /// Looks up a profile by name, ignoring case.
    pub fn get(&self, name: &str) -> Option<&DeviceProfile> {
        self.0
            .iter()
            .find(|profile| profile.name.eq_ignore_ascii_case(name))
    }

    /// Adds profiles; a profile replaces an existing one with the same name.
    pub fn extend(&mut self, profiles: impl IntoIterator<Item = DeviceProfile>) {
        for profile in profiles {
            match self
                .0
                .iter_mut()
                .find(|existing| existing.name.eq_ignore_ascii_case(&profile.name))
            {
                Some(existing) => *existing = profile,
                None => self.0.push(profile),
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeviceProfile> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Parses a YAML list of profiles.
    #[cfg(feature = "serde")]
    pub fn parse_yaml(yaml: &str) -> crate::Result<Vec<DeviceProfile>> {
        Ok(serde_yaml::from_str(yaml)?)
    }
}
