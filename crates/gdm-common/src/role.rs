//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the core runtime."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fmt;

use serde::{Deserialize, Serialize};

/// Logical roles the controller needs bound to a bus endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Inverter,
    OutdoorTemperature,
    GeneratorTemperature,
    Gps,
    TransferSwitch,
    AutoCurrent,
}

impl Role {
    /// Every role, in discovery order.
    pub const ALL: [Role; 6] = [
        Role::Inverter,
        Role::OutdoorTemperature,
        Role::GeneratorTemperature,
        Role::Gps,
        Role::TransferSwitch,
        Role::AutoCurrent,
    ];

    /// Stable snake_case name, as used in configuration and log fields.
    pub fn name(&self) -> &'static str {
        match self {
            Role::Inverter => "inverter",
            Role::OutdoorTemperature => "outdoor_temperature",
            Role::GeneratorTemperature => "generator_temperature",
            Role::Gps => "gps",
            Role::TransferSwitch => "transfer_switch",
            Role::AutoCurrent => "auto_current",
        }
    }

    /// Human-readable description used in log lines.
    pub fn label(&self) -> &'static str {
        match self {
            Role::Inverter => "VE.Bus inverter/charger",
            Role::OutdoorTemperature => "outdoor temperature sensor",
            Role::GeneratorTemperature => "generator temperature sensor",
            Role::Gps => "GPS",
            Role::TransferSwitch => "transfer switch input",
            Role::AutoCurrent => "'Gen Auto Current' input",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
