//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the core runtime."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Shared primitives for the generator derating monitor workspace:
//! configuration loading, tracing bootstrap and the logical bus roles.

pub mod config;
pub mod logging;
pub mod role;

pub use config::{
    AppConfig, BusConfig, ControlConfig, DeratingConfig, DiscoveryConfig, LoadedAppConfig,
    LoggingConfig, RoleMatcher, SensorDefaults, SimulationConfig,
};
pub use logging::{init_tracing, LogFormat};
pub use role::Role;
