//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Primary control loop and lifecycle management."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Generator derating controller: sensor normalization, the derating model,
//! current-limit synchronization and the control loop that drives them.

pub mod control_loop;
pub mod derating;
pub mod normalizer;
pub mod state;
pub mod synchronizer;

pub use control_loop::{ControlLoop, ControlLoopHandle, TickReport};
pub use derating::{DeratingCalculator, DeratingFactor};
pub use normalizer::{RawEnvironment, Reading, ReadingError, SensorNormalizer};
pub use state::{
    limits_differ, round_amps, AutoCurrentState, ControllerState, EndpointBindings,
    EnvironmentalSample, LimitPair, LIMIT_TOLERANCE_AMPS,
};
pub use synchronizer::{LimitSynchronizer, SyncInputs, SyncReport};
