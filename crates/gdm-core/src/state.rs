//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Controller state owned by the control loop."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use gdm_bus::{EndpointHandle, Role};
use gdm_common::config::SensorDefaults;
use indexmap::IndexMap;

/// Set-points closer than this are considered equal.
pub const LIMIT_TOLERANCE_AMPS: f64 = 0.01;

/// Round a current limit to the 0.1 A precision used on the bus. Ties go to
/// the even tenth, so 56.25 becomes 56.2.
pub fn round_amps(value: f64) -> f64 {
    (value * 10.0).round_ties_even() / 10.0
}

/// Whether two limits differ by more than [`LIMIT_TOLERANCE_AMPS`].
pub fn limits_differ(a: f64, b: f64) -> bool {
    (a - b).abs() > LIMIT_TOLERANCE_AMPS
}

/// Normalized environmental readings. Every field always holds the last
/// good observation or its configured default.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnvironmentalSample {
    pub outdoor_temp_f: f64,
    pub altitude_ft: f64,
    pub generator_temp_f: f64,
}

impl EnvironmentalSample {
    pub fn from_defaults(defaults: &SensorDefaults) -> Self {
        Self {
            outdoor_temp_f: defaults.outdoor_temp_f,
            altitude_ft: defaults.altitude_ft,
            generator_temp_f: defaults.generator_temp_f,
        }
    }
}

impl Default for EnvironmentalSample {
    fn default() -> Self {
        Self::from_defaults(&SensorDefaults::default())
    }
}

/// Position of the "Gen Auto Current" switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AutoCurrentState {
    Off,
    On,
    /// Nothing read yet.
    #[default]
    Unknown,
}

/// The two synchronized set-points and the anti-oscillation memory.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LimitPair {
    /// Generator current limit setting as last observed or written.
    pub generator_limit: Option<f64>,
    /// AC-input current limit as last observed or written.
    pub ac_input_limit: Option<f64>,
    pub previous_generator_limit: Option<f64>,
    pub previous_ac_input_limit: Option<f64>,
    /// Set once a derated limit has been written successfully.
    pub derating_applied: bool,
}

impl LimitPair {
    /// Both sides agree within tolerance.
    pub fn is_settled(&self) -> bool {
        match (self.generator_limit, self.ac_input_limit) {
            (Some(generator), Some(ac)) => !limits_differ(generator, ac),
            _ => false,
        }
    }
}

/// Role to endpoint bindings discovered so far.
#[derive(Debug, Clone, Default)]
pub struct EndpointBindings {
    bound: IndexMap<Role, EndpointHandle>,
}

impl EndpointBindings {
    pub fn get(&self, role: Role) -> Option<&EndpointHandle> {
        self.bound.get(&role)
    }

    pub fn is_bound(&self, role: Role) -> bool {
        self.bound.contains_key(&role)
    }

    pub fn bind(&mut self, role: Role, endpoint: EndpointHandle) {
        self.bound.insert(role, endpoint);
    }

    pub fn unbind(&mut self, role: Role) -> Option<EndpointHandle> {
        self.bound.shift_remove(&role)
    }

    /// Roles without a binding, in discovery order.
    pub fn unresolved(&self) -> Vec<Role> {
        Role::ALL
            .into_iter()
            .filter(|role| !self.is_bound(*role))
            .collect()
    }
}

/// All mutable controller state, owned by the control loop and lent to each
/// step of a tick.
#[derive(Debug, Clone, Default)]
pub struct ControllerState {
    pub tick: u64,
    pub bindings: EndpointBindings,
    pub sample: EnvironmentalSample,
    pub auto_current: AutoCurrentState,
    pub generator_running: bool,
    pub limits: LimitPair,
}

impl ControllerState {
    pub fn new(defaults: &SensorDefaults) -> Self {
        Self {
            sample: EnvironmentalSample::from_defaults(defaults),
            ..Self::default()
        }
    }
}
