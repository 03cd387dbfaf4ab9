//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the core runtime."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::{serde_as, DurationSeconds};
use tracing::debug;

use crate::logging::LogFormat;
use crate::role::Role;

fn default_poll_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_startup_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_settings_service() -> String {
    "com.victronenergy.settings".to_owned()
}

fn default_generator_limit_path() -> String {
    "/Settings/TransferSwitch/GeneratorCurrentLimit".to_owned()
}

fn default_ac_input_limit_path() -> String {
    "/Ac/ActiveIn/CurrentLimit".to_owned()
}

fn default_temperature_path() -> String {
    "/Temperature".to_owned()
}

fn default_altitude_path() -> String {
    "/Altitude".to_owned()
}

fn default_state_path() -> String {
    "/State".to_owned()
}

// 12 with the GUI mods installed, 3 on a stock install.
fn default_generator_on_states() -> Vec<i64> {
    vec![12, 3]
}

fn default_auto_current_on() -> i64 {
    3
}

fn default_auto_current_off() -> i64 {
    2
}

/// Primary configuration object for the monitor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub derating: DeratingConfig,
    #[serde(default)]
    pub defaults: SensorDefaults,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    /// `None` when no file was found and the built-in defaults are in effect.
    pub source: Option<PathBuf>,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &str = "GDM_CONFIG";

    /// Load configuration together with the effective source path,
    /// respecting the `GDM_CONFIG` override.
    ///
    /// Falls back to [`AppConfig::default`] when none of the candidates exist.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: Some(path),
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: Some(path),
                });
            }
        }

        debug!(
            inspected = %candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", "),
            "no configuration file found; using built-in defaults"
        );
        Ok(LoadedAppConfig {
            config: AppConfig::default(),
            source: None,
        })
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        contents
            .parse::<AppConfig>()
            .with_context(|| format!("invalid config file {}", path.display()))
    }

    /// Render the configuration as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("failed to serialize configuration")
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.control.validate()?;
        self.derating.validate()?;
        self.bus.validate()?;
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Loop timing.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlConfig {
    #[serde(default = "default_poll_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub poll_interval: Duration,
    #[serde(default = "default_startup_delay")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub startup_delay: Duration,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            startup_delay: default_startup_delay(),
        }
    }
}

impl ControlConfig {
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            return Err(anyhow!("control.poll_interval must be at least one second"));
        }
        Ok(())
    }
}

/// Constants of the environmental derating model.
///
/// Coefficients are fractions per unit: a 6% reduction per 10 °F above the
/// threshold is `0.006`, a 3% reduction per 1000 ft is `0.00003`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeratingConfig {
    /// Ambient temperature above which output starts to be derated.
    pub base_temperature_threshold_f: f64,
    pub temperature_coefficient: f64,
    /// Reduction per foot above sea level.
    pub altitude_coefficient: f64,
    /// Rated generator output at sea level, in amps.
    pub base_output_amps: f64,
    /// Keeps the generator below its rated capacity (0.9 = 90%).
    pub output_buffer: f64,
    pub high_generator_temp_threshold_f: f64,
    pub medium_generator_temp_threshold_f: f64,
    pub high_generator_temp_reduction: f64,
    pub medium_generator_temp_reduction: f64,
}

impl Default for DeratingConfig {
    fn default() -> Self {
        Self {
            base_temperature_threshold_f: 77.0,
            temperature_coefficient: 0.0065,
            altitude_coefficient: 0.00003,
            base_output_amps: 62.5,
            output_buffer: 0.9,
            high_generator_temp_threshold_f: 222.0,
            medium_generator_temp_threshold_f: 215.0,
            high_generator_temp_reduction: 0.86,
            medium_generator_temp_reduction: 0.93,
        }
    }
}

impl DeratingConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.temperature_coefficient >= 0.0 && self.altitude_coefficient >= 0.0) {
            return Err(anyhow!("derating coefficients must be non-negative"));
        }
        if !(self.base_output_amps > 0.0) {
            return Err(anyhow!("derating.base_output_amps must be positive"));
        }
        if !(self.output_buffer > 0.0 && self.output_buffer <= 1.0) {
            return Err(anyhow!("derating.output_buffer must be within (0, 1]"));
        }
        if self.medium_generator_temp_threshold_f > self.high_generator_temp_threshold_f {
            return Err(anyhow!(
                "derating.medium_generator_temp_threshold_f ({}) exceeds the high threshold ({})",
                self.medium_generator_temp_threshold_f,
                self.high_generator_temp_threshold_f
            ));
        }
        for (name, value) in [
            ("high_generator_temp_reduction", self.high_generator_temp_reduction),
            ("medium_generator_temp_reduction", self.medium_generator_temp_reduction),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(anyhow!("derating.{} must be within (0, 1]", name));
            }
        }
        Ok(())
    }
}

/// Values used until a sensor has reported at least once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorDefaults {
    pub outdoor_temp_f: f64,
    pub altitude_ft: f64,
    pub generator_temp_f: f64,
}

impl Default for SensorDefaults {
    fn default() -> Self {
        Self {
            outdoor_temp_f: 77.0,
            altitude_ft: 1000.0,
            generator_temp_f: 180.0,
        }
    }
}

/// Logical paths and raw state codes published on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusConfig {
    #[serde(default = "default_settings_service")]
    pub settings_service: String,
    #[serde(default = "default_generator_limit_path")]
    pub generator_limit_path: String,
    #[serde(default = "default_ac_input_limit_path")]
    pub ac_input_limit_path: String,
    #[serde(default = "default_temperature_path")]
    pub temperature_path: String,
    #[serde(default = "default_altitude_path")]
    pub altitude_path: String,
    #[serde(default = "default_state_path")]
    pub state_path: String,
    #[serde(default = "default_generator_on_states")]
    pub generator_on_states: Vec<i64>,
    #[serde(default = "default_auto_current_on")]
    pub auto_current_on: i64,
    #[serde(default = "default_auto_current_off")]
    pub auto_current_off: i64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            settings_service: default_settings_service(),
            generator_limit_path: default_generator_limit_path(),
            ac_input_limit_path: default_ac_input_limit_path(),
            temperature_path: default_temperature_path(),
            altitude_path: default_altitude_path(),
            state_path: default_state_path(),
            generator_on_states: default_generator_on_states(),
            auto_current_on: default_auto_current_on(),
            auto_current_off: default_auto_current_off(),
        }
    }
}

impl BusConfig {
    pub fn validate(&self) -> Result<()> {
        if self.settings_service.trim().is_empty() {
            return Err(anyhow!("bus.settings_service must not be empty"));
        }
        if self.auto_current_on == self.auto_current_off {
            return Err(anyhow!(
                "bus.auto_current_on and bus.auto_current_off must differ (both {})",
                self.auto_current_on
            ));
        }
        Ok(())
    }
}

/// Name-matching rule used to bind a role to a bus service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleMatcher {
    /// Service names must start with this prefix.
    pub prefix: String,
    /// Paths holding the advertised name, checked in order.
    #[serde(default)]
    pub name_paths: Vec<String>,
    /// Substrings accepted in the advertised name. Empty takes the first service.
    #[serde(default)]
    pub keywords: Vec<String>,
}

impl RoleMatcher {
    fn new(prefix: &str, name_paths: &[&str], keywords: &[&str]) -> Self {
        Self {
            prefix: prefix.to_owned(),
            name_paths: name_paths.iter().map(|p| (*p).to_owned()).collect(),
            keywords: keywords.iter().map(|k| (*k).to_owned()).collect(),
        }
    }

    /// Built-in matcher for a role.
    pub fn default_for(role: Role) -> Self {
        match role {
            Role::Inverter => Self::new("com.victronenergy.vebus", &[], &[]),
            Role::OutdoorTemperature => {
                Self::new("com.victronenergy.temperature", &["/CustomName"], &["Outdoor"])
            }
            Role::GeneratorTemperature => Self::new(
                "com.victronenergy.temperature",
                &["/CustomName", "/ProductName"],
                &["gen", "Gen", "generator", "Generator"],
            ),
            Role::Gps => Self::new("com.victronenergy.gps", &[], &[]),
            Role::TransferSwitch => Self::new(
                "com.victronenergy.digitalinput",
                &["/ProductName"],
                &["Transfer Switch", "transfer switch"],
            ),
            Role::AutoCurrent => Self::new(
                "com.victronenergy.digitalinput",
                &["/ProductName"],
                &["Gen Auto Current", "gen auto current"],
            ),
        }
    }
}

fn default_inverter_matcher() -> RoleMatcher {
    RoleMatcher::default_for(Role::Inverter)
}

fn default_outdoor_matcher() -> RoleMatcher {
    RoleMatcher::default_for(Role::OutdoorTemperature)
}

fn default_generator_temp_matcher() -> RoleMatcher {
    RoleMatcher::default_for(Role::GeneratorTemperature)
}

fn default_gps_matcher() -> RoleMatcher {
    RoleMatcher::default_for(Role::Gps)
}

fn default_transfer_switch_matcher() -> RoleMatcher {
    RoleMatcher::default_for(Role::TransferSwitch)
}

fn default_auto_current_matcher() -> RoleMatcher {
    RoleMatcher::default_for(Role::AutoCurrent)
}

/// Per-role discovery rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_inverter_matcher")]
    pub inverter: RoleMatcher,
    #[serde(default = "default_outdoor_matcher")]
    pub outdoor_temperature: RoleMatcher,
    #[serde(default = "default_generator_temp_matcher")]
    pub generator_temperature: RoleMatcher,
    #[serde(default = "default_gps_matcher")]
    pub gps: RoleMatcher,
    #[serde(default = "default_transfer_switch_matcher")]
    pub transfer_switch: RoleMatcher,
    #[serde(default = "default_auto_current_matcher")]
    pub auto_current: RoleMatcher,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            inverter: default_inverter_matcher(),
            outdoor_temperature: default_outdoor_matcher(),
            generator_temperature: default_generator_temp_matcher(),
            gps: default_gps_matcher(),
            transfer_switch: default_transfer_switch_matcher(),
            auto_current: default_auto_current_matcher(),
        }
    }
}

impl DiscoveryConfig {
    pub fn matcher(&self, role: Role) -> &RoleMatcher {
        match role {
            Role::Inverter => &self.inverter,
            Role::OutdoorTemperature => &self.outdoor_temperature,
            Role::GeneratorTemperature => &self.generator_temperature,
            Role::Gps => &self.gps,
            Role::TransferSwitch => &self.transfer_switch,
            Role::AutoCurrent => &self.auto_current,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

/// Services published by the simulated bus, keyed by service name then path.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    #[serde(default)]
    pub services: IndexMap<String, IndexMap<String, Value>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_documented_defaults() {
        let config: AppConfig = "".parse().expect("empty config parses");
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.control.poll_interval, Duration::from_secs(5));
        assert_eq!(config.derating.base_output_amps, 62.5);
        assert_eq!(config.defaults.altitude_ft, 1000.0);
        assert_eq!(config.bus.generator_on_states, vec![12, 3]);
    }

    #[test]
    fn partial_sections_keep_remaining_defaults() {
        let config: AppConfig = r#"
            [control]
            poll_interval = 10

            [derating]
            base_output_amps = 50.0

            [discovery.outdoor_temperature]
            prefix = "com.victronenergy.temperature"
            name_paths = ["/CustomName"]
            keywords = ["Ambient"]
        "#
        .parse()
        .expect("partial config parses");

        assert_eq!(config.control.poll_interval, Duration::from_secs(10));
        assert_eq!(config.control.startup_delay, Duration::from_secs(5));
        assert_eq!(config.derating.base_output_amps, 50.0);
        assert_eq!(config.derating.output_buffer, 0.9);
        assert_eq!(
            config.discovery.matcher(Role::OutdoorTemperature).keywords,
            vec!["Ambient".to_owned()]
        );
        assert_eq!(
            config.discovery.matcher(Role::Inverter),
            &RoleMatcher::default_for(Role::Inverter)
        );
    }

    #[test]
    fn rejects_inverted_generator_thresholds() {
        let err = r#"
            [derating]
            high_generator_temp_threshold_f = 210.0
            medium_generator_temp_threshold_f = 215.0
        "#
        .parse::<AppConfig>()
        .unwrap_err();
        assert!(format!("{err:#}").contains("exceeds the high threshold"));
    }

    #[test]
    fn rejects_out_of_range_buffer_and_zero_interval() {
        assert!("[derating]\noutput_buffer = 1.5".parse::<AppConfig>().is_err());
        assert!("[derating]\nbase_output_amps = 0.0".parse::<AppConfig>().is_err());
        assert!("[control]\npoll_interval = 0".parse::<AppConfig>().is_err());
    }

    #[test]
    fn simulation_services_accept_scalars_and_arrays() {
        let config: AppConfig = r#"
            [simulation.services."com.victronenergy.gps.ve_ttyUSB0"]
            "/Altitude" = [1524.0]

            [simulation.services."com.victronenergy.settings"]
            "/Settings/TransferSwitch/GeneratorCurrentLimit" = 45.0
        "#
        .parse()
        .expect("simulation config parses");
        let gps = &config.simulation.services["com.victronenergy.gps.ve_ttyUSB0"];
        assert_eq!(gps["/Altitude"], serde_json::json!([1524.0]));
    }

    #[test]
    fn defaults_round_trip_through_toml() {
        let rendered = AppConfig::default().to_toml().expect("serializes");
        let parsed: AppConfig = rendered.parse().expect("re-parses");
        assert_eq!(parsed, AppConfig::default());
    }
}
