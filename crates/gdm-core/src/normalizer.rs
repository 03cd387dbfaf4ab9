//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Unit conversion and last-known-good handling of sensor readings."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Turns raw bus values into the typed controller inputs.
//!
//! Every field of the [`EnvironmentalSample`] keeps its last good value when
//! a read fails or returns something unusable, and the digital inputs are
//! decoded from their raw state codes.

use gdm_bus::{BusError, Role};
use gdm_common::config::BusConfig;
use gdm_logging::{gdm_debug, gdm_info, gdm_warn, LatchReport, LogContext, LogLatch};
use serde_json::Value;

use crate::state::{AutoCurrentState, EnvironmentalSample};

const FEET_PER_METER: f64 = 3.28084;

/// Why a reading could not be used.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ReadingError {
    #[error("role is not bound to an endpoint")]
    Unbound,
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error("value {0} is not numeric")]
    NotNumeric(Value),
    #[error("altitude sequence is empty")]
    EmptySequence,
    #[error("state code {0} is not recognised")]
    UnknownState(i64),
}

/// Outcome of reading one raw value off the bus.
pub type Reading = Result<Value, ReadingError>;

pub fn celsius_to_fahrenheit(celsius: f64) -> f64 {
    celsius * 9.0 / 5.0 + 32.0
}

pub fn meters_to_feet(meters: f64) -> f64 {
    meters * FEET_PER_METER
}

/// Interpret a bus value as a number. Integers, floats and numeric strings
/// are accepted.
pub fn numeric(value: &Value) -> Result<f64, ReadingError> {
    let parsed = match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed
        .filter(|number| number.is_finite())
        .ok_or_else(|| ReadingError::NotNumeric(value.clone()))
}

/// Altitude in meters; GPS services may wrap it in a sequence, in which
/// case the first element is used.
pub fn altitude_meters(value: &Value) -> Result<f64, ReadingError> {
    match value {
        Value::Array(items) => items
            .first()
            .ok_or(ReadingError::EmptySequence)
            .and_then(numeric),
        other => numeric(other),
    }
}

/// Integral state code of a digital input.
pub fn state_code(value: &Value) -> Result<i64, ReadingError> {
    let number = numeric(value)?;
    if number.fract() == 0.0 {
        Ok(number as i64)
    } else {
        Err(ReadingError::NotNumeric(value.clone()))
    }
}

/// Raw readings gathered for one refresh of the environmental sample.
#[derive(Debug, Clone)]
pub struct RawEnvironment {
    pub outdoor_temp_c: Reading,
    pub altitude_m: Reading,
    pub generator_temp_c: Reading,
}

impl RawEnvironment {
    /// Nothing could be read.
    pub fn unbound() -> Self {
        Self {
            outdoor_temp_c: Err(ReadingError::Unbound),
            altitude_m: Err(ReadingError::Unbound),
            generator_temp_c: Err(ReadingError::Unbound),
        }
    }
}

#[derive(Debug, Default)]
struct Latches {
    outdoor: LogLatch,
    altitude: LogLatch,
    generator: LogLatch,
    transfer_switch: LogLatch,
    auto_current: LogLatch,
}

/// Stateful normalizer; it only remembers what has already been logged.
#[derive(Debug)]
pub struct SensorNormalizer {
    generator_on_states: Vec<i64>,
    auto_current_on: i64,
    auto_current_off: i64,
    latches: Latches,
}

impl SensorNormalizer {
    pub fn new(bus: &BusConfig) -> Self {
        Self {
            generator_on_states: bus.generator_on_states.clone(),
            auto_current_on: bus.auto_current_on,
            auto_current_off: bus.auto_current_off,
            latches: Latches::default(),
        }
    }

    /// Fold `raw` into `sample`, keeping prior values for anything unusable.
    pub fn apply(&mut self, sample: &mut EnvironmentalSample, raw: RawEnvironment, tick: u64) {
        let outdoor = raw
            .outdoor_temp_c
            .and_then(|value| numeric(&value))
            .map(celsius_to_fahrenheit);
        if let Some(value) = observe(
            &mut self.latches.outdoor,
            Role::OutdoorTemperature,
            "°F",
            outdoor,
            sample.outdoor_temp_f,
            tick,
        ) {
            sample.outdoor_temp_f = value;
        }

        let altitude = raw
            .altitude_m
            .and_then(|value| altitude_meters(&value))
            .map(meters_to_feet);
        if let Some(value) = observe(
            &mut self.latches.altitude,
            Role::Gps,
            "ft",
            altitude,
            sample.altitude_ft,
            tick,
        ) {
            sample.altitude_ft = value;
        }

        let generator = raw
            .generator_temp_c
            .and_then(|value| numeric(&value))
            .map(celsius_to_fahrenheit);
        if let Some(value) = observe(
            &mut self.latches.generator,
            Role::GeneratorTemperature,
            "°F",
            generator,
            sample.generator_temp_f,
            tick,
        ) {
            sample.generator_temp_f = value;
        }
    }

    /// Decode the "Gen Auto Current" input. Failed reads and unrecognised
    /// codes leave `current` unchanged.
    pub fn auto_current(
        &mut self,
        current: AutoCurrentState,
        reading: Reading,
        tick: u64,
    ) -> AutoCurrentState {
        let ctx = LogContext::new()
            .with_tick(tick)
            .with_role(Role::AutoCurrent.name());
        let decoded = reading
            .and_then(|value| state_code(&value))
            .and_then(|code| {
                if code == self.auto_current_on {
                    Ok(AutoCurrentState::On)
                } else if code == self.auto_current_off {
                    Ok(AutoCurrentState::Off)
                } else {
                    Err(ReadingError::UnknownState(code))
                }
            });

        match decoded {
            Ok(next) => {
                self.latches.auto_current.success();
                if next != current {
                    gdm_info!(context = ctx, "auto current changed {:?} -> {:?}", current, next);
                } else {
                    gdm_debug!(context = ctx, "auto current is {:?}", next);
                }
                next
            }
            Err(err) => {
                report_failure(&mut self.latches.auto_current, &ctx, &err);
                current
            }
        }
    }

    /// Whether the transfer switch reports the generator as the active
    /// source. Anything unreadable counts as not running.
    pub fn generator_running(&mut self, was_running: bool, reading: Reading, tick: u64) -> bool {
        let ctx = LogContext::new()
            .with_tick(tick)
            .with_role(Role::TransferSwitch.name());
        match reading.and_then(|value| state_code(&value)) {
            Ok(code) => {
                self.latches.transfer_switch.success();
                let running = self.generator_on_states.contains(&code);
                if running != was_running {
                    gdm_info!(
                        context = ctx,
                        "generator {} (transfer switch state {})",
                        if running { "running" } else { "stopped" },
                        code
                    );
                }
                running
            }
            Err(err) => {
                report_failure(&mut self.latches.transfer_switch, &ctx, &err);
                if was_running {
                    gdm_info!(context = ctx, "generator treated as stopped");
                }
                false
            }
        }
    }
}

fn observe(
    latch: &mut LogLatch,
    role: Role,
    unit: &str,
    reading: Result<f64, ReadingError>,
    retained: f64,
    tick: u64,
) -> Option<f64> {
    let ctx = LogContext::new().with_tick(tick).with_role(role.name());
    match reading {
        Ok(value) => {
            match latch.success() {
                LatchReport::First => {
                    gdm_info!(context = ctx, "{} reading available: {:.1} {}", role.label(), value, unit)
                }
                LatchReport::Recovered => {
                    gdm_info!(context = ctx, "{} reading recovered: {:.1} {}", role.label(), value, unit)
                }
                LatchReport::Steady => {
                    gdm_debug!(context = ctx, "{}: {:.1} {}", role.label(), value, unit)
                }
            }
            Some(value)
        }
        Err(err) => {
            if report_failure(latch, &ctx, &err) {
                gdm_debug!(context = ctx, "keeping {:.1} {} for {}", retained, unit, role.label());
            }
            None
        }
    }
}

/// Log the first failure of a streak. Returns whether anything was logged.
fn report_failure(latch: &mut LogLatch, ctx: &LogContext<'_>, err: &ReadingError) -> bool {
    if !latch.failure() {
        return false;
    }
    match err {
        ReadingError::Unbound => gdm_debug!(context = ctx, "no endpoint bound"),
        other => gdm_warn!(context = ctx, "unusable reading: {}", other),
    }
    true
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn normalizer() -> SensorNormalizer {
        SensorNormalizer::new(&BusConfig::default())
    }

    fn raw(outdoor: Reading, altitude: Reading, generator: Reading) -> RawEnvironment {
        RawEnvironment {
            outdoor_temp_c: outdoor,
            altitude_m: altitude,
            generator_temp_c: generator,
        }
    }

    #[test]
    fn converts_units() {
        assert_eq!(celsius_to_fahrenheit(25.0), 77.0);
        assert_eq!(celsius_to_fahrenheit(-40.0), -40.0);
        assert!((meters_to_feet(1000.0) - 3280.84).abs() < 1e-9);
    }

    #[test]
    fn numeric_accepts_numbers_and_numeric_strings() {
        assert_eq!(numeric(&json!(12)).unwrap(), 12.0);
        assert_eq!(numeric(&json!(21.5)).unwrap(), 21.5);
        assert_eq!(numeric(&json!(" 30.5 ")).unwrap(), 30.5);
        assert!(numeric(&json!("warm")).is_err());
        assert!(numeric(&json!(true)).is_err());
        assert!(numeric(&Value::Null).is_err());
        assert!(numeric(&json!({"value": 1})).is_err());
    }

    #[test]
    fn altitude_unwraps_first_sequence_element() {
        assert_eq!(altitude_meters(&json!([250.0, 1.0])).unwrap(), 250.0);
        assert_eq!(altitude_meters(&json!(250.0)).unwrap(), 250.0);
        assert_eq!(
            altitude_meters(&json!([])).unwrap_err(),
            ReadingError::EmptySequence
        );
    }

    #[test]
    fn good_readings_are_converted_into_the_sample() {
        let mut sample = EnvironmentalSample::default();
        normalizer().apply(
            &mut sample,
            raw(Ok(json!(30.0)), Ok(json!([100.0])), Ok(json!("100"))),
            1,
        );
        assert_eq!(sample.outdoor_temp_f, 86.0);
        assert!((sample.altitude_ft - 328.084).abs() < 1e-9);
        assert_eq!(sample.generator_temp_f, 212.0);
    }

    #[test]
    fn failures_keep_the_last_good_value() {
        let mut norm = normalizer();
        let mut sample = EnvironmentalSample::default();
        norm.apply(
            &mut sample,
            raw(Ok(json!(35.0)), Ok(json!(500.0)), Ok(json!(90.0))),
            1,
        );
        let before = sample;

        norm.apply(
            &mut sample,
            raw(
                Err(ReadingError::Bus(BusError::Timeout {
                    service: "com.victronenergy.temperature.adc_2".into(),
                    path: "/Temperature".into(),
                })),
                Ok(json!([])),
                Ok(json!("hot")),
            ),
            2,
        );
        assert_eq!(sample, before);
    }

    #[test]
    fn defaults_hold_until_something_is_observed() {
        let mut norm = normalizer();
        let mut sample = EnvironmentalSample::default();
        for tick in 1..=3 {
            norm.apply(&mut sample, RawEnvironment::unbound(), tick);
        }
        assert_eq!(sample.outdoor_temp_f, 77.0);
        assert_eq!(sample.altitude_ft, 1000.0);
        assert_eq!(sample.generator_temp_f, 180.0);
    }

    #[test]
    fn auto_current_codes_are_decoded() {
        let mut norm = normalizer();
        let state = norm.auto_current(AutoCurrentState::Unknown, Ok(json!(3)), 1);
        assert_eq!(state, AutoCurrentState::On);
        let state = norm.auto_current(state, Ok(json!(2)), 2);
        assert_eq!(state, AutoCurrentState::Off);
    }

    #[test]
    fn auto_current_keeps_state_on_bad_input() {
        let mut norm = normalizer();
        assert_eq!(
            norm.auto_current(AutoCurrentState::On, Ok(json!(7)), 1),
            AutoCurrentState::On
        );
        assert_eq!(
            norm.auto_current(AutoCurrentState::Off, Err(ReadingError::Unbound), 2),
            AutoCurrentState::Off
        );
        assert_eq!(
            norm.auto_current(AutoCurrentState::Unknown, Ok(json!("on")), 3),
            AutoCurrentState::Unknown
        );
    }

    #[test]
    fn transfer_switch_matches_configured_codes() {
        let mut norm = normalizer();
        assert!(norm.generator_running(false, Ok(json!(12)), 1));
        assert!(norm.generator_running(true, Ok(json!(3)), 2));
        assert!(!norm.generator_running(true, Ok(json!(2)), 3));
        assert!(!norm.generator_running(false, Ok(json!(12.5)), 4));
        assert!(!norm.generator_running(true, Err(ReadingError::Unbound), 5));
    }
}
