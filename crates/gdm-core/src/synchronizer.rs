//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Reconciliation of the generator and AC-input current limits."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Keeps the generator current limit setting and the inverter's AC-input
//! current limit in agreement, and applies the derated limit in auto mode.
//!
//! Set-points are rounded to 0.1 A as they are read. Each step reads before
//! it writes, compares with a fixed tolerance, and only advances the
//! `previous_*` trackers in [`LimitPair`] once the corresponding write has
//! been accepted.

use std::sync::Arc;

use gdm_bus::{EndpointHandle, ValueGateway};
use gdm_common::config::BusConfig;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::normalizer::{numeric, ReadingError};
use crate::state::{limits_differ, round_amps, AutoCurrentState, LimitPair};

/// Per-tick inputs gathered by the control loop.
#[derive(Debug, Clone, Copy)]
pub struct SyncInputs<'a> {
    pub tick: u64,
    pub generator_running: bool,
    pub auto_current: AutoCurrentState,
    pub inverter: Option<&'a EndpointHandle>,
    /// Unrounded derated output for this tick.
    pub derated_output_amps: f64,
}

/// What the synchronizer did during one tick.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    /// Generator limit copied to the AC-input limit.
    pub pushed_to_ac_input: Option<f64>,
    /// AC-input limit copied back to the generator limit.
    pub synced_from_ac_input: Option<f64>,
    /// Derated limit written to the generator limit.
    pub derated_limit_written: Option<f64>,
    /// The inverter service disappeared while talking to it.
    pub inverter_gone: bool,
}

impl SyncReport {
    /// Number of writes accepted by the bus.
    pub fn writes(&self) -> usize {
        [
            self.pushed_to_ac_input,
            self.synced_from_ac_input,
            self.derated_limit_written,
        ]
        .iter()
        .filter(|write| write.is_some())
        .count()
    }
}

pub struct LimitSynchronizer {
    gateway: Arc<dyn ValueGateway>,
    settings: EndpointHandle,
    generator_limit_path: String,
    ac_input_limit_path: String,
}

impl std::fmt::Debug for LimitSynchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LimitSynchronizer")
            .field("settings", &self.settings)
            .field("generator_limit_path", &self.generator_limit_path)
            .field("ac_input_limit_path", &self.ac_input_limit_path)
            .finish_non_exhaustive()
    }
}

impl LimitSynchronizer {
    pub fn new(gateway: Arc<dyn ValueGateway>, bus: &BusConfig) -> Self {
        Self {
            gateway,
            settings: EndpointHandle::new(bus.settings_service.as_str()),
            generator_limit_path: bus.generator_limit_path.clone(),
            ac_input_limit_path: bus.ac_input_limit_path.clone(),
        }
    }

    /// Record whatever limits are readable as the starting point so the
    /// first tick does not write spuriously. Returns `true` when the
    /// inverter service turned out to be gone.
    pub async fn seed(&self, limits: &mut LimitPair, inverter: Option<&EndpointHandle>) -> bool {
        match self.read_generator_limit().await {
            Ok(generator) => {
                limits.generator_limit = Some(generator);
                limits.previous_generator_limit = Some(generator);
            }
            Err(err) => debug!(error = %err, "generator limit not readable at startup"),
        }

        let Some(inverter) = inverter else {
            return false;
        };
        match self.read_ac_input_limit(inverter).await {
            Ok(ac) => {
                limits.ac_input_limit = Some(ac);
                limits.previous_ac_input_limit = Some(ac);
                info!(
                    generator_limit = ?limits.generator_limit,
                    ac_input_limit = ac,
                    "current limits seeded"
                );
                false
            }
            Err(err) => {
                debug!(inverter = %inverter, error = %err, "AC-input limit not readable at startup");
                is_service_gone(&err)
            }
        }
    }

    /// Run the three synchronization steps for one tick.
    pub async fn run(&self, limits: &mut LimitPair, inputs: &SyncInputs<'_>) -> SyncReport {
        let mut report = SyncReport::default();

        if inputs.generator_running {
            if let Some(inverter) = inputs.inverter {
                self.push_generator_to_ac(limits, inverter, inputs.tick, &mut report)
                    .await;
                if inputs.auto_current == AutoCurrentState::Off && !report.inverter_gone {
                    self.pull_ac_to_generator(limits, inverter, inputs.tick, &mut report)
                        .await;
                }
            } else {
                debug!(tick = inputs.tick, "inverter not resolved; limit sync skipped");
            }
        }

        if inputs.auto_current == AutoCurrentState::On {
            self.apply_derating(limits, inputs, &mut report).await;
        }

        report
    }

    /// Copy a changed generator limit setting to the AC-input limit.
    async fn push_generator_to_ac(
        &self,
        limits: &mut LimitPair,
        inverter: &EndpointHandle,
        tick: u64,
        report: &mut SyncReport,
    ) {
        let generator = match self.read_generator_limit().await {
            Ok(value) => value,
            Err(err) => {
                warn!(tick, error = %err, "unable to read generator limit");
                return;
            }
        };
        limits.generator_limit = Some(generator);

        let changed = match (
            limits.previous_generator_limit,
            limits.previous_ac_input_limit,
        ) {
            (Some(previous), Some(_)) => limits_differ(generator, previous),
            _ => true,
        };
        if !changed {
            return;
        }

        match self
            .gateway
            .write(inverter, &self.ac_input_limit_path, Value::from(generator))
            .await
        {
            Ok(()) => {
                info!(
                    tick,
                    previous = ?limits.previous_generator_limit,
                    limit = generator,
                    "generator limit copied to AC-input limit"
                );
                limits.ac_input_limit = Some(generator);
                limits.previous_generator_limit = Some(generator);
                limits.previous_ac_input_limit = Some(generator);
                report.pushed_to_ac_input = Some(generator);
            }
            Err(err) => {
                report.inverter_gone |= err.is_service_gone();
                warn!(tick, inverter = %inverter, error = %err, "unable to write AC-input limit");
            }
        }
    }

    /// Copy a changed AC-input limit back to the generator limit setting.
    async fn pull_ac_to_generator(
        &self,
        limits: &mut LimitPair,
        inverter: &EndpointHandle,
        tick: u64,
        report: &mut SyncReport,
    ) {
        let ac = match self.read_ac_input_limit(inverter).await {
            Ok(value) => value,
            Err(err) => {
                report.inverter_gone |= is_service_gone(&err);
                warn!(tick, inverter = %inverter, error = %err, "unable to read AC-input limit");
                return;
            }
        };
        limits.ac_input_limit = Some(ac);

        let moved = limits
            .previous_ac_input_limit
            .map_or(true, |previous| limits_differ(ac, previous));
        if !moved {
            return;
        }

        let generator = match self.read_generator_limit().await {
            Ok(value) => {
                limits.generator_limit = Some(value);
                Some(value)
            }
            Err(err) => {
                debug!(tick, error = %err, "generator limit unreadable; treating as unset");
                None
            }
        };
        if !generator.map_or(true, |current| limits_differ(ac, current)) {
            limits.previous_ac_input_limit = Some(ac);
            return;
        }

        match self
            .gateway
            .write(&self.settings, &self.generator_limit_path, Value::from(ac))
            .await
        {
            Ok(()) => {
                info!(
                    tick,
                    previous = ?generator,
                    limit = ac,
                    "AC-input limit copied to generator limit"
                );
                limits.generator_limit = Some(ac);
                limits.previous_generator_limit = Some(ac);
                limits.previous_ac_input_limit = Some(ac);
                report.synced_from_ac_input = Some(ac);
            }
            Err(err) => {
                warn!(tick, error = %err, "unable to write generator limit");
            }
        }
    }

    /// Write the rounded derated output to the generator limit setting.
    ///
    /// `previous_generator_limit` is left alone so that the next tick
    /// propagates the new setting to the AC-input limit.
    async fn apply_derating(
        &self,
        limits: &mut LimitPair,
        inputs: &SyncInputs<'_>,
        report: &mut SyncReport,
    ) {
        let tick = inputs.tick;
        let target = round_amps(inputs.derated_output_amps);
        let current = match self.read_generator_limit().await {
            Ok(value) => {
                limits.generator_limit = Some(value);
                Some(value)
            }
            Err(err) => {
                debug!(tick, error = %err, "generator limit unreadable before derating");
                None
            }
        };

        if limits.derating_applied {
            if let Some(current) = current {
                if !limits_differ(current, target) {
                    debug!(tick, limit = target, "derated limit already in place");
                    return;
                }
            }
        }

        match self
            .gateway
            .write(&self.settings, &self.generator_limit_path, Value::from(target))
            .await
        {
            Ok(()) => {
                info!(
                    tick,
                    previous = ?current,
                    limit = target,
                    generator_running = inputs.generator_running,
                    "derated generator limit applied"
                );
                limits.generator_limit = Some(target);
                limits.derating_applied = true;
                report.derated_limit_written = Some(target);
            }
            Err(err) => {
                warn!(tick, limit = target, error = %err, "unable to write derated generator limit");
            }
        }
    }

    async fn read_generator_limit(&self) -> Result<f64, ReadingError> {
        let value = self
            .gateway
            .read(&self.settings, &self.generator_limit_path)
            .await?;
        numeric(&value).map(round_amps)
    }

    async fn read_ac_input_limit(&self, inverter: &EndpointHandle) -> Result<f64, ReadingError> {
        let value = self
            .gateway
            .read(inverter, &self.ac_input_limit_path)
            .await?;
        numeric(&value).map(round_amps)
    }
}

fn is_service_gone(err: &ReadingError) -> bool {
    matches!(err, ReadingError::Bus(bus) if bus.is_service_gone())
}
