//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Primary control loop and lifecycle management."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;

use gdm_bus::{EndpointDirectory, Role, ValueGateway};
use gdm_common::config::{AppConfig, BusConfig, ControlConfig};
use gdm_logging::{gdm_debug, gdm_info, gdm_warn, LatchReport, LogContext, LogLatch};
use gdm_rt::FixedDelay;
use indexmap::IndexMap;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::derating::DeratingCalculator;
use crate::normalizer::{RawEnvironment, Reading, ReadingError, SensorNormalizer};
use crate::state::{AutoCurrentState, ControllerState, EndpointBindings, EnvironmentalSample};
use crate::synchronizer::{LimitSynchronizer, SyncInputs, SyncReport};

/// Summary of one control loop tick.
#[derive(Debug, Clone, PartialEq)]
pub struct TickReport {
    pub tick: u64,
    pub generator_running: bool,
    pub auto_current: AutoCurrentState,
    pub sample: EnvironmentalSample,
    /// Unrounded derated output computed from `sample`.
    pub derated_output_amps: f64,
    pub sync: SyncReport,
    /// Roles that were bound during this tick's discovery pass.
    pub newly_bound: Vec<Role>,
}

/// Discovery, sensor refresh and limit synchronization, driven one tick at
/// a time. All controller state lives here.
pub struct ControlLoop {
    control: ControlConfig,
    bus: BusConfig,
    directory: Arc<dyn EndpointDirectory>,
    gateway: Arc<dyn ValueGateway>,
    normalizer: SensorNormalizer,
    calculator: DeratingCalculator,
    synchronizer: LimitSynchronizer,
    discovery: IndexMap<Role, LogLatch>,
    state: ControllerState,
}

impl std::fmt::Debug for ControlLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlLoop")
            .field("control", &self.control)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl ControlLoop {
    pub fn new(
        config: &AppConfig,
        directory: Arc<dyn EndpointDirectory>,
        gateway: Arc<dyn ValueGateway>,
    ) -> Self {
        Self {
            control: config.control.clone(),
            bus: config.bus.clone(),
            directory,
            normalizer: SensorNormalizer::new(&config.bus),
            calculator: DeratingCalculator::new(config.derating.clone()),
            synchronizer: LimitSynchronizer::new(gateway.clone(), &config.bus),
            gateway,
            discovery: Role::ALL
                .into_iter()
                .map(|role| (role, LogLatch::new()))
                .collect(),
            state: ControllerState::new(&config.defaults),
        }
    }

    pub fn state(&self) -> &ControllerState {
        &self.state
    }

    /// One discovery attempt for every role, then seed the sample, the
    /// digital inputs and the limit trackers from whatever is readable.
    pub async fn startup(&mut self) -> Vec<Role> {
        let bound = self.discover(&Role::ALL).await;
        self.refresh_inputs().await;

        let inverter = self.state.bindings.get(Role::Inverter).cloned();
        if self
            .synchronizer
            .seed(&mut self.state.limits, inverter.as_ref())
            .await
        {
            self.unbind(Role::Inverter);
        }

        info!(
            bound = bound.len(),
            unresolved = ?self.state.bindings.unresolved(),
            outdoor_temp_f = self.state.sample.outdoor_temp_f,
            altitude_ft = self.state.sample.altitude_ft,
            generator_temp_f = self.state.sample.generator_temp_f,
            auto_current = ?self.state.auto_current,
            generator_running = self.state.generator_running,
            "controller started"
        );
        bound
    }

    /// Run a single tick. Never fails; problems are logged and the affected
    /// step is skipped.
    pub async fn tick(&mut self) -> TickReport {
        self.state.tick += 1;
        let tick = self.state.tick;

        let unresolved = self.state.bindings.unresolved();
        let newly_bound = if unresolved.is_empty() {
            Vec::new()
        } else {
            self.discover(&unresolved).await
        };

        self.refresh_inputs().await;

        let derated_output_amps = self.calculator.for_sample(&self.state.sample);
        let breakdown = self.calculator.breakdown(
            self.state.sample.outdoor_temp_f,
            self.state.sample.altitude_ft,
            self.state.sample.generator_temp_f,
        );
        debug!(
            tick,
            temperature = breakdown.temperature,
            altitude = breakdown.altitude,
            generator_temperature = breakdown.generator_temperature,
            buffer = breakdown.buffer,
            output_amps = derated_output_amps,
            "derating evaluated"
        );

        let inverter = self.state.bindings.get(Role::Inverter).cloned();
        let inputs = SyncInputs {
            tick,
            generator_running: self.state.generator_running,
            auto_current: self.state.auto_current,
            inverter: inverter.as_ref(),
            derated_output_amps,
        };
        let sync = self.synchronizer.run(&mut self.state.limits, &inputs).await;
        if sync.inverter_gone {
            self.unbind(Role::Inverter);
        }

        let report = TickReport {
            tick,
            generator_running: self.state.generator_running,
            auto_current: self.state.auto_current,
            sample: self.state.sample,
            derated_output_amps,
            sync,
            newly_bound,
        };
        debug!(
            tick,
            generator_running = report.generator_running,
            auto_current = ?report.auto_current,
            writes = report.sync.writes(),
            generator_limit = ?self.state.limits.generator_limit,
            ac_input_limit = ?self.state.limits.ac_input_limit,
            "tick complete"
        );
        report
    }

    /// Delayed startup, then fixed-delay ticks until `shutdown` fires.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        tokio::select! {
            _ = shutdown.recv() => {
                debug!("shutdown requested before startup");
                return;
            }
            _ = tokio::time::sleep(self.control.startup_delay) => {}
        }
        self.startup().await;

        let mut schedule = FixedDelay::new(self.control.poll_interval);
        loop {
            let due = tokio::select! {
                _ = shutdown.recv() => false,
                _ = schedule.wait() => true,
            };
            if !due {
                break;
            }
            self.tick().await;
            let overrun = schedule.complete();
            if overrun > schedule.period() {
                warn!(
                    overrun_ms = overrun.as_millis() as u64,
                    "tick took longer than the poll interval"
                );
            }
        }
        info!(ticks = self.state.tick, "control loop stopped");
    }

    async fn discover(&mut self, roles: &[Role]) -> Vec<Role> {
        let mut bound = Vec::new();
        for &role in roles {
            let ctx = LogContext::new()
                .with_tick(self.state.tick)
                .with_role(role.name());
            let latch = self.discovery.entry(role).or_default();
            match self.directory.resolve(role).await {
                Some(endpoint) => {
                    match latch.success() {
                        LatchReport::First => {
                            gdm_info!(context = ctx, "found {}: {}", role.label(), endpoint)
                        }
                        _ => gdm_info!(context = ctx, "{} is back: {}", role.label(), endpoint),
                    }
                    self.state.bindings.bind(role, endpoint);
                    bound.push(role);
                }
                None => {
                    if latch.failure() {
                        gdm_warn!(context = ctx, "{} not found; will retry", role.label());
                    } else {
                        gdm_debug!(context = ctx, "{} still not found", role.label());
                    }
                }
            }
        }
        bound
    }

    async fn refresh_inputs(&mut self) {
        let tick = self.state.tick;
        let gateway = self.gateway.as_ref();
        let bindings = &mut self.state.bindings;
        let bus = &self.bus;

        let raw = RawEnvironment {
            outdoor_temp_c: read_role(
                gateway,
                bindings,
                Role::OutdoorTemperature,
                &bus.temperature_path,
            )
            .await,
            altitude_m: read_role(gateway, bindings, Role::Gps, &bus.altitude_path).await,
            generator_temp_c: read_role(
                gateway,
                bindings,
                Role::GeneratorTemperature,
                &bus.temperature_path,
            )
            .await,
        };
        self.normalizer.apply(&mut self.state.sample, raw, tick);

        let switch = read_role(gateway, bindings, Role::TransferSwitch, &bus.state_path).await;
        self.state.generator_running =
            self.normalizer
                .generator_running(self.state.generator_running, switch, tick);

        let auto = read_role(gateway, bindings, Role::AutoCurrent, &bus.state_path).await;
        self.state.auto_current = self
            .normalizer
            .auto_current(self.state.auto_current, auto, tick);
    }

    fn unbind(&mut self, role: Role) {
        if let Some(endpoint) = self.state.bindings.unbind(role) {
            warn!(%role, endpoint = %endpoint, "endpoint vanished; will rediscover");
        }
    }
}

/// Read `path` from the endpoint bound to `role`. A service that has left
/// the bus unbinds the role.
async fn read_role(
    gateway: &dyn ValueGateway,
    bindings: &mut EndpointBindings,
    role: Role,
    path: &str,
) -> Reading {
    let Some(endpoint) = bindings.get(role).cloned() else {
        return Err(ReadingError::Unbound);
    };
    match gateway.read(&endpoint, path).await {
        Ok(value) => Ok(value),
        Err(err) => {
            if err.is_service_gone() {
                bindings.unbind(role);
                warn!(%role, endpoint = %endpoint, "endpoint vanished; will rediscover");
            }
            Err(err.into())
        }
    }
}

/// Owns the spawned control loop task.
#[derive(Debug)]
pub struct ControlLoopHandle {
    shutdown: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl ControlLoopHandle {
    pub fn spawn(control: ControlLoop) -> Self {
        let (shutdown, receiver) = broadcast::channel(1);
        let task = tokio::spawn(control.run(receiver));
        Self { shutdown, task }
    }

    /// Signal the loop to stop and wait for it. An in-flight tick finishes
    /// first.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        if let Err(err) = self.task.await {
            error!(error = %err, "control loop task join error");
        }
    }
}

