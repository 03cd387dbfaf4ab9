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
use std::time::Duration;

use async_trait::async_trait;
use gdm_bus::{BusDirectory, EndpointDirectory, EndpointHandle, InMemoryBus, Role};
use gdm_common::config::{AppConfig, DiscoveryConfig};
use gdm_core::{AutoCurrentState, ControlLoop, ControlLoopHandle};
use parking_lot::Mutex;
use serde_json::{json, Value};

const SETTINGS: &str = "com.victronenergy.settings";
const GEN_LIMIT: &str = "/Settings/TransferSwitch/GeneratorCurrentLimit";
const VEBUS: &str = "com.victronenergy.vebus.ttyS4";
const AC_LIMIT: &str = "/Ac/ActiveIn/CurrentLimit";
const OUTDOOR: &str = "com.victronenergy.temperature.adc_1";
const GEN_TEMP: &str = "com.victronenergy.temperature.adc_2";
const GPS: &str = "com.victronenergy.gps.ve_ttyUSB0";
const TRANSFER: &str = "com.victronenergy.digitalinput.input_1";
const AUTO: &str = "com.victronenergy.digitalinput.input_2";

const AUTO_ON: i64 = 3;
const AUTO_OFF: i64 = 2;

fn add_outdoor(bus: &InMemoryBus, celsius: f64) {
    bus.add_service(
        OUTDOOR,
        [("/CustomName", json!("Outdoor")), ("/Temperature", json!(celsius))],
    );
}

fn add_inverter(bus: &InMemoryBus, ac: f64) {
    bus.add_service(VEBUS, [(AC_LIMIT, json!(ac))]);
}

fn add_gps(bus: &InMemoryBus) {
    bus.add_service(GPS, [("/Altitude", json!([0.0]))]);
}

/// A fully populated installation at reference conditions: 25 °C outside,
/// sea level, generator cool and running, both limits at 30 A.
fn installation(auto_state: i64) -> InMemoryBus {
    let bus = InMemoryBus::new();
    bus.add_service(SETTINGS, [(GEN_LIMIT, json!(30.0))]);
    add_inverter(&bus, 30.0);
    add_outdoor(&bus, 25.0);
    bus.add_service(
        GEN_TEMP,
        [("/CustomName", json!("Generator")), ("/Temperature", json!(80.0))],
    );
    add_gps(&bus);
    bus.add_service(
        TRANSFER,
        [("/ProductName", json!("Transfer Switch")), ("/State", json!(12))],
    );
    bus.add_service(
        AUTO,
        [("/ProductName", json!("Gen Auto Current")), ("/State", json!(auto_state))],
    );
    bus
}

fn control_loop(bus: &InMemoryBus) -> ControlLoop {
    let shared = Arc::new(bus.clone());
    let directory = Arc::new(BusDirectory::new(shared.clone(), DiscoveryConfig::default()));
    ControlLoop::new(&AppConfig::default(), directory, shared)
}

/// Directory wrapper that records which roles were looked up.
struct RecordingDirectory {
    inner: BusDirectory<InMemoryBus>,
    calls: Mutex<Vec<Role>>,
}

impl RecordingDirectory {
    fn take_calls(&self) -> Vec<Role> {
        std::mem::take(&mut *self.calls.lock())
    }
}

#[async_trait]
impl EndpointDirectory for RecordingDirectory {
    async fn resolve(&self, role: Role) -> Option<EndpointHandle> {
        self.calls.lock().push(role);
        self.inner.resolve(role).await
    }
}

#[tokio::test]
async fn startup_binds_everything_and_writes_nothing() {
    let bus = installation(AUTO_OFF);
    let mut control = control_loop(&bus);

    let bound = control.startup().await;
    assert_eq!(bound, Role::ALL.to_vec());
    assert!(control.state().bindings.unresolved().is_empty());
    assert!(control.state().generator_running);
    assert_eq!(control.state().auto_current, AutoCurrentState::Off);
    assert_eq!(control.state().limits.previous_generator_limit, Some(30.0));
    assert_eq!(control.state().limits.previous_ac_input_limit, Some(30.0));
    assert!(bus.writes().is_empty());
}

#[tokio::test]
async fn repeated_ticks_without_external_change_are_idempotent() {
    let bus = installation(AUTO_OFF);
    let mut control = control_loop(&bus);
    control.startup().await;

    bus.set(SETTINGS, GEN_LIMIT, json!(35.0));
    let first = control.tick().await;
    assert_eq!(first.sync.pushed_to_ac_input, Some(35.0));

    let second = control.tick().await;
    assert_eq!(second.sync.writes(), 0);
    assert_eq!(bus.writes().len(), 1);
    assert!(control.state().limits.is_settled());
}

#[tokio::test]
async fn missing_outdoor_sensor_falls_back_to_default() {
    let bus = installation(AUTO_ON);
    bus.remove_service(OUTDOOR);
    let mut control = control_loop(&bus);
    control.startup().await;

    for _ in 0..3 {
        let report = control.tick().await;
        assert_eq!(report.sample.outdoor_temp_f, 77.0);
        assert_eq!(report.derated_output_amps, 56.25);
        assert!(!control.state().bindings.is_bound(Role::OutdoorTemperature));
    }
    assert_eq!(bus.get(SETTINGS, GEN_LIMIT), Some(json!(56.2)));
}

#[tokio::test]
async fn hot_day_derates_the_generator_limit() {
    let bus = installation(AUTO_ON);
    // 97 °F outside.
    bus.set(OUTDOOR, "/Temperature", json!(36.11111111111111));
    let mut control = control_loop(&bus);
    control.startup().await;

    let report = control.tick().await;
    assert!((report.sample.outdoor_temp_f - 97.0).abs() < 1e-9);
    assert_eq!(report.sync.derated_limit_written, Some(48.9));

    let report = control.tick().await;
    assert_eq!(report.sync.pushed_to_ac_input, Some(48.9));
    assert_eq!(bus.get(VEBUS, AC_LIMIT), Some(json!(48.9)));
}

#[tokio::test]
async fn stopped_generator_blocks_both_sync_steps() {
    let bus = installation(AUTO_OFF);
    bus.set(TRANSFER, "/State", json!(2));
    let mut control = control_loop(&bus);
    control.startup().await;
    assert!(!control.state().generator_running);

    bus.set(SETTINGS, GEN_LIMIT, json!(35.0));
    bus.set(VEBUS, AC_LIMIT, json!(40.0));
    for _ in 0..3 {
        let report = control.tick().await;
        assert!(!report.generator_running);
        assert_eq!(report.sync.writes(), 0);
    }
    assert!(bus.writes().is_empty());
}

#[tokio::test]
async fn stopped_generator_still_receives_the_derated_limit() {
    let bus = installation(AUTO_ON);
    bus.set(TRANSFER, "/State", json!(0));
    let mut control = control_loop(&bus);
    control.startup().await;

    let report = control.tick().await;
    assert_eq!(report.sync.derated_limit_written, Some(56.2));
    assert_eq!(report.sync.pushed_to_ac_input, None);

    // Propagated once the generator comes online.
    bus.set(TRANSFER, "/State", json!(3));
    let report = control.tick().await;
    assert!(report.generator_running);
    assert_eq!(report.sync.pushed_to_ac_input, Some(56.2));
}

#[tokio::test]
async fn external_ac_writes_do_not_cause_oscillation_in_auto_mode() {
    let bus = installation(AUTO_ON);
    let mut control = control_loop(&bus);
    control.startup().await;

    for tick in 0..8 {
        bus.set(VEBUS, AC_LIMIT, json!(20.0 + tick as f64));
        control.tick().await;
    }

    assert_eq!(bus.writes_to(SETTINGS, GEN_LIMIT), vec![json!(56.2)]);
    assert_eq!(bus.writes_to(VEBUS, AC_LIMIT), vec![json!(56.2)]);
    assert_eq!(bus.get(SETTINGS, GEN_LIMIT), Some(json!(56.2)));
}

#[tokio::test]
async fn manual_ac_change_is_copied_to_generator_limit() {
    let bus = installation(AUTO_OFF);
    let mut control = control_loop(&bus);
    control.startup().await;

    bus.set(VEBUS, AC_LIMIT, json!(42.5));
    let report = control.tick().await;
    assert_eq!(report.sync.synced_from_ac_input, Some(42.5));
    assert_eq!(bus.get(SETTINGS, GEN_LIMIT), Some(json!(42.5)));

    let report = control.tick().await;
    assert_eq!(report.sync.writes(), 0);
}

#[tokio::test]
async fn rejected_write_is_retried_on_the_next_tick() {
    let bus = installation(AUTO_OFF);
    let mut control = control_loop(&bus);
    control.startup().await;

    bus.set(SETTINGS, GEN_LIMIT, json!(35.0));
    bus.fail_writes(VEBUS, AC_LIMIT, true);
    let report = control.tick().await;
    assert_eq!(report.sync.writes(), 0);
    assert_eq!(control.state().limits.previous_generator_limit, Some(30.0));

    bus.fail_writes(VEBUS, AC_LIMIT, false);
    let report = control.tick().await;
    assert_eq!(report.sync.pushed_to_ac_input, Some(35.0));
    assert_eq!(bus.writes_to(VEBUS, AC_LIMIT), vec![json!(35.0)]);
}

#[tokio::test]
async fn unreadable_sensor_keeps_last_good_value() {
    let bus = installation(AUTO_OFF);
    bus.set(OUTDOOR, "/Temperature", json!(30.0));
    let mut control = control_loop(&bus);
    control.startup().await;
    assert_eq!(control.state().sample.outdoor_temp_f, 86.0);

    bus.fail_reads(OUTDOOR, "/Temperature", true);
    let report = control.tick().await;
    assert_eq!(report.sample.outdoor_temp_f, 86.0);
    assert!(control.state().bindings.is_bound(Role::OutdoorTemperature));

    bus.fail_reads(OUTDOOR, "/Temperature", false);
    bus.set(OUTDOOR, "/Temperature", Value::String("not a number".into()));
    let report = control.tick().await;
    assert_eq!(report.sample.outdoor_temp_f, 86.0);
}

#[tokio::test]
async fn discovery_is_retried_only_for_unresolved_roles() {
    let bus = installation(AUTO_OFF);
    bus.remove_service(GPS);
    let shared = Arc::new(bus.clone());
    let directory = Arc::new(RecordingDirectory {
        inner: BusDirectory::new(shared.clone(), DiscoveryConfig::default()),
        calls: Mutex::new(Vec::new()),
    });
    let mut control = ControlLoop::new(&AppConfig::default(), directory.clone(), shared);

    control.startup().await;
    assert_eq!(directory.take_calls(), Role::ALL.to_vec());
    assert_eq!(control.state().bindings.unresolved(), vec![Role::Gps]);

    let report = control.tick().await;
    assert_eq!(directory.take_calls(), vec![Role::Gps]);
    assert!(report.newly_bound.is_empty());
    assert_eq!(report.sample.altitude_ft, 1000.0);

    add_gps(&bus);
    let report = control.tick().await;
    assert_eq!(directory.take_calls(), vec![Role::Gps]);
    assert_eq!(report.newly_bound, vec![Role::Gps]);
    assert_eq!(report.sample.altitude_ft, 0.0);

    control.tick().await;
    assert!(directory.take_calls().is_empty());
}

#[tokio::test]
async fn vanished_sensor_is_unbound_and_rediscovered() {
    let bus = installation(AUTO_OFF);
    let mut control = control_loop(&bus);
    control.startup().await;

    bus.remove_service(OUTDOOR);
    let report = control.tick().await;
    assert!(!control.state().bindings.is_bound(Role::OutdoorTemperature));
    assert_eq!(report.sample.outdoor_temp_f, 77.0);

    add_outdoor(&bus, 30.0);
    let report = control.tick().await;
    assert_eq!(report.newly_bound, vec![Role::OutdoorTemperature]);
    assert_eq!(report.sample.outdoor_temp_f, 86.0);
}

#[tokio::test]
async fn vanished_inverter_is_rebound_and_resynced() {
    let bus = installation(AUTO_OFF);
    let mut control = control_loop(&bus);
    control.startup().await;

    bus.remove_service(VEBUS);
    bus.set(SETTINGS, GEN_LIMIT, json!(35.0));
    let report = control.tick().await;
    assert!(report.sync.inverter_gone);
    assert!(!control.state().bindings.is_bound(Role::Inverter));

    add_inverter(&bus, 30.0);
    let report = control.tick().await;
    assert_eq!(report.newly_bound, vec![Role::Inverter]);
    assert_eq!(report.sync.pushed_to_ac_input, Some(35.0));
    assert_eq!(bus.get(VEBUS, AC_LIMIT), Some(json!(35.0)));
}

#[tokio::test(start_paused = true)]
async fn spawned_loop_ticks_until_shutdown() {
    let bus = installation(AUTO_ON);
    let handle = ControlLoopHandle::spawn(control_loop(&bus));

    // Startup after 5 s, first tick 5 s later.
    tokio::time::sleep(Duration::from_secs(4)).await;
    assert!(bus.writes().is_empty());
    tokio::time::sleep(Duration::from_secs(7)).await;
    assert_eq!(bus.get(SETTINGS, GEN_LIMIT), Some(json!(56.2)));

    handle.shutdown().await;
    bus.clear_writes();
    bus.set(SETTINGS, GEN_LIMIT, json!(30.0));
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(bus.writes().is_empty());
}

#[tokio::test(start_paused = true)]
async fn shutdown_before_startup_touches_nothing() {
    let bus = installation(AUTO_ON);
    let handle = ControlLoopHandle::spawn(control_loop(&bus));
    tokio::time::sleep(Duration::from_secs(1)).await;
    handle.shutdown().await;
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert!(bus.writes().is_empty());
}
