//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Structured logging adapters and sinks."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Logging helpers shared by the control loop: a tick/role context carried by
//! the convenience macros, and [`LogLatch`] which keeps a persistently broken
//! sensor from flooding the log.

use tracing::Level;
use tracing_subscriber::{fmt as subscriber_fmt, prelude::*, EnvFilter, Registry};

pub mod macros;

/// Initialize a baseline tracing subscriber suitable for tests and tooling.
pub fn init() {
    let _ = Registry::default()
        .with(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with(subscriber_fmt::layer())
        .try_init();
}

/// Structured logging context propagated by the convenience macros.
#[derive(Debug, Default, Clone)]
pub struct LogContext<'a> {
    /// Control loop tick the event belongs to.
    pub tick: Option<u64>,
    /// Logical bus role the event concerns.
    pub role: Option<&'a str>,
}

impl<'a> LogContext<'a> {
    /// Create an empty logging context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a tick value.
    pub fn with_tick(mut self, tick: u64) -> Self {
        self.tick = Some(tick);
        self
    }

    /// Attach a role name.
    pub fn with_role(mut self, role: &'a str) -> Self {
        self.role = Some(role);
        self
    }
}

/// What a [`LogLatch`] says about a successful observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatchReport {
    /// First success ever recorded.
    First,
    /// First success after a failure streak.
    Recovered,
    /// Nothing noteworthy.
    Steady,
}

/// Once-per-streak reporting state for a single signal.
///
/// The latch only decides *whether* something is worth logging; callers keep
/// full control over levels and messages.
#[derive(Debug, Default, Clone)]
pub struct LogLatch {
    seen_success: bool,
    failing: bool,
}

impl LogLatch {
    /// Create a latch that has seen nothing yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful observation.
    pub fn success(&mut self) -> LatchReport {
        let report = if !self.seen_success {
            LatchReport::First
        } else if self.failing {
            LatchReport::Recovered
        } else {
            LatchReport::Steady
        };
        self.seen_success = true;
        self.failing = false;
        report
    }

    /// Record a failure. Returns `true` only for the first failure of a streak.
    pub fn failure(&mut self) -> bool {
        let first = !self.failing;
        self.failing = true;
        first
    }
}
