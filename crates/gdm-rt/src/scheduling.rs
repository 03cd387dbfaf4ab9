//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Runtime helpers supporting the control loop."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

/// Fixed-delay scheduler: the next tick starts `period` after the previous
/// one finished, so a slow tick pushes the schedule back instead of
/// overlapping or bursting to catch up.
#[derive(Debug)]
pub struct FixedDelay {
    period: Duration,
    last_completed: Option<Instant>,
}

impl FixedDelay {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            last_completed: None,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Wait until `period` has passed since the last completed tick, or a
    /// full period when nothing has completed yet.
    pub async fn wait(&self) {
        let due = match self.last_completed {
            Some(completed) => completed + self.period,
            None => Instant::now() + self.period,
        };
        tokio::time::sleep_until(due).await;
        trace!(period_ms = self.period.as_millis() as u64, "tick due");
    }

    /// Mark the current tick as finished.
    pub fn complete(&mut self) -> Duration {
        let now = Instant::now();
        let busy = self
            .last_completed
            .map(|previous| now.duration_since(previous).saturating_sub(self.period))
            .unwrap_or_default();
        self.last_completed = Some(now);
        busy
    }
}
