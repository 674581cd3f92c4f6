//! Adapter lifecycle state machine and health bookkeeping.
//!
//! Shared by every adapter so the transitions are identical across
//! platforms: `Uninitialized -> Initializing -> Healthy <-> Degraded/Unhealthy
//! -> ShuttingDown -> Shutdown`, with a failed initialize falling back to
//! `Uninitialized`.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};

use crate::traits::{AdapterHealth, AdapterState, ChannelError, HealthStatus};

/// Consecutive send failures before a healthy adapter reports degraded.
pub const DEGRADED_AFTER_FAILURES: u32 = 3;

/// Lifecycle state plus the outbound failure streak.
#[derive(Debug)]
pub struct Lifecycle {
    channel_id: String,
    state: Mutex<AdapterState>,
    failure_streak: AtomicU32,
}

impl Lifecycle {
    /// New lifecycle in `Uninitialized`.
    #[must_use]
    pub fn new(channel_id: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            state: Mutex::new(AdapterState::Uninitialized),
            failure_streak: AtomicU32::new(0),
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> AdapterState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, to: AdapterState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != to {
            tracing::info!(channel = %self.channel_id, from = ?*state, to = ?to, "Adapter state change");
            *state = to;
        }
    }

    /// Enter `Initializing`.
    ///
    /// # Errors
    ///
    /// Returns `ChannelError::Lifecycle` unless the adapter is uninitialized.
    pub fn begin_init(&self) -> Result<(), ChannelError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != AdapterState::Uninitialized {
            return Err(ChannelError::Lifecycle(format!(
                "{} cannot initialize from {:?}",
                self.channel_id, *state
            )));
        }
        *state = AdapterState::Initializing;
        drop(state);
        tracing::info!(channel = %self.channel_id, "Adapter initializing");
        Ok(())
    }

    /// Leave `Initializing`: `Healthy` on success, `Uninitialized` on failure.
    pub fn finish_init<T>(&self, result: &Result<T, ChannelError>) {
        match result {
            Ok(_) => {
                self.failure_streak.store(0, Ordering::Relaxed);
                self.transition(AdapterState::Healthy);
            }
            Err(e) => {
                tracing::warn!(channel = %self.channel_id, error = %e, "Adapter initialization failed");
                self.transition(AdapterState::Uninitialized);
            }
        }
    }

    /// Fail unless the adapter is running.
    ///
    /// # Errors
    ///
    /// Returns `ChannelError::Lifecycle` outside `Healthy`/`Degraded`/`Unhealthy`.
    pub fn ensure_running(&self) -> Result<(), ChannelError> {
        let state = self.state();
        if state.is_running() {
            Ok(())
        } else {
            Err(ChannelError::Lifecycle(format!(
                "{} is not running ({state:?})",
                self.channel_id
            )))
        }
    }

    /// Record the outcome of an outbound call.
    pub fn record_send(&self, success: bool) {
        if success {
            let previous = self.failure_streak.swap(0, Ordering::Relaxed);
            if previous >= DEGRADED_AFTER_FAILURES && self.state() == AdapterState::Degraded {
                self.transition(AdapterState::Healthy);
            }
        } else {
            let streak = self.failure_streak.fetch_add(1, Ordering::Relaxed) + 1;
            if streak >= DEGRADED_AFTER_FAILURES && self.state() == AdapterState::Healthy {
                self.transition(AdapterState::Degraded);
            }
        }
    }

    /// Current consecutive send failures.
    #[must_use]
    pub fn failure_streak(&self) -> u32 {
        self.failure_streak.load(Ordering::Relaxed)
    }

    /// Combine a live health check with the failure streak into a health report,
    /// moving a running adapter between `Healthy`, `Degraded` and `Unhealthy`.
    pub fn health_from_check(
        &self,
        check: Result<serde_json::Map<String, serde_json::Value>, ChannelError>,
    ) -> AdapterHealth {
        let state = self.state();
        if !state.is_running() {
            return AdapterHealth::new(HealthStatus::Unhealthy)
                .with_detail("state", format!("{state:?}"));
        }

        let streak = self.failure_streak();
        let mut health = match check {
            Ok(details) => {
                let status = if streak >= DEGRADED_AFTER_FAILURES {
                    HealthStatus::Degraded
                } else {
                    HealthStatus::Healthy
                };
                let mut health = AdapterHealth::new(status);
                health.details = details;
                health
            }
            Err(e) => AdapterHealth::new(HealthStatus::Unhealthy).with_detail("error", e.to_string()),
        };
        health = health.with_detail("failureStreak", streak);

        let to = match health.status {
            HealthStatus::Healthy => AdapterState::Healthy,
            HealthStatus::Degraded => AdapterState::Degraded,
            HealthStatus::Unhealthy => AdapterState::Unhealthy,
        };
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.is_running() && *state != to {
            tracing::info!(channel = %self.channel_id, from = ?*state, to = ?to, "Adapter state change");
            *state = to;
        }
        health
    }

    /// Enter `ShuttingDown`. Returns false if already stopping or stopped.
    pub fn begin_shutdown(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match *state {
            AdapterState::ShuttingDown | AdapterState::Shutdown => false,
            _ => {
                *state = AdapterState::ShuttingDown;
                true
            }
        }
    }

    /// Enter `Shutdown`.
    pub fn finish_shutdown(&self) {
        self.transition(AdapterState::Shutdown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running() -> Lifecycle {
        let lifecycle = Lifecycle::new("test:t1");
        lifecycle.begin_init().unwrap();
        lifecycle.finish_init(&Ok::<(), ChannelError>(()));
        lifecycle
    }

    #[test]
    fn test_failed_init_returns_to_uninitialized() {
        let lifecycle = Lifecycle::new("test:t1");
        lifecycle.begin_init().unwrap();
        assert_eq!(lifecycle.state(), AdapterState::Initializing);
        assert!(lifecycle.begin_init().is_err());

        lifecycle.finish_init(&Err::<(), _>(ChannelError::RateLimited));
        assert_eq!(lifecycle.state(), AdapterState::Uninitialized);
        assert!(lifecycle.ensure_running().is_err());
    }

    #[test]
    fn test_send_failures_degrade() {
        let lifecycle = running();
        lifecycle.record_send(false);
        lifecycle.record_send(false);
        assert_eq!(lifecycle.state(), AdapterState::Healthy);
        lifecycle.record_send(false);
        assert_eq!(lifecycle.state(), AdapterState::Degraded);
        assert!(lifecycle.ensure_running().is_ok());

        lifecycle.record_send(true);
        assert_eq!(lifecycle.state(), AdapterState::Healthy);
        assert_eq!(lifecycle.failure_streak(), 0);
    }

    #[test]
    fn test_health_check_drives_state() {
        let lifecycle = running();
        let health = lifecycle.health_from_check(Err(ChannelError::network("down")));
        assert_eq!(health.status, HealthStatus::Unhealthy);
        assert_eq!(lifecycle.state(), AdapterState::Unhealthy);

        let health = lifecycle.health_from_check(Ok(serde_json::Map::new()));
        assert_eq!(health.status, HealthStatus::Healthy);
        assert_eq!(lifecycle.state(), AdapterState::Healthy);
    }

    #[test]
    fn test_shutdown_is_terminal() {
        let lifecycle = running();
        assert!(lifecycle.begin_shutdown());
        assert!(!lifecycle.begin_shutdown());
        lifecycle.finish_shutdown();
        assert_eq!(lifecycle.state(), AdapterState::Shutdown);
        assert!(lifecycle.begin_init().is_err());
        let health = lifecycle.health_from_check(Ok(serde_json::Map::new()));
        assert_eq!(health.status, HealthStatus::Unhealthy);
    }
}
