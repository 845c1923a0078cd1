//! Request pacing for the provider API
//!
//! The provider counts every endpoint against one account-level quota, so a
//! single [`Pacer`] is shared (as `Arc<Pacer>`) by every API call the
//! process makes, token refreshes included.
//!
//! ## Algorithm
//!
//! Exponential-decay pacing: each granted call pushes the next permitted
//! call `sleep` into the future. Successes shrink `sleep` toward
//! `min_sleep`, retries grow it toward `max_sleep`. The throttle code blocks
//! every caller for a fixed cooldown instead of letting them retry in a
//! tight loop.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use pandrive_api::pacer::{Pacer, PacerSettings};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), pandrive_api::ApiError> {
//! let pacer = Pacer::new(PacerSettings::default());
//! pacer.acquire(&CancellationToken::new()).await?;
//! // ... make API call ...
//! pacer.on_success();
//! # Ok(())
//! # }
//! ```

use std::{sync::Mutex, time::Duration};

use pandrive_core::config::PacerConfig;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::ApiError;

// ============================================================================
// Settings
// ============================================================================

/// Pacer tuning, in concrete durations
#[derive(Debug, Clone)]
pub struct PacerSettings {
    pub min_sleep: Duration,
    pub max_sleep: Duration,
    /// Successes shrink the delay by a factor of `(2^decay - 1) / 2^decay`
    pub decay_constant: u32,
    /// Retries grow the delay by a factor of `2^attack / (2^attack - 1)`
    pub attack_constant: u32,
    pub throttle_cooldown: Duration,
}

impl Default for PacerSettings {
    fn default() -> Self {
        Self::from(&PacerConfig::default())
    }
}

impl From<&PacerConfig> for PacerSettings {
    fn from(config: &PacerConfig) -> Self {
        Self {
            min_sleep: Duration::from_millis(config.min_sleep_ms),
            max_sleep: Duration::from_millis(config.max_sleep_ms),
            decay_constant: config.decay_constant,
            attack_constant: config.attack_constant,
            throttle_cooldown: Duration::from_millis(config.throttle_cooldown_ms),
        }
    }
}

// ============================================================================
// Pacer
// ============================================================================

#[derive(Debug)]
struct PacerState {
    sleep: Duration,
    next_call: Instant,
    blocked_until: Option<Instant>,
}

impl PacerState {
    fn ready_at(&self) -> Instant {
        match self.blocked_until {
            Some(blocked) if blocked > self.next_call => blocked,
            _ => self.next_call,
        }
    }
}

/// Process-wide, globally serialized call gate
///
/// `gate` is held across the wait so that permission to call is handed out
/// one caller at a time. Feedback (`on_success`, `on_throttle`, ...) only
/// touches `state`, so a throttle signal lands even while another caller is
/// parked in [`Pacer::acquire`].
#[derive(Debug)]
pub struct Pacer {
    settings: PacerSettings,
    gate: tokio::sync::Mutex<()>,
    state: Mutex<PacerState>,
}

impl Pacer {
    pub fn new(settings: PacerSettings) -> Self {
        let state = PacerState {
            sleep: settings.min_sleep,
            next_call: Instant::now(),
            blocked_until: None,
        };
        Self {
            settings,
            gate: tokio::sync::Mutex::new(()),
            state: Mutex::new(state),
        }
    }

    pub fn settings(&self) -> &PacerSettings {
        &self.settings
    }

    /// Waits for permission to issue one call.
    ///
    /// The deadline is re-read after every wake-up, so a cooldown imposed
    /// while this caller sleeps extends its wait.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<(), ApiError> {
        let _gate = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ApiError::Cancelled),
            guard = self.gate.lock() => guard,
        };

        loop {
            let ready_at = self.state.lock().unwrap().ready_at();
            let now = Instant::now();
            if ready_at <= now {
                break;
            }
            debug!(wait_ms = (ready_at - now).as_millis() as u64, "Pacer waiting");
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ApiError::Cancelled),
                _ = tokio::time::sleep_until(ready_at) => {}
            }
        }

        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        state.next_call = now + state.sleep;
        if state.blocked_until.is_some_and(|b| b <= now) {
            state.blocked_until = None;
        }
        Ok(())
    }

    /// Decays the delay toward `min_sleep`.
    pub fn on_success(&self) {
        let mut state = self.state.lock().unwrap();
        state.sleep = self.decayed(state.sleep);
    }

    /// Grows the delay toward `max_sleep`.
    pub fn on_retry(&self) {
        let mut state = self.state.lock().unwrap();
        state.sleep = self.attacked(state.sleep);
    }

    /// Grows the delay and blocks every caller for the throttle cooldown.
    pub fn on_throttle(&self) {
        let cooldown = self.settings.throttle_cooldown;
        warn!(
            cooldown_ms = cooldown.as_millis() as u64,
            "Provider throttle code received, pausing all API calls"
        );
        let mut state = self.state.lock().unwrap();
        state.sleep = self.attacked(state.sleep);
        Self::block_for(&mut state, cooldown);
    }

    /// Blocks every caller for at least `wait` (e.g. from `Retry-After`).
    pub fn defer(&self, wait: Duration) {
        debug!(wait_ms = wait.as_millis() as u64, "Pacer deferred");
        let mut state = self.state.lock().unwrap();
        state.sleep = self.attacked(state.sleep);
        Self::block_for(&mut state, wait);
    }

    /// Current inter-call delay.
    pub fn current_sleep(&self) -> Duration {
        self.state.lock().unwrap().sleep
    }

    /// Remaining cooldown, if one is active.
    pub fn blocked_for(&self) -> Option<Duration> {
        let state = self.state.lock().unwrap();
        let now = Instant::now();
        state.blocked_until.filter(|b| *b > now).map(|b| b - now)
    }

    fn block_for(state: &mut PacerState, wait: Duration) {
        let until = Instant::now() + wait;
        state.blocked_until = Some(match state.blocked_until {
            Some(existing) if existing > until => existing,
            _ => until,
        });
    }

    fn decayed(&self, sleep: Duration) -> Duration {
        let pow = 1u32 << self.settings.decay_constant.min(16);
        let next = sleep * (pow - 1) / pow;
        next.max(self.settings.min_sleep)
    }

    fn attacked(&self, sleep: Duration) -> Duration {
        if self.settings.attack_constant == 0 {
            return self.settings.max_sleep;
        }
        let pow = 1u32 << self.settings.attack_constant.min(16);
        let base = sleep.max(self.settings.min_sleep).max(Duration::from_millis(1));
        let next = base * pow / (pow - 1);
        next.min(self.settings.max_sleep)
    }
}

// ============================================================================
// Retry-After header parsing
// ============================================================================

/// Parses a Retry-After header value into a Duration.
///
/// Accepts integer seconds or an HTTP-date; falls back to `default`.
pub fn parse_retry_after(value: &str, default: Duration) -> Duration {
    if let Ok(seconds) = value.trim().parse::<u64>() {
        return Duration::from_secs(seconds);
    }

    if let Ok(date) = chrono::DateTime::parse_from_rfc2822(value.trim()) {
        let now = chrono::Utc::now();
        let target = date.with_timezone(&chrono::Utc);
        if target > now {
            if let Some(secs) = (target - now)
                .num_seconds()
                .try_into()
                .ok()
                .filter(|&s: &u64| s <= 3600)
            {
                return Duration::from_secs(secs);
            }
        }
    }

    warn!(value, "Could not parse Retry-After header, using default");
    default
}
