//! Waiting for writes to take effect.
//!
//! A write is only acknowledged on the wire; the device applies it some time
//! later and valves need even longer to follow. After a write the clients
//! re-read the device until
//!
//! 1. a *required* condition holds (the written value is reported back), and
//! 2. ideally a *settled* condition holds (valves agree with the targets).
//!
//! Never seeing the required condition fails the write with
//! [`Error::Convergence`]. Never seeing the settled condition does not: the
//! last snapshot is returned once the attempts are used up.

use crate::{
    model::{DeviceState, Thermostat},
    Error, Result,
};
use log::{debug, warn};
use std::{future::Future, time::Duration};

/// Number of attempts and the delay before each of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl PollPolicy {
    /// Single-thermostat changes.
    pub const THERMOSTAT: PollPolicy = PollPolicy::new(10, Duration::from_millis(200));
    /// Master-mode changes, which move every relay.
    pub const MASTER: PollPolicy = PollPolicy::new(20, Duration::from_millis(500));
    /// Quick check that the master-mode flag flipped at all.
    pub const MODE_FLIP: PollPolicy = PollPolicy::new(2, Duration::from_millis(500));

    pub const fn new(attempts: u32, delay: Duration) -> Self {
        Self { attempts, delay }
    }
}

/// The budgets used by the clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub thermostat: PollPolicy,
    pub master: PollPolicy,
    pub mode_flip: PollPolicy,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            thermostat: PollPolicy::THERMOSTAT,
            master: PollPolicy::MASTER,
            mode_flip: PollPolicy::MODE_FLIP,
        }
    }
}

/// Re-reads with `read` until `required` and `settled` hold.
///
/// Each attempt waits `policy.delay` first. The first snapshot satisfying
/// both conditions is returned. Once the attempts are used up, the latest
/// snapshot that satisfied `required` is returned, settled or not.
///
/// A transport error while reading uses up an attempt like an unmet
/// condition. If no snapshot ever satisfied `required` and the last attempt
/// failed that way, its error is returned. Any other error ends the polling
/// immediately. At least one read is made even if the policy allows none.
pub async fn poll_until<T, F, Fut, R, S>(
    policy: PollPolicy,
    mut read: F,
    required: R,
    settled: S,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    R: Fn(&T) -> bool,
    S: Fn(&T) -> bool,
{
    let attempts = policy.attempts.max(1);
    let mut last_error = None;
    let mut applied = None;
    for attempt in 1..=attempts {
        tokio::time::sleep(policy.delay).await;
        let snapshot = match read().await {
            Ok(snapshot) => {
                last_error = None;
                snapshot
            }
            Err(err) if err.is_retryable() => {
                warn!("Poll attempt {attempt}/{attempts} failed: {err}");
                last_error = Some(err);
                continue;
            }
            Err(err) => return Err(err),
        };
        if !required(&snapshot) {
            debug!("Poll attempt {attempt}/{attempts}: not applied yet");
            continue;
        }
        if settled(&snapshot) {
            debug!("Poll attempt {attempt}/{attempts}: applied and settled");
            return Ok(snapshot);
        }
        debug!("Poll attempt {attempt}/{attempts}: applied, not settled");
        applied = Some(snapshot);
    }
    if let Some(snapshot) = applied {
        debug!("Applied, but not settled after {attempts} attempts");
        return Ok(snapshot);
    }
    Err(last_error.unwrap_or(Error::Convergence { attempts }))
}

/// The valve position a thermostat should be heading for, if it is clear.
fn valve_demand(thermostat: &Thermostat, hysteresis: f64) -> Option<bool> {
    let temperature = thermostat.current_temperature_c;
    let target = thermostat.current_target_c();
    let too_cold = temperature < target - hysteresis;
    let too_warm = temperature > target + hysteresis;
    match (thermostat.cooling_active, too_cold, too_warm) {
        (false, true, _) | (true, _, true) => Some(true),
        (false, _, true) | (true, true, _) => Some(false),
        _ => None,
    }
}

/// Whether the valves agree with the current targets.
///
/// Biased towards "settled": a thermostat only counts as unsettled when it is
/// clearly outside the hysteresis band and its valve is in the wrong position.
/// Thermostats that are off, offline or whose direction is disabled are
/// ignored, and without a known hysteresis the state counts as settled.
pub fn is_settled(state: &DeviceState) -> bool {
    let Some(config) = &state.controller.config else {
        return true;
    };
    let Some(hysteresis) = config.thermostat_hysteresis_c else {
        return true;
    };
    state
        .thermostats
        .iter()
        .filter(|t| t.is_on && t.is_live)
        .filter(|t| {
            if t.cooling_active {
                config.cooling_enabled
            } else {
                config.heating_enabled
            }
        })
        .all(|t| match valve_demand(t, hysteresis) {
            Some(open) if open != t.valve_open => {
                debug!(
                    "Thermostat {} not settled: {:.1} °C against target {:.1} °C, valve {}",
                    t.id,
                    t.current_temperature_c,
                    t.current_target_c(),
                    if t.valve_open { "open" } else { "closed" }
                );
                false
            }
            _ => true,
        })
}
