//! Midpoint and limit arithmetic.
//!
//! A thermostat lets its user move the target within `midpoint ± limit`.
//! The controller derives one midpoint per mode from a base midpoint and two
//! differences, and no adjustable target may ever leave the safe range.

use crate::model::{round_tenth, ModeTemperatures};

/// Lowest target a thermostat may ever be adjusted to, in °C.
pub const MIN_TARGET_C: f64 = 5.0;
/// Highest target a thermostat may ever be adjusted to, in °C.
pub const MAX_TARGET_C: f64 = 45.0;

/// Moves `midpoint` so that `midpoint ± limit` stays inside
/// [`MIN_TARGET_C`, `MAX_TARGET_C`].
///
/// The limit is never changed. A band wider than the safe range cannot fit
/// anywhere, in that case the midpoint is pinned to the centre of the range.
pub fn clamp_midpoint(midpoint: f64, limit: f64) -> f64 {
    let lower = MIN_TARGET_C + limit;
    let upper = MAX_TARGET_C - limit;
    if lower > upper {
        log::warn!(
            "Limit ±{limit} does not fit into the safe target range, centring the midpoint"
        );
        return (MIN_TARGET_C + MAX_TARGET_C) / 2.0;
    }
    let clamped = midpoint.clamp(lower, upper);
    if clamped != midpoint {
        log::debug!("Midpoint {midpoint} clamped to {clamped} for limit ±{limit}");
    }
    clamped
}

/// Spreads a base midpoint over the four modes.
pub fn distribute_midpoints(
    midpoint: f64,
    heating_cooling_diff: f64,
    eco_diff: f64,
) -> ModeTemperatures {
    ModeTemperatures {
        heating: round_tenth(midpoint - heating_cooling_diff),
        cooling: round_tenth(midpoint + heating_cooling_diff),
        eco_heating: round_tenth(midpoint - heating_cooling_diff - eco_diff),
        eco_cooling: round_tenth(midpoint + heating_cooling_diff + eco_diff),
    }
}

/// The midpoints to apply to one thermostat carrying `limit`.
///
/// Thermostats with different limits can end up with different midpoints
/// for the same requested base midpoint.
pub fn thermostat_midpoints(
    midpoint: f64,
    limit: f64,
    heating_cooling_diff: f64,
    eco_diff: f64,
) -> ModeTemperatures {
    distribute_midpoints(
        clamp_midpoint(midpoint, limit),
        heating_cooling_diff,
        eco_diff,
    )
}
