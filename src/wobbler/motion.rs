//! Motion requests and oscillation planning.

use crate::error::{AppResult, DaqError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exclusive travel limits in steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MotionBounds {
    pub min: i64,
    pub max: i64,
}

impl Default for MotionBounds {
    fn default() -> Self {
        Self { min: 0, max: 40_000 }
    }
}

impl MotionBounds {
    pub const fn new(min: i64, max: i64) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, position: i64) -> bool {
        self.min < position && position < self.max
    }

    /// Validate a target. Positions on or beyond a limit are rejected, never clamped.
    pub fn request(&self, target: i64, frequency: f64) -> AppResult<MotionRequest> {
        if !self.contains(target) {
            return Err(DaqError::OutOfRange(format!(
                "wobbler position {target} outside ({}, {})",
                self.min, self.max
            )));
        }
        Ok(MotionRequest {
            target_position: target,
            frequency,
        })
    }
}

/// A validated absolute move.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionRequest {
    pub target_position: i64,
    /// Steps per second.
    pub frequency: f64,
}

/// Steps covered during `integration`, rounded down to 100 and padded by 100.
pub fn recommended_relative_motion(integration: Duration, step_period: f64) -> i64 {
    (integration.as_secs_f64() / step_period / 100.0).floor() as i64 * 100 + 100
}

/// Back-and-forth waypoints around `current`.
///
/// Each leg is as long as one integration. The first leg heads away from the
/// nearer limit, the direction flips every `stride` legs, and the result must
/// end where it started; anything else is an [`DaqError::InvalidParameter`].
pub fn recommended_movements(
    current: i64,
    bounds: &MotionBounds,
    step_period: f64,
    integration: Duration,
    legs: usize,
    stride: usize,
) -> AppResult<Vec<i64>> {
    if stride == 0 {
        return Err(DaqError::InvalidParameter("stride must be positive".into()));
    }
    if (legs / 2) % stride != 0 {
        return Err(DaqError::InvalidParameter(format!(
            "{legs} legs with stride {stride} cannot return to the start"
        )));
    }

    let mut ds = recommended_relative_motion(integration, step_period);
    if current - bounds.max / 2 > 0 {
        ds = -ds;
    }

    let mut position = current;
    let mut path = Vec::with_capacity(legs);
    for i in 0..legs {
        position += ds;
        path.push(position);
        if i % stride == 0 {
            ds = -ds;
        }
    }

    if path.last() != Some(&current) {
        return Err(DaqError::InvalidParameter(format!(
            "{legs} legs with stride {stride} do not end at {current}"
        )));
    }
    Ok(path)
}
