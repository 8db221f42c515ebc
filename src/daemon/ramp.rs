use std::time::Duration;

use tokio::{select, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{errors::Result, gpu_control::GpuControl, policy_config::PolicyConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RampOutcome {
    // The locked max clock reached the target
    Completed,
    // Shutdown was requested, the last issued step was completed
    Cancelled,
}

// Intermediate max clocks walking from `from` to `to` in `step` increments.
// The last element is always `to`, no element exceeds it
pub fn ramp_steps(from: u32, to: u32, step: u32) -> Vec<u32> {
    if step == 0 || from >= to {
        return vec![to];
    }

    let mut steps = Vec::with_capacity((to - from).div_ceil(step) as usize);
    let mut current = from;

    while current < to {
        current = current.saturating_add(step).min(to);
        steps.push(current);
    }

    steps
}

// Walk the locked max clock up to a target instead of jumping to it
#[derive(Debug, Clone, Copy)]
pub struct RampController {
    enabled: bool,
    step_mhz: u32,
    // Pause between two steps
    step_sleep: Duration,
}

impl RampController {
    pub fn new(enabled: bool, step_mhz: u32, step_sleep: Duration) -> Self {
        Self {
            enabled,
            step_mhz,
            step_sleep,
        }
    }

    pub fn from_policy(policy: &PolicyConfig) -> Self {
        Self::new(policy.ramp_enabled, policy.ramp_step_mhz, policy.ramp_sleep)
    }

    // The max clocks that will be applied, in order
    pub fn plan(&self, from: u32, to: u32) -> Vec<u32> {
        if self.enabled {
            ramp_steps(from, to, self.step_mhz)
        } else {
            vec![to]
        }
    }

    // Apply the plan step by step. `locked_max` always holds the
    // last max clock the GPU accepted.
    // A command in flight is never interrupted, cancellation is
    // only observed between steps and during the pauses
    pub async fn run(
        &self,
        gpu: &dyn GpuControl,
        min_mhz: u32,
        from: u32,
        to: u32,
        locked_max: &mut u32,
        token: &CancellationToken,
    ) -> Result<RampOutcome> {
        let steps = self.plan(from, to);
        let last = steps.len() - 1;

        for (i, step) in steps.into_iter().enumerate() {
            if token.is_cancelled() {
                return Ok(RampOutcome::Cancelled);
            }

            debug!("Ramp: locking clocks min={min_mhz} max={step} MHz");

            gpu.set_locked_clocks(min_mhz, step).await?;
            *locked_max = step;

            if i == last {
                break;
            }

            select! {
                _ = token.cancelled() => {
                    debug!("Ramp: cancelled at {step} MHz");
                    return Ok(RampOutcome::Cancelled);
                },
                _ = sleep(self.step_sleep) => {}
            }
        }

        Ok(RampOutcome::Completed)
    }
}
