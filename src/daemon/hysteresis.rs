use std::time::Duration;

use crate::daemon::DaemonState;

// Edge emitted when the dwell time of the current condition is reached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Enable,
    Disable,
}

// Time based hysteresis between the Disabled and Enabled states.
// The dwell counters live in the DaemonState, the gate only
// holds the timings
#[derive(Debug, Clone, Copy)]
pub struct HysteresisGate {
    poll_interval: Duration,

    // Contiguous time above the threshold needed to enable
    on_hold: Duration,
    // Contiguous time below the threshold needed to disable
    off_hold: Duration,
}

impl HysteresisGate {
    pub fn new(poll_interval: Duration, on_hold: Duration, off_hold: Duration) -> Self {
        Self {
            poll_interval,
            on_hold,
            off_hold,
        }
    }

    // Account one tick and return the edge to apply, if any.
    // The opposite counter is always reset so dwell time is contiguous
    pub fn update(&self, state: &mut DaemonState, loaded: bool) -> Option<Transition> {
        if loaded {
            state.above_threshold += self.poll_interval;
            state.below_threshold = Duration::ZERO;

            if !state.enabled && state.above_threshold >= self.on_hold {
                return Some(Transition::Enable);
            }
        } else {
            state.below_threshold += self.poll_interval;
            state.above_threshold = Duration::ZERO;

            if state.enabled && state.below_threshold >= self.off_hold {
                return Some(Transition::Disable);
            }
        }

        None
    }
}
