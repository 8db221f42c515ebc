#![allow(dead_code)]

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use gpu_undervolt::{
    errors::{Result, UndervoltError},
    gpu_control::{GpuControl, GpuStatus},
    policy_config::{PolicyConfig, ProfileConfig},
};
use tokio_util::sync::CancellationToken;

// Hardware write recorded by the mock
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    LockClocks(u32, u32),
    Offsets(i32, i32),
    PowerLimit(u32),
    Persistence,
}

#[derive(Debug, Default)]
struct MockState {
    clock_mhz: u32,
    clock_unavailable: bool,
    // None means the sensor is unsupported
    temperature_c: Option<u32>,

    offsets_unsupported: bool,
    // Number of upcoming offset writes that get rejected
    offset_failures: usize,
    // Number of upcoming clock locks that get rejected
    lock_failures: usize,

    // Cancel the token once this many clock locks were applied
    cancel_after_locks: Option<(usize, CancellationToken)>,
    locks_applied: usize,

    calls: Vec<Call>,
}

// In-memory GPU recording every write it receives
#[derive(Debug, Clone, Default)]
pub struct MockGpu {
    inner: Arc<Mutex<MockState>>,
}

impl MockGpu {
    pub fn new(clock_mhz: u32) -> Self {
        let gpu = Self::default();
        gpu.set_clock(clock_mhz);
        gpu
    }

    pub fn boxed(&self) -> Box<dyn GpuControl> {
        Box::new(self.clone())
    }

    pub fn set_clock(&self, clock_mhz: u32) {
        self.inner.lock().unwrap().clock_mhz = clock_mhz;
    }

    pub fn set_clock_unavailable(&self, unavailable: bool) {
        self.inner.lock().unwrap().clock_unavailable = unavailable;
    }

    pub fn set_temperature(&self, temperature_c: Option<u32>) {
        self.inner.lock().unwrap().temperature_c = temperature_c;
    }

    pub fn set_offsets_unsupported(&self) {
        self.inner.lock().unwrap().offsets_unsupported = true;
    }

    pub fn fail_next_locks(&self, count: usize) {
        self.inner.lock().unwrap().lock_failures = count;
    }

    pub fn fail_next_offsets(&self, count: usize) {
        self.inner.lock().unwrap().offset_failures = count;
    }

    pub fn cancel_after_locks(&self, count: usize, token: CancellationToken) {
        let mut state = self.inner.lock().unwrap();
        state.locks_applied = 0;
        state.cancel_after_locks = Some((count, token));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.inner.lock().unwrap().calls.clone()
    }

    // Return and forget the recorded calls
    pub fn take_calls(&self) -> Vec<Call> {
        std::mem::take(&mut self.inner.lock().unwrap().calls)
    }

    pub fn locks(&self) -> Vec<(u32, u32)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::LockClocks(min, max) => Some((min, max)),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl GpuControl for MockGpu {
    async fn read_clock(&self) -> Result<u32> {
        let state = self.inner.lock().unwrap();

        if state.clock_unavailable {
            return Err(UndervoltError::hardware("mock read failure"));
        }

        Ok(state.clock_mhz)
    }

    async fn read_temperature(&self) -> Result<Option<u32>> {
        Ok(self.inner.lock().unwrap().temperature_c)
    }

    async fn set_locked_clocks(&self, min_mhz: u32, max_mhz: u32) -> Result<()> {
        let mut state = self.inner.lock().unwrap();

        if state.lock_failures > 0 {
            state.lock_failures -= 1;
            return Err(UndervoltError::apply("mock lock rejected"));
        }

        state.calls.push(Call::LockClocks(min_mhz, max_mhz));
        state.locks_applied += 1;

        if let Some((count, token)) = &state.cancel_after_locks {
            if state.locks_applied >= *count {
                token.cancel();
            }
        }

        Ok(())
    }

    async fn set_offsets(&self, core_mhz: i32, memory_mhz: i32) -> Result<()> {
        let mut state = self.inner.lock().unwrap();

        if state.offsets_unsupported {
            return Err(UndervoltError::offset("mock without Coolbits"));
        }

        if state.offset_failures > 0 {
            state.offset_failures -= 1;
            return Err(UndervoltError::apply("mock offsets rejected"));
        }

        state.calls.push(Call::Offsets(core_mhz, memory_mhz));
        Ok(())
    }

    async fn set_power_limit(&self, watts: u32) -> Result<()> {
        self.inner.lock().unwrap().calls.push(Call::PowerLimit(watts));
        Ok(())
    }

    async fn enable_persistence(&self) -> Result<()> {
        self.inner.lock().unwrap().calls.push(Call::Persistence);
        Ok(())
    }

    async fn query_status(&self) -> Result<GpuStatus> {
        let state = self.inner.lock().unwrap();

        Ok(GpuStatus {
            clock_mhz: state.clock_mhz,
            temperature_c: state.temperature_c,
            pstate: Some("P2".to_string()),
            ..Default::default()
        })
    }

    async fn supported_clocks(&self) -> Result<Vec<u32>> {
        Ok(Vec::new())
    }
}

// Policy used by most tests: 1200 MHz threshold, 0.5s poll
pub fn profile() -> ProfileConfig {
    ProfileConfig {
        target_clock: Some(1860),
        min_clock: Some(210),
        transition_clock: Some(1200),
        poll: Some(0.5),
        on_hold: Some(2.0),
        off_hold: Some(1.0),
        ..Default::default()
    }
}

pub fn policy(profile: ProfileConfig) -> PolicyConfig {
    PolicyConfig::resolve(&profile).unwrap()
}

pub fn secs(value: f64) -> Duration {
    Duration::from_secs_f64(value)
}
