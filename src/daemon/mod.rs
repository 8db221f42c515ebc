use std::time::Duration;

use tokio::{select, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::{
    daemon::{
        hysteresis::{HysteresisGate, Transition},
        load_sensor::LoadSensor,
        ramp::{RampController, RampOutcome},
        thermal_guard::ThermalGuard,
    },
    errors::{Result, UndervoltError},
    gpu_control::{GpuControl, nearest_supported_clock},
    policy_config::PolicyConfig,
};

pub mod hysteresis;
pub mod load_sensor;
pub mod ramp;
pub mod thermal_guard;

// Attempts of the revert performed on shutdown
const REVERT_ATTEMPTS: u32 = 3;
const REVERT_RETRY_DELAY: Duration = Duration::from_millis(500);

// Mutable state of the daemon, only changed at tick boundaries
#[derive(Debug, Clone, PartialEq)]
pub struct DaemonState {
    pub enabled: bool,

    // Contiguous time spent above and below the load threshold
    pub above_threshold: Duration,
    pub below_threshold: Duration,

    // Max of the locked graphics clock range
    pub locked_clock_mhz: u32,
    // Core and memory offsets currently written
    pub applied_offsets: (i32, i32),

    // A disable edge failed part way, the GPU must not be
    // raised again until the revert succeeds or load comes back
    pub revert_pending: bool,
}

impl DaemonState {
    // Disabled state with the clock locked to the idle floor
    pub fn idle(min_clock_mhz: u32) -> Self {
        Self {
            enabled: false,
            above_threshold: Duration::ZERO,
            below_threshold: Duration::ZERO,
            locked_clock_mhz: min_clock_mhz,
            applied_offsets: (0, 0),
            revert_pending: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Continue,
    // Shutdown was observed during the tick
    Shutdown,
}

// Load adaptive undervolt controller of one GPU
pub struct Daemon {
    policy: PolicyConfig,
    gpu: Box<dyn GpuControl>,

    state: DaemonState,

    sensor: LoadSensor,
    gate: HysteresisGate,
    ramp: RampController,
    thermal: ThermalGuard,

    // Cleared after the first OffsetUnavailable error
    offsets_supported: bool,
}

impl Daemon {
    pub fn new(policy: PolicyConfig, gpu: Box<dyn GpuControl>) -> Self {
        Self {
            state: DaemonState::idle(policy.min_clock_mhz),

            sensor: LoadSensor::new(policy.transition_clock_mhz),
            gate: HysteresisGate::new(
                policy.poll_interval,
                policy.on_hold,
                policy.off_hold,
            ),
            ramp: RampController::from_policy(&policy),
            thermal: ThermalGuard::from_policy(&policy),

            offsets_supported: true,

            policy,
            gpu,
        }
    }

    pub fn state(&self) -> &DaemonState {
        &self.state
    }

    pub fn policy(&self) -> &PolicyConfig {
        &self.policy
    }

    pub fn gpu(&self) -> &dyn GpuControl {
        self.gpu.as_ref()
    }

    pub fn thermal_engaged(&self) -> bool {
        self.thermal.is_engaged()
    }

    // Run the daemon until the token is cancelled,
    // the GPU is always reverted before returning
    pub async fn run(&mut self, token: CancellationToken) -> Result<()> {
        info!("Daemon: Running");

        self.start().await?;

        loop {
            if token.is_cancelled() {
                break;
            }

            if self.tick(&token).await == TickOutcome::Shutdown {
                break;
            }

            select! {
                _ = token.cancelled() => {
                    break;
                },
                _ = sleep(self.policy.poll_interval) => {}
            }
        }

        info!("Daemon: Quitting, reverting GPU settings");

        self.revert_with_retry().await?;

        info!("Daemon: Stopped");

        Ok(())
    }

    // Prepare the GPU and apply the idle baseline so the
    // hardware matches the initial state
    pub async fn start(&mut self) -> Result<()> {
        self.prepare().await;

        info!(
            "Daemon: target={} MHz, transition={} MHz, min={} MHz, poll={:?}, on-hold={:?}, off-hold={:?}",
            self.policy.target_clock_mhz,
            self.policy.transition_clock_mhz,
            self.policy.min_clock_mhz,
            self.policy.poll_interval,
            self.policy.on_hold,
            self.policy.off_hold,
        );

        if let Some(limit) = self.policy.temp_limit_c {
            info!(
                "Daemon: thermal guard at {limit}°C, reduced max clock {} MHz",
                self.policy.reduced_target_mhz()
            );
        }

        self.revert().await.map_err(|err| {
            UndervoltError::apply(format!("Failed to apply the idle baseline: {err}"))
        })
    }

    // Best effort preparation shared with the one-shot mode
    pub async fn prepare(&self) {
        // Enable persistence for reliability
        if let Err(err) = self.gpu.enable_persistence().await {
            warn!("Persistence mode: {err}");
        }

        // Warn when the target is not on the clock grid
        match self.gpu.supported_clocks().await {
            Ok(clocks) => {
                let target = self.policy.target_clock_mhz;
                if let Some(nearest) = nearest_supported_clock(&clocks, target) {
                    warn!(
                        "{target} MHz not in the supported clocks list, nearest is {nearest} MHz"
                    );
                }
            }
            Err(err) => debug!("Supported clocks unavailable: {err}"),
        }
    }

    // Sample the GPU once and drive the state machine
    pub async fn tick(&mut self, token: &CancellationToken) -> TickOutcome {
        // A failed read carries the state forward to the next tick
        let mut sample = match self.sensor.sample(self.gpu.as_ref()).await {
            Ok(sample) => sample,
            Err(err) => {
                warn!("Daemon: No sample this tick: {err}");
                return TickOutcome::Continue;
            }
        };

        self.thermal.observe(self.gpu.as_ref(), &mut sample).await;

        let loaded = self.sensor.is_loaded(&sample);

        trace!(
            "Daemon: clk={} MHz, temp={:?}, loaded={loaded}, enabled={}",
            sample.clock_mhz,
            sample.temperature_c,
            self.state.enabled
        );

        match self.gate.update(&mut self.state, loaded) {
            Some(Transition::Enable) => {
                info!("Daemon: Enabling undervolt (clk={} MHz)", sample.clock_mhz);

                match self.apply_active(token).await {
                    Ok(RampOutcome::Completed) => {}
                    Ok(RampOutcome::Cancelled) => return TickOutcome::Shutdown,
                    Err(err) => {
                        error!("Daemon: Failed to enable undervolt: {err}");
                        self.rollback().await;
                    }
                }
            }
            Some(Transition::Disable) => {
                info!("Daemon: Disabling undervolt (clk={} MHz)", sample.clock_mhz);

                // The state stays enabled on failure so the
                // next idle tick tries again
                if let Err(err) = self.revert().await {
                    error!("Daemon: Failed to disable undervolt: {err}");
                    self.state.revert_pending = true;
                }
            }
            None => {}
        }

        if loaded && self.state.revert_pending {
            info!("Daemon: Load is back, keeping the undervolt applied");
            self.state.revert_pending = false;
        }

        self.enforce_thermal_limit().await;

        TickOutcome::Continue
    }

    // Apply offsets, power limit and the locked clock, ramping if configured.
    // The state is only marked enabled once the whole sequence succeeded
    pub async fn apply_active(&mut self, token: &CancellationToken) -> Result<RampOutcome> {
        let (core, memory) = self.policy.offsets();

        if self.state.applied_offsets != (core, memory) {
            info!("Applying offsets: core {core:+} MHz, memory {memory:+} MHz");
            self.write_offsets(core, memory).await?;
        }

        if let Some(watts) = self.policy.power_limit_watts {
            info!("Setting power limit: {watts} W");
            self.gpu.set_power_limit(watts).await?;
        }

        let min = self.policy.min_clock_mhz;
        let target = self.thermal.effective_target(self.policy.target_clock_mhz);

        info!("Locking clocks min={min} max={target} MHz");

        let outcome = self
            .ramp
            .run(
                self.gpu.as_ref(),
                min,
                self.state.locked_clock_mhz,
                target,
                &mut self.state.locked_clock_mhz,
                token,
            )
            .await?;

        if outcome == RampOutcome::Completed {
            self.state.enabled = true;
        }

        Ok(outcome)
    }

    // Restore the idle-safe configuration: clock locked to the
    // floor and offsets cleared. Both writes are always attempted
    pub async fn revert(&mut self) -> Result<()> {
        let min = self.policy.min_clock_mhz;
        let mut result = Ok(());

        match self.gpu.set_locked_clocks(min, min).await {
            Ok(()) => self.state.locked_clock_mhz = min,
            Err(err) => result = Err(err),
        }

        if let Err(err) = self.write_offsets(0, 0).await {
            if result.is_ok() {
                result = Err(err);
            } else {
                error!("Reset offsets: {err}");
            }
        }

        if result.is_ok() {
            self.state.enabled = false;
            self.state.revert_pending = false;
        }

        result
    }

    // Undo a failed enable so the GPU is never left half applied
    async fn rollback(&mut self) {
        self.state.enabled = false;
        self.state.above_threshold = Duration::ZERO;

        if let Err(err) = self.revert().await {
            error!("Daemon: Rollback incomplete: {err}");
        }
    }

    async fn revert_with_retry(&mut self) -> Result<()> {
        let mut attempt = 1;

        loop {
            match self.revert().await {
                Ok(()) => return Ok(()),
                Err(err) if attempt < REVERT_ATTEMPTS => {
                    warn!("Revert attempt {attempt}/{REVERT_ATTEMPTS} failed: {err}");

                    attempt += 1;
                    sleep(REVERT_RETRY_DELAY).await;
                }
                Err(err) => {
                    error!("Failed to revert GPU settings after {REVERT_ATTEMPTS} attempts");
                    return Err(err);
                }
            }
        }
    }

    // Write the offsets if they are in use. An unsupported offset path
    // is reported once and the daemon continues with clock control only
    async fn write_offsets(&mut self, core: i32, memory: i32) -> Result<()> {
        if !self.policy.use_offsets || !self.offsets_supported {
            return Ok(());
        }

        match self.gpu.set_offsets(core, memory).await {
            Ok(()) => {
                self.state.applied_offsets = (core, memory);
                Ok(())
            }
            Err(UndervoltError::OffsetUnavailable { reason }) => {
                warn!("Offsets unavailable, continuing with clock lock only: {reason}");

                self.offsets_supported = false;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    // Keep the locked max clock in line with the thermal guard.
    // Writes only happen when the allowed max changed
    async fn enforce_thermal_limit(&mut self) {
        if !self.state.enabled || self.state.revert_pending {
            return;
        }

        let min = self.policy.min_clock_mhz;
        let allowed = self.thermal.effective_target(self.policy.target_clock_mhz);

        if self.state.locked_clock_mhz == allowed {
            return;
        }

        debug!("Daemon: Adjusting max clock {} -> {allowed} MHz", self.state.locked_clock_mhz);

        match self.gpu.set_locked_clocks(min, allowed).await {
            Ok(()) => self.state.locked_clock_mhz = allowed,
            Err(err) => error!("Daemon: Failed to apply thermal clock limit: {err}"),
        }
    }
}
