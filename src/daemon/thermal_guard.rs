use tracing::{info, warn};

use crate::{daemon::load_sensor::Sample, gpu_control::GpuControl, policy_config::PolicyConfig};

// Lower the max clock while the GPU is over its temperature limit
#[derive(Debug, Clone)]
pub struct ThermalGuard {
    limit_c: Option<u32>,
    // Max clock used while engaged
    reduced_target_mhz: u32,

    // Cleared for the whole session when the sensor is unsupported
    supported: bool,
    engaged: bool,
}

impl ThermalGuard {
    pub fn new(limit_c: Option<u32>, reduced_target_mhz: u32) -> Self {
        Self {
            limit_c,
            reduced_target_mhz,
            supported: true,
            engaged: false,
        }
    }

    pub fn from_policy(policy: &PolicyConfig) -> Self {
        Self::new(policy.temp_limit_c, policy.reduced_target_mhz())
    }

    // Whether the guard reads the temperature every tick
    pub fn is_active(&self) -> bool {
        self.limit_c.is_some() && self.supported
    }

    pub fn is_engaged(&self) -> bool {
        self.engaged
    }

    // Read the temperature into the sample and update the guard.
    // A failed read keeps the previous decision
    pub async fn observe(&mut self, gpu: &dyn GpuControl, sample: &mut Sample) {
        if !self.is_active() {
            return;
        }

        match gpu.read_temperature().await {
            Ok(Some(temp)) => {
                sample.temperature_c = Some(temp);
                self.update(temp);
            }
            Ok(None) => {
                warn!("Thermal guard: temperature sensor unsupported, guard disabled");

                self.supported = false;
                self.engaged = false;
            }
            Err(err) => {
                warn!("Thermal guard: {err}");
            }
        }
    }

    // Engage while the temperature is strictly over the limit
    pub fn update(&mut self, temp_c: u32) {
        let Some(limit) = self.limit_c else {
            return;
        };

        let hot = temp_c > limit;

        if hot && !self.engaged {
            warn!(
                "Thermal guard: {temp_c}°C > {limit}°C, limiting max clock to {} MHz",
                self.reduced_target_mhz
            );
        } else if !hot && self.engaged {
            info!("Thermal guard: {temp_c}°C <= {limit}°C, releasing clock limit");
        }

        self.engaged = hot;
    }

    // Max clock allowed for the given nominal target
    pub fn effective_target(&self, target_mhz: u32) -> u32 {
        if self.engaged {
            target_mhz.min(self.reduced_target_mhz)
        } else {
            target_mhz
        }
    }
}
