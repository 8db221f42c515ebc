use std::fmt;

use async_trait::async_trait;

use crate::errors::Result;

pub mod nvml_control;
pub mod smi_control;

// Snapshot of the main GPU readings, used for status reports
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GpuStatus {
    pub clock_mhz: u32,
    pub temperature_c: Option<u32>,
    pub power_watts: Option<f64>,
    pub utilization: Option<u32>,
    pub pstate: Option<String>,
}

impl fmt::Display for GpuStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn or_unknown<T: fmt::Display>(value: &Option<T>) -> String {
            value
                .as_ref()
                .map(|v| v.to_string())
                .unwrap_or_else(|| "?".to_string())
        }

        write!(
            f,
            "clk={} MHz, temp={}°C, power={}W, util={}%, pstate={}",
            self.clock_mhz,
            or_unknown(&self.temperature_c),
            or_unknown(&self.power_watts),
            or_unknown(&self.utilization),
            or_unknown(&self.pstate),
        )
    }
}

// Hardware control port of a single GPU.
// Implementations are invoked strictly sequentially by the daemon
#[async_trait]
pub trait GpuControl: Send + Sync {
    // Return the current graphics clock in MHz
    async fn read_clock(&self) -> Result<u32>;
    // Return the GPU temperature, None if the sensor is unsupported
    async fn read_temperature(&self) -> Result<Option<u32>>;

    // Lock the graphics clock into the [min, max] range
    async fn set_locked_clocks(&self, min_mhz: u32, max_mhz: u32) -> Result<()>;
    // Set the core and memory clock offsets
    async fn set_offsets(&self, core_mhz: i32, memory_mhz: i32) -> Result<()>;
    // Set the board power limit, clamped to the supported range
    async fn set_power_limit(&self, watts: u32) -> Result<()>;

    // Keep the driver loaded between clients
    async fn enable_persistence(&self) -> Result<()>;
    // Return a status snapshot of the GPU
    async fn query_status(&self) -> Result<GpuStatus>;
    // Return the supported graphics clocks in ascending order
    async fn supported_clocks(&self) -> Result<Vec<u32>>;
}

// Return the supported clock closest to the target,
// None if the target is supported or the list is empty
pub fn nearest_supported_clock(supported: &[u32], target: u32) -> Option<u32> {
    if supported.is_empty() || supported.contains(&target) {
        return None;
    }

    supported.iter().copied().min_by_key(|c| c.abs_diff(target))
}

// Clamp a requested power limit into the board [min, max] range in watts
pub fn clamp_power_limit(watts: u32, min: f64, max: f64) -> u32 {
    // Unusable range reported by the driver, leave the request as is
    if min.is_nan() || max.is_nan() || min > max {
        return watts;
    }

    let clamped = (watts as f64).clamp(min, max);

    // Round toward the inside of the range
    if clamped > watts as f64 {
        clamped.ceil() as u32
    } else {
        clamped.floor() as u32
    }
}
