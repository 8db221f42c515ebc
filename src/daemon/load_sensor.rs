use tokio::time::Instant;

use crate::{errors::Result, gpu_control::GpuControl};

// One reading of the GPU, only lives for a single tick
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub clock_mhz: u32,
    // Filled in by the thermal guard when it is active
    pub temperature_c: Option<u32>,
    pub timestamp: Instant,
}

impl Sample {
    pub fn new(clock_mhz: u32) -> Self {
        Self {
            clock_mhz,
            temperature_c: None,
            timestamp: Instant::now(),
        }
    }
}

// Classify the GPU as loaded or idle from its graphics clock
#[derive(Debug, Clone, Copy)]
pub struct LoadSensor {
    transition_clock_mhz: u32,
}

impl LoadSensor {
    pub fn new(transition_clock_mhz: u32) -> Self {
        Self {
            transition_clock_mhz,
        }
    }

    // Read the current clock, errors are left to the caller
    pub async fn sample(&self, gpu: &dyn GpuControl) -> Result<Sample> {
        let clock_mhz = gpu.read_clock().await?;

        Ok(Sample::new(clock_mhz))
    }

    pub fn is_loaded(&self, sample: &Sample) -> bool {
        sample.clock_mhz >= self.transition_clock_mhz
    }
}
