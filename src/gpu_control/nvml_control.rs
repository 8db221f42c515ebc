use std::sync::Arc;

use async_trait::async_trait;
use nvml_wrapper::{
    Device, Nvml,
    enum_wrappers::device::{Clock, ClockId, TemperatureSensor},
    error::NvmlError,
};
use tracing::{debug, warn};

use crate::{
    errors::{Result, UndervoltError},
    gpu_control::{GpuControl, GpuStatus, clamp_power_limit, smi_control::SmiControl},
};

// GPU control reading sensors through NVML.
// Settings are still applied with the vendor tools
pub struct NvmlControl {
    // NVML is thread-safe so it is safe to make
    // simultaneous NVML calls from multiple threads
    nvml: Arc<Nvml>,

    index: u32,
    tools: SmiControl,
}

impl NvmlControl {
    // Load NVML and check the selected GPU exists
    pub fn try_new(tools: SmiControl) -> Result<Self> {
        let nvml = Nvml::init().map_err(|e| {
            UndervoltError::hardware(format!("Failed to load NVML library: {e}"))
        })?;

        let control = Self {
            nvml: Arc::new(nvml),
            index: tools.index(),
            tools,
        };

        let device = control.get()?;
        if let Ok(name) = device.name() {
            debug!("Using GPU {}: \"{}\"", control.index, name);
        }
        drop(device);

        Ok(control)
    }

    // Return a NVML device handle.
    // This function can fail and return an error
    fn get(&self) -> Result<Device<'_>> {
        self.nvml.device_by_index(self.index).map_err(|e| {
            UndervoltError::hardware(format!(
                "Failed to retrieve GPU device {}: {e}",
                self.index
            ))
        })
    }

    // Power limit range in watts
    fn power_limit_range(&self) -> Result<(f64, f64)> {
        let device = self.get()?;

        let limits = device.power_management_limit_constraints().map_err(|e| {
            UndervoltError::hardware(format!("Power limit range unavailable: {e}"))
        })?;

        Ok((
            limits.min_limit as f64 / 1000.,
            limits.max_limit as f64 / 1000.,
        ))
    }
}

#[async_trait]
impl GpuControl for NvmlControl {
    async fn read_clock(&self) -> Result<u32> {
        let device = self.get()?;

        device
            .clock(Clock::Graphics, ClockId::Current)
            .map_err(|e| {
                UndervoltError::hardware(format!(
                    "Failed to read graphics clock: {e}"
                ))
            })
    }

    async fn read_temperature(&self) -> Result<Option<u32>> {
        let device = self.get()?;

        match device.temperature(TemperatureSensor::Gpu) {
            Ok(temp) => Ok(Some(temp)),
            Err(NvmlError::NotSupported) => Ok(None),
            Err(e) => Err(UndervoltError::hardware(format!(
                "Failed to read GPU temperature: {e}"
            ))),
        }
    }

    async fn set_locked_clocks(&self, min_mhz: u32, max_mhz: u32) -> Result<()> {
        self.tools.set_locked_clocks(min_mhz, max_mhz).await
    }

    async fn set_offsets(&self, core_mhz: i32, memory_mhz: i32) -> Result<()> {
        self.tools.set_offsets(core_mhz, memory_mhz).await
    }

    async fn set_power_limit(&self, watts: u32) -> Result<()> {
        let watts = match self.power_limit_range() {
            Ok((min, max)) => {
                let clamped = clamp_power_limit(watts, min, max);
                if clamped != watts {
                    warn!(
                        "Requested power limit {watts}W not in [{min}, {max}]W range, clamping to {clamped}W"
                    );
                }
                clamped
            }
            Err(err) => {
                debug!("{err}");
                watts
            }
        };

        self.tools.apply_power_limit(watts).await
    }

    async fn enable_persistence(&self) -> Result<()> {
        self.tools.enable_persistence().await
    }

    async fn query_status(&self) -> Result<GpuStatus> {
        // The performance state is only reported by the tools
        let mut status = self.tools.query_status().await?;

        let device = self.get()?;
        if let Ok(power) = device.power_usage() {
            status.power_watts = Some(power as f64 / 1000.);
        }
        if let Ok(utilization) = device.utilization_rates() {
            status.utilization = Some(utilization.gpu);
        }

        Ok(status)
    }

    async fn supported_clocks(&self) -> Result<Vec<u32>> {
        self.tools.supported_clocks().await
    }
}
