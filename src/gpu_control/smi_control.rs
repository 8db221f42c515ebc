use std::{fmt, io::ErrorKind};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, trace, warn};

use crate::{
    errors::{Result, UndervoltError},
    gpu_control::{GpuControl, GpuStatus, clamp_power_limit},
};

const NVIDIA_SMI: &str = "nvidia-smi";
const NVIDIA_SETTINGS: &str = "nvidia-settings";

const CORE_OFFSET_ATTR: &str = "GPUGraphicsClockOffsetAllPerformanceLevels";
const MEM_OFFSET_ATTR: &str = "GPUMemoryTransferRateOffsetAllPerformanceLevels";

// Output fragments of nvidia-settings meaning the offset
// attributes can't be written on this system
const OFFSET_UNSUPPORTED_HINTS: [&str; 5] = [
    "not available",
    "read-only",
    "unknown attribute",
    "unable to",
    "failed to connect",
];

// GPU control through the nvidia-smi and nvidia-settings tools
#[derive(Debug, Clone)]
pub struct SmiControl {
    index: u32,
    // X display used by nvidia-settings
    display: Option<String>,
    // Log write commands instead of running them
    dry_run: bool,
}

// Failure of an external command
#[derive(Debug)]
enum CommandError {
    // The tool is not installed
    NotFound,
    Failed(String),
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "command not found"),
            Self::Failed(reason) => write!(f, "{reason}"),
        }
    }
}

impl SmiControl {
    pub fn new(index: u32, display: Option<String>, dry_run: bool) -> Self {
        Self {
            index,
            display,
            dry_run,
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    // Apply an already validated power limit
    pub async fn apply_power_limit(&self, watts: u32) -> Result<()> {
        self.smi_write(&["-pl".to_string(), watts.to_string()])
            .await
    }

    // Query one CSV line of GPU fields
    async fn query_gpu(&self, fields: &str) -> Result<Vec<String>> {
        let args = [
            format!("--query-gpu={fields}"),
            "--format=csv,noheader,nounits".to_string(),
        ];

        let out = self.smi(&args).await.map_err(|e| {
            UndervoltError::hardware(format!("Query of \"{fields}\" failed: {e}"))
        })?;

        let line = out.lines().next().ok_or_else(|| {
            UndervoltError::hardware(format!("Empty answer for \"{fields}\""))
        })?;

        Ok(line.split(',').map(|p| p.trim().to_string()).collect())
    }

    async fn smi(&self, args: &[String]) -> std::result::Result<String, CommandError> {
        let mut full_args = vec!["-i".to_string(), self.index.to_string()];
        full_args.extend_from_slice(args);

        run_command(NVIDIA_SMI, &full_args, None).await
    }

    // Run a nvidia-smi command that changes the GPU state
    async fn smi_write(&self, args: &[String]) -> Result<()> {
        if self.dry_run {
            info!("[dry-run] {NVIDIA_SMI} -i {} {}", self.index, args.join(" "));
            return Ok(());
        }

        self.smi(args).await.map(|_| ()).map_err(|e| {
            UndervoltError::apply(format!(
                "{NVIDIA_SMI} {} failed: {e}",
                args.join(" ")
            ))
        })
    }
}

#[async_trait]
impl GpuControl for SmiControl {
    async fn read_clock(&self) -> Result<u32> {
        let fields = self.query_gpu("clocks.gr").await?;

        fields
            .first()
            .and_then(|f| parse_number(f))
            .map(|c| c as u32)
            .ok_or_else(|| {
                UndervoltError::hardware(format!(
                    "Invalid graphics clock: {fields:?}"
                ))
            })
    }

    async fn read_temperature(&self) -> Result<Option<u32>> {
        let fields = self.query_gpu("temperature.gpu").await?;

        Ok(fields.first().and_then(|f| parse_number(f)).map(|t| t as u32))
    }

    async fn set_locked_clocks(&self, min_mhz: u32, max_mhz: u32) -> Result<()> {
        trace!("Locking graphics clock to [{min_mhz}, {max_mhz}] MHz");

        self.smi_write(&["-lgc".to_string(), format!("{min_mhz},{max_mhz}")])
            .await
    }

    async fn set_offsets(&self, core_mhz: i32, memory_mhz: i32) -> Result<()> {
        let x_display = self.display.as_deref().ok_or_else(|| {
            UndervoltError::offset("No X display configured for nvidia-settings")
        })?;

        let args = vec![
            "-a".to_string(),
            format!("[gpu:{}]/{CORE_OFFSET_ATTR}={core_mhz}", self.index),
            "-a".to_string(),
            format!("[gpu:{}]/{MEM_OFFSET_ATTR}={memory_mhz}", self.index),
        ];

        if self.dry_run {
            info!("[dry-run] DISPLAY={x_display} {NVIDIA_SETTINGS} {}", args.join(" "));
            return Ok(());
        }

        let out = run_command(NVIDIA_SETTINGS, &args, Some(("DISPLAY", x_display)))
            .await;

        match out {
            Ok(text) => match classify_settings_output(&text) {
                Some(err) => Err(err),
                None => Ok(()),
            },
            Err(CommandError::NotFound) => Err(UndervoltError::offset(format!(
                "{NVIDIA_SETTINGS} is not installed"
            ))),
            Err(CommandError::Failed(reason)) => {
                Err(classify_settings_output(&reason).unwrap_or_else(|| {
                    UndervoltError::apply(format!(
                        "{NVIDIA_SETTINGS} failed: {reason}"
                    ))
                }))
            }
        }
    }

    async fn set_power_limit(&self, watts: u32) -> Result<()> {
        // Best effort range check, apply as requested if it fails
        let watts = match self
            .query_gpu("power.min_limit,power.max_limit")
            .await
        {
            Ok(fields) => match (
                fields.first().and_then(|f| parse_number(f)),
                fields.get(1).and_then(|f| parse_number(f)),
            ) {
                (Some(min), Some(max)) => {
                    let clamped = clamp_power_limit(watts, min, max);
                    if clamped != watts {
                        warn!(
                            "Requested power limit {watts}W not in [{min}, {max}]W range, clamping to {clamped}W"
                        );
                    }
                    clamped
                }
                _ => watts,
            },
            Err(err) => {
                debug!("Power limit range unavailable: {err}");
                watts
            }
        };

        self.apply_power_limit(watts).await
    }

    async fn enable_persistence(&self) -> Result<()> {
        self.smi_write(&["-pm".to_string(), "1".to_string()]).await
    }

    async fn query_status(&self) -> Result<GpuStatus> {
        let fields = self
            .query_gpu("clocks.gr,temperature.gpu,power.draw,utilization.gpu,pstate")
            .await?;

        parse_status(&fields)
    }

    async fn supported_clocks(&self) -> Result<Vec<u32>> {
        let args = [
            "--query-supported-clocks=gr".to_string(),
            "--format=csv,noheader,nounits".to_string(),
        ];

        let out = self.smi(&args).await.map_err(|e| {
            UndervoltError::hardware(format!("Supported clocks query failed: {e}"))
        })?;

        Ok(parse_clock_list(&out))
    }
}

// Spawn a command and return its standard output
async fn run_command(
    program: &str,
    args: &[String],
    env: Option<(&str, &str)>,
) -> std::result::Result<String, CommandError> {
    let mut cmd = Command::new(program);
    cmd.args(args);

    if let Some((key, value)) = env {
        cmd.env(key, value);
    }

    trace!("Running: {program} {}", args.join(" "));

    let output = cmd.output().await.map_err(|e| match e.kind() {
        ErrorKind::NotFound => CommandError::NotFound,
        _ => CommandError::Failed(e.to_string()),
    })?;

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

    if output.status.success() {
        // nvidia-settings reports most failures on stderr with a zero status
        if stderr.contains("ERROR") {
            return Err(CommandError::Failed(stderr));
        }

        Ok(stdout)
    } else if stderr.is_empty() {
        Err(CommandError::Failed(format!("{} ({stdout})", output.status)))
    } else {
        Err(CommandError::Failed(stderr))
    }
}

// Return an offset error if the nvidia-settings output
// shows the attributes can't be written
fn classify_settings_output(text: &str) -> Option<UndervoltError> {
    let lower = text.to_lowercase();

    if OFFSET_UNSUPPORTED_HINTS.iter().any(|hint| lower.contains(hint)) {
        return Some(UndervoltError::offset(text.trim().to_string()));
    }

    None
}

// Parse a numeric nvidia-smi field, None for "[N/A]" and similar
fn parse_number(field: &str) -> Option<f64> {
    let value: f64 = field.trim().parse().ok()?;

    value.is_finite().then_some(value)
}

fn parse_status(fields: &[String]) -> Result<GpuStatus> {
    let clock_mhz = fields
        .first()
        .and_then(|f| parse_number(f))
        .ok_or_else(|| {
            UndervoltError::hardware(format!("Invalid status answer: {fields:?}"))
        })? as u32;

    let field = |i: usize| fields.get(i).and_then(|f| parse_number(f));

    Ok(GpuStatus {
        clock_mhz,
        temperature_c: field(1).map(|t| t as u32),
        power_watts: field(2),
        utilization: field(3).map(|u| u as u32),
        pstate: fields
            .get(4)
            .filter(|p| !p.is_empty() && !p.contains("N/A"))
            .cloned(),
    })
}

// Parse the supported clocks list, ignoring malformed lines
fn parse_clock_list(out: &str) -> Vec<u32> {
    let mut clocks: Vec<u32> = out
        .lines()
        .filter_map(|l| parse_number(l))
        .map(|c| c as u32)
        .collect();

    clocks.sort_unstable();
    clocks.dedup();

    clocks
}
