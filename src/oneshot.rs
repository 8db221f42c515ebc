use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    daemon::{Daemon, ramp::RampOutcome},
    errors::Result,
    gpu_control::{GpuControl, GpuStatus},
    policy_config::PolicyConfig,
};

// Delay before reading back the GPU status
const VERIFY_DELAY: Duration = Duration::from_millis(500);

// Apply the undervolt profile once without any hysteresis.
// Settings persist until reboot or until a daemon reverts them.
// Returns the GPU status when `verify` is set
pub async fn run(
    policy: PolicyConfig,
    gpu: Box<dyn GpuControl>,
    verify: bool,
    token: CancellationToken,
) -> Result<Option<GpuStatus>> {
    info!("One-shot: Starting");

    let mut daemon = Daemon::new(policy, gpu);
    daemon.prepare().await;

    if daemon.apply_active(&token).await? == RampOutcome::Cancelled {
        warn!(
            "One-shot: interrupted, max clock left at {} MHz",
            daemon.state().locked_clock_mhz
        );
        return Ok(None);
    }

    let status = if verify {
        sleep(VERIFY_DELAY).await;

        let status = daemon.gpu().query_status().await?;
        info!("One-shot: Now {status}");

        Some(status)
    } else {
        None
    };

    info!("One-shot: Done, settings persist until reboot or manual revert");

    Ok(status)
}
