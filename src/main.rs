use anyhow::{Context, Result};
use gpu_undervolt::{
    arg_parser::{ArgsOptions, RunMode},
    daemon::Daemon,
    gpu_control::{GpuControl, nvml_control::NvmlControl, smi_control::SmiControl},
    logger, oneshot,
    policy_config::PolicyConfig,
    preflight,
};
use tokio::{
    select,
    signal::unix::{SignalKind, signal},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse the command line arguments
    let args_options = ArgsOptions::parse();

    logger::init_logging(args_options.quiet);

    info!("gpu-undervolt v{}", env!("CARGO_PKG_VERSION"));

    // Invalid policies are fatal at startup only
    let policy = PolicyConfig::from_args(&args_options)?;

    preflight::check(&policy, args_options.dry_run)?;

    let gpu = open_gpu(&policy, args_options.dry_run);

    // This token and tracker will be used to handle graceful shutdown
    let tracker = TaskTracker::new();
    let token = CancellationToken::new();

    // Cancel the token on SIGINT or SIGTERM
    {
        let mut sigint = signal(SignalKind::interrupt())
            .context("Failed to install SIGINT handler")?;
        let mut sigterm = signal(SignalKind::terminate())
            .context("Failed to install SIGTERM handler")?;
        let token = token.clone();

        tracker.spawn(async move {
            select! {
                _ = sigint.recv() => info!("Caught SIGINT, reverting..."),
                _ = sigterm.recv() => info!("Caught SIGTERM, reverting..."),
                _ = token.cancelled() => return,
            }

            token.cancel();
        });
    }

    let result = match args_options.mode {
        RunMode::Daemon => {
            let token = token.clone();

            tracker
                .spawn(async move {
                    let mut daemon = Daemon::new(policy, gpu);
                    daemon.run(token).await
                })
                .await
                .context("Daemon task panicked")?
                .context("Daemon failed")
        }
        RunMode::Oneshot => {
            oneshot::run(policy, gpu, args_options.verify, token.clone())
                .await
                .map(|_| ())
                .context("One-shot apply failed")
        }
    };

    // Cancel the token to communicate the program
    // termination to the running tasks
    token.cancel();

    // Wait for the tasks to finish
    tracker.close();
    tracker.wait().await;

    result
}

// Prefer NVML for sensor reads, fall back to parsing the tools output
fn open_gpu(policy: &PolicyConfig, dry_run: bool) -> Box<dyn GpuControl> {
    let tools = SmiControl::new(policy.gpu_index, policy.display.clone(), dry_run);

    match NvmlControl::try_new(tools.clone()) {
        Ok(control) => {
            info!("NVML successfully initialized");
            Box::new(control)
        }
        Err(err) => {
            warn!("{err}, falling back to nvidia-smi queries");
            Box::new(tools)
        }
    }
}
