use std::{fmt, path::PathBuf, str::FromStr};

use argparse::{ArgumentParser, Print, Store, StoreOption, StoreTrue};

// How the settings are applied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunMode {
    // Apply the undervolt profile once and exit
    Oneshot,
    // Enable and disable the profile following the GPU load
    #[default]
    Daemon,
}

impl FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "oneshot" => Ok(Self::Oneshot),
            "daemon" => Ok(Self::Daemon),
            other => Err(format!("Unknown mode \"{other}\"")),
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Oneshot => write!(f, "oneshot"),
            Self::Daemon => write!(f, "daemon"),
        }
    }
}

// Raw command line options.
// Values left as None fall back to the profile file or the defaults
#[derive(Debug, Default)]
pub struct ArgsOptions {
    pub config_file_path: Option<PathBuf>,
    pub mode: RunMode,

    pub index: Option<u32>,
    pub display: Option<String>,

    pub min_clock: Option<u32>,
    pub target_clock: Option<u32>,
    pub transition_clock: Option<u32>,

    pub core_offset: Option<i32>,
    pub memory_offset: Option<i32>,
    pub use_offsets: bool,

    pub power_limit: Option<u32>,
    pub temp_limit: Option<u32>,
    pub thermal_margin: Option<u32>,

    pub poll: Option<f64>,
    pub on_hold: Option<f64>,
    pub off_hold: Option<f64>,

    pub ramp: bool,
    pub ramp_step: Option<u32>,
    pub ramp_sleep: Option<f64>,

    pub dry_run: bool,
    pub verify: bool,
    pub quiet: bool,
}

impl ArgsOptions {
    // Parse the process arguments, exit on error or on --help/--version
    pub fn parse() -> Self {
        let mut options = ArgsOptions::default();

        {
            let parser = build_parser(&mut options);
            parser.parse_args_or_exit();
        }

        options
    }

    // Parse the given arguments, the program name is added automatically.
    // Returns the argparse exit code on failure
    pub fn parse_from(args: &[&str]) -> Result<Self, i32> {
        let mut options = ArgsOptions::default();

        {
            let parser = build_parser(&mut options);

            let mut full_args = vec![env!("CARGO_PKG_NAME").to_string()];
            full_args.extend(args.iter().map(|a| a.to_string()));

            parser.parse(
                full_args,
                &mut std::io::sink(),
                &mut std::io::sink(),
            )?;
        }

        Ok(options)
    }
}

fn build_parser(options: &mut ArgsOptions) -> ArgumentParser<'_> {
    let mut parser = ArgumentParser::new();
    parser.set_description(
        "NVIDIA GPU undervolt / efficiency tool (one-shot or daemon)",
    );

    // Configuration file path
    parser.refer(&mut options.config_file_path).add_option(
        &["-c", "--config"],
        StoreOption,
        "JSON profile file, command line values take precedence",
    );

    parser.refer(&mut options.mode).add_option(
        &["--mode"],
        Store,
        "Run as \"oneshot\" or \"daemon\" (default: daemon)",
    );

    // GPU selection
    parser.refer(&mut options.index).add_option(
        &["--index"],
        StoreOption,
        "GPU index (default: 0)",
    );
    parser.refer(&mut options.display).add_option(
        &["--display"],
        StoreOption,
        "X display for nvidia-settings (e.g. :0), required for offsets",
    );

    // Clocks
    parser.refer(&mut options.min_clock).add_option(
        &["--min-clock"],
        StoreOption,
        "Locked min graphics clock MHz (default: 210)",
    );
    parser.refer(&mut options.target_clock).add_option(
        &["--target-clock"],
        StoreOption,
        "Locked max graphics clock MHz when active",
    );
    parser.refer(&mut options.transition_clock).add_option(
        &["--transition-clock"],
        StoreOption,
        "Daemon: enable when clock >= this (default: target - 300)",
    );

    // Offsets
    parser.refer(&mut options.core_offset).add_option(
        &["--core-offset"],
        StoreOption,
        "Core clock offset MHz (requires nvidia-settings + Coolbits)",
    );
    parser.refer(&mut options.memory_offset).add_option(
        &["--memory-offset"],
        StoreOption,
        "Memory transfer rate offset MHz (requires nvidia-settings + Coolbits)",
    );
    parser.refer(&mut options.use_offsets).add_option(
        &["--use-offsets"],
        StoreTrue,
        "Apply core/memory offsets through nvidia-settings",
    );

    // Power and thermal limits
    parser.refer(&mut options.power_limit).add_option(
        &["--power-limit"],
        StoreOption,
        "Optional power limit in W",
    );
    parser.refer(&mut options.temp_limit).add_option(
        &["--temp-limit"],
        StoreOption,
        "Daemon: thermal guard limit in °C",
    );
    parser.refer(&mut options.thermal_margin).add_option(
        &["--thermal-margin"],
        StoreOption,
        "Daemon: MHz removed from the target while over the temperature limit (default: ramp step)",
    );

    // Hysteresis timings
    parser.refer(&mut options.poll).add_option(
        &["--poll"],
        StoreOption,
        "Daemon: poll interval seconds (default: 0.5)",
    );
    parser.refer(&mut options.on_hold).add_option(
        &["--on-hold"],
        StoreOption,
        "Daemon: seconds above threshold before enabling (default: 1.0)",
    );
    parser.refer(&mut options.off_hold).add_option(
        &["--off-hold"],
        StoreOption,
        "Daemon: seconds below threshold before disabling (default: 2.0)",
    );

    // Ramp
    parser.refer(&mut options.ramp).add_option(
        &["--ramp"],
        StoreTrue,
        "Ramp the max clock in steps instead of jumping",
    );
    parser.refer(&mut options.ramp_step).add_option(
        &["--ramp-step"],
        StoreOption,
        "Ramp step MHz (default: 15)",
    );
    parser.refer(&mut options.ramp_sleep).add_option(
        &["--ramp-sleep"],
        StoreOption,
        "Sleep between ramp steps in seconds (default: 0.2)",
    );

    // Behavior
    parser.refer(&mut options.dry_run).add_option(
        &["--dry-run"],
        StoreTrue,
        "Log commands only, don't apply changes",
    );
    parser.refer(&mut options.verify).add_option(
        &["--verify"],
        StoreTrue,
        "One-shot: log the GPU status after applying",
    );
    parser.refer(&mut options.quiet).add_option(
        &["-q", "--quiet"],
        StoreTrue,
        "Only log warnings and errors",
    );

    // Show version
    parser.add_option(
        &["-V", "--version"],
        Print(env!("CARGO_PKG_VERSION").to_string()),
        "Show the program version",
    );

    parser
}
