use std::{fs::File, io::BufReader, path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    arg_parser::ArgsOptions,
    errors::{Result, UndervoltError},
};

const DEFAULT_MIN_CLOCK_MHZ: u32 = 210;
const DEFAULT_TRANSITION_GAP_MHZ: u32 = 300;
const DEFAULT_POLL_SECS: f64 = 0.5;
const DEFAULT_ON_HOLD_SECS: f64 = 1.0;
const DEFAULT_OFF_HOLD_SECS: f64 = 2.0;
const DEFAULT_RAMP_STEP_MHZ: u32 = 15;
const DEFAULT_RAMP_SLEEP_SECS: f64 = 0.2;

// Profile as written in the JSON configuration file.
// Every field is optional, missing values fall back to the defaults
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProfileConfig {
    pub index: Option<u32>,
    pub display: Option<String>,

    pub min_clock: Option<u32>,
    pub target_clock: Option<u32>,
    pub transition_clock: Option<u32>,

    pub core_offset: Option<i32>,
    pub memory_offset: Option<i32>,
    pub use_offsets: Option<bool>,

    pub power_limit: Option<u32>,
    pub temp_limit: Option<u32>,
    pub thermal_margin: Option<u32>,

    pub poll: Option<f64>,
    pub on_hold: Option<f64>,
    pub off_hold: Option<f64>,

    pub ramp: Option<bool>,
    pub ramp_step: Option<u32>,
    pub ramp_sleep: Option<f64>,
}

impl ProfileConfig {
    // Read a profile from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        debug!("Parsing profile file at: {:?}", path);

        let file = File::open(path).map_err(|e| {
            UndervoltError::config(format!(
                "Failed to open profile file {}: {e}",
                path.display()
            ))
        })?;

        serde_json::from_reader(BufReader::new(file)).map_err(|e| {
            UndervoltError::config(format!(
                "Failed to parse profile file {}: {e}",
                path.display()
            ))
        })
    }

    // Overlay the command line options on top of this profile
    pub fn merge_args(mut self, args: &ArgsOptions) -> Self {
        fn overlay<T: Clone>(base: &mut Option<T>, value: &Option<T>) {
            if value.is_some() {
                *base = value.clone();
            }
        }

        overlay(&mut self.index, &args.index);
        overlay(&mut self.display, &args.display);
        overlay(&mut self.min_clock, &args.min_clock);
        overlay(&mut self.target_clock, &args.target_clock);
        overlay(&mut self.transition_clock, &args.transition_clock);
        overlay(&mut self.core_offset, &args.core_offset);
        overlay(&mut self.memory_offset, &args.memory_offset);
        overlay(&mut self.power_limit, &args.power_limit);
        overlay(&mut self.temp_limit, &args.temp_limit);
        overlay(&mut self.thermal_margin, &args.thermal_margin);
        overlay(&mut self.poll, &args.poll);
        overlay(&mut self.on_hold, &args.on_hold);
        overlay(&mut self.off_hold, &args.off_hold);
        overlay(&mut self.ramp_step, &args.ramp_step);
        overlay(&mut self.ramp_sleep, &args.ramp_sleep);

        // Flags can only switch a feature on
        if args.use_offsets {
            self.use_offsets = Some(true);
        }
        if args.ramp {
            self.ramp = Some(true);
        }

        self
    }
}

// Fully resolved, immutable undervolt policy
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyConfig {
    pub gpu_index: u32,
    pub display: Option<String>,

    pub target_clock_mhz: u32,
    pub min_clock_mhz: u32,
    // Load threshold of the daemon
    pub transition_clock_mhz: u32,

    pub core_offset_mhz: i32,
    pub memory_offset_mhz: i32,
    pub use_offsets: bool,

    pub power_limit_watts: Option<u32>,
    pub temp_limit_c: Option<u32>,
    pub thermal_margin_mhz: u32,

    pub poll_interval: Duration,
    pub on_hold: Duration,
    pub off_hold: Duration,

    pub ramp_enabled: bool,
    pub ramp_step_mhz: u32,
    pub ramp_sleep: Duration,
}

impl PolicyConfig {
    // Build the policy from the command line, reading the
    // profile file first when one was given
    pub fn from_args(args: &ArgsOptions) -> Result<Self> {
        let profile = match &args.config_file_path {
            Some(path) => ProfileConfig::load(path)?,
            None => ProfileConfig::default(),
        };

        Self::resolve(&profile.merge_args(args))
    }

    // Apply the defaults and check every invariant of the policy
    pub fn resolve(profile: &ProfileConfig) -> Result<Self> {
        let target_clock_mhz = profile.target_clock.ok_or_else(|| {
            UndervoltError::config("A target clock is required")
        })?;
        let min_clock_mhz = profile.min_clock.unwrap_or(DEFAULT_MIN_CLOCK_MHZ);

        if target_clock_mhz <= min_clock_mhz {
            return Err(UndervoltError::config(format!(
                "Target clock {target_clock_mhz} MHz must be above the min clock {min_clock_mhz} MHz"
            )));
        }

        let transition_clock_mhz = match profile.transition_clock {
            Some(clock) => clock,
            None => target_clock_mhz.saturating_sub(DEFAULT_TRANSITION_GAP_MHZ),
        };

        if transition_clock_mhz <= min_clock_mhz {
            return Err(UndervoltError::config(format!(
                "Transition clock {transition_clock_mhz} MHz must be above the min clock {min_clock_mhz} MHz"
            )));
        }

        let poll_interval =
            seconds("poll", profile.poll.unwrap_or(DEFAULT_POLL_SECS))?;
        if poll_interval.is_zero() {
            return Err(UndervoltError::config(
                "Poll interval must be greater than zero",
            ));
        }

        let on_hold =
            seconds("on-hold", profile.on_hold.unwrap_or(DEFAULT_ON_HOLD_SECS))?;
        let off_hold = seconds(
            "off-hold",
            profile.off_hold.unwrap_or(DEFAULT_OFF_HOLD_SECS),
        )?;
        let ramp_sleep = seconds(
            "ramp-sleep",
            profile.ramp_sleep.unwrap_or(DEFAULT_RAMP_SLEEP_SECS),
        )?;

        let ramp_step_mhz = profile.ramp_step.unwrap_or(DEFAULT_RAMP_STEP_MHZ);
        if ramp_step_mhz == 0 {
            return Err(UndervoltError::config(
                "Ramp step must be greater than zero",
            ));
        }

        let thermal_margin_mhz = profile.thermal_margin.unwrap_or(ramp_step_mhz);
        if thermal_margin_mhz == 0 {
            return Err(UndervoltError::config(
                "Thermal margin must be greater than zero",
            ));
        }

        if profile.power_limit == Some(0) {
            return Err(UndervoltError::config(
                "Power limit must be greater than zero",
            ));
        }

        let use_offsets = profile.use_offsets.unwrap_or(false);
        if use_offsets && profile.display.is_none() {
            return Err(UndervoltError::config(
                "A display (e.g. :0) is required when using offsets",
            ));
        }

        Ok(Self {
            gpu_index: profile.index.unwrap_or(0),
            display: profile.display.clone(),

            target_clock_mhz,
            min_clock_mhz,
            transition_clock_mhz,

            core_offset_mhz: profile.core_offset.unwrap_or(0),
            memory_offset_mhz: profile.memory_offset.unwrap_or(0),
            use_offsets,

            power_limit_watts: profile.power_limit,
            temp_limit_c: profile.temp_limit,
            thermal_margin_mhz,

            poll_interval,
            on_hold,
            off_hold,

            ramp_enabled: profile.ramp.unwrap_or(false),
            ramp_step_mhz,
            ramp_sleep,
        })
    }

    // Max clock used while the thermal guard is engaged
    pub fn reduced_target_mhz(&self) -> u32 {
        self.target_clock_mhz
            .saturating_sub(self.thermal_margin_mhz)
            .max(self.min_clock_mhz)
    }

    // Offsets written when the profile is enabled
    pub fn offsets(&self) -> (i32, i32) {
        (self.core_offset_mhz, self.memory_offset_mhz)
    }
}

// Convert a user supplied amount of seconds into a duration
fn seconds(name: &str, value: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(value).map_err(|_| {
        UndervoltError::config(format!(
            "--{name} must be a finite, non negative number of seconds (got {value})"
        ))
    })
}
