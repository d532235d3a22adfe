//! System-wide configuration.
//!
//! A [`Config`] is fixed at boot. It is either assembled with
//! [`SystemConfigurationBuilder`] or parsed from a kernel command line such as
//!
//! ```text
//! -mlfqs -ul=16 -q args-many a b c
//! ```
//!
//! where the leading options configure the kernel and the remaining words are
//! the command line of the initial task.

use crate::KernelError;
use keel_machine::MachineConfig;
use log::LevelFilter;

/// Default number of ticks a thread may run before it is preempted.
pub const TIME_SLICE: u64 = 4;

/// Scheduling policy, selected at boot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedulingPolicy {
    /// Strict priority scheduling with priority donation.
    Priority,
    /// Multi-level feedback queue scheduling.
    Mlfqs,
}

/// Boot-time configuration of a kernel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub policy: SchedulingPolicy,
    /// Ticks per time slice.
    pub time_slice: u64,
    pub machine: MachineConfig,
    /// Maximum level of diagnostics emitted through `log`.
    pub log_level: LevelFilter,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            policy: SchedulingPolicy::Priority,
            time_slice: TIME_SLICE,
            machine: MachineConfig::default(),
            log_level: LevelFilter::Info,
        }
    }
}

impl Config {
    /// Parses a kernel command line.
    ///
    /// Returns the configuration and the command line of the initial task.
    pub fn parse(cmdline: &str) -> Result<(Config, String), KernelError> {
        let mut builder = SystemConfigurationBuilder::new();
        let mut words = cmdline.split_whitespace().peekable();
        while let Some(option) = words.next_if(|w| w.starts_with('-')) {
            let (key, value) = match option.split_once('=') {
                Some((key, value)) => (key, Some(value)),
                None => (option, None),
            };
            builder = match (key, value) {
                ("-mlfqs", None) => builder.set_scheduler(SchedulingPolicy::Mlfqs),
                ("-q", None) => builder.quiet(true),
                ("-ul", Some(v)) => builder.user_frames(parse_number(v)?),
                ("-kl", Some(v)) => builder.kernel_frames(parse_number(v)?),
                ("-swap", Some(v)) => builder.swap_sectors(parse_number(v)?),
                ("-ts", Some(v)) => builder.time_slice(parse_number(v)? as u64),
                _ => {
                    log::warn!("unknown kernel option `{option}`");
                    return Err(KernelError::InvalidArgument);
                }
            };
        }
        let task = words.collect::<Vec<_>>().join(" ");
        Ok((builder.build(), task))
    }
}

fn parse_number(s: &str) -> Result<usize, KernelError> {
    s.parse().map_err(|_| KernelError::InvalidArgument)
}

/// The [`SystemConfigurationBuilder`] struct provides an interface for
/// configuring various system-wide settings before booting.
pub struct SystemConfigurationBuilder {
    config: Config,
}

impl Default for SystemConfigurationBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemConfigurationBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    /// Sets the system-wide scheduling policy.
    pub fn set_scheduler(mut self, policy: SchedulingPolicy) -> Self {
        self.config.policy = policy;
        self
    }

    pub fn time_slice(mut self, ticks: u64) -> Self {
        self.config.time_slice = ticks.max(1);
        self
    }

    /// Limits the user pool to `frames` frames.
    pub fn user_frames(mut self, frames: usize) -> Self {
        self.config.machine.user_frames = frames;
        self
    }

    pub fn kernel_frames(mut self, frames: usize) -> Self {
        self.config.machine.kernel_frames = frames;
        self
    }

    pub fn swap_sectors(mut self, sectors: usize) -> Self {
        self.config.machine.swap_sectors = sectors;
        self
    }

    /// Only emit warnings and errors.
    pub fn quiet(mut self, quiet: bool) -> Self {
        self.config.log_level = if quiet {
            LevelFilter::Warn
        } else {
            LevelFilter::Info
        };
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
