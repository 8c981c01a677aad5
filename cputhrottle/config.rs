use std::{
  fs,
  path::Path,
  time::Duration,
};

use anyhow::{
  Context,
  bail,
};
use serde::{
  Deserialize,
  Serialize,
};

/// Governor names to prefer, before falling back.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields, default, rename_all = "kebab-case")]
pub struct GovernorPreference {
  /// Used while the CPU is at or below the critical temperature.
  pub high: String,
  /// Used while the CPU is throttled.
  pub low:  String,
}

impl Default for GovernorPreference {
  fn default() -> Self {
    Self {
      high: "ondemand".to_owned(),
      low:  "powersave".to_owned(),
    }
  }
}

/// External cpufrequtils programs.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields, default, rename_all = "kebab-case")]
pub struct Commands {
  pub info: String,
  pub set:  String,
}

impl Default for Commands {
  fn default() -> Self {
    Self {
      info: "cpufreq-info".to_owned(),
      set:  "cpufreq-set".to_owned(),
    }
  }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields, default, rename_all = "kebab-case")]
pub struct DaemonConfig {
  /// Seconds to sleep after throttling.
  pub relax_time:        u64,
  /// Critical temperature in degrees celsius.
  pub crit_temp:         i64,
  /// Seconds to sleep after a normal iteration.
  pub poll_interval:     u64,
  pub max_read_failures: u32,

  pub governors: GovernorPreference,
  pub commands:  Commands,
}

impl Default for DaemonConfig {
  fn default() -> Self {
    Self {
      relax_time:        30,
      crit_temp:         64,
      poll_interval:     3,
      max_read_failures: 5,

      governors: GovernorPreference::default(),
      commands:  Commands::default(),
    }
  }
}

/// Values given on the command line, taking precedence over the config.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Overrides {
  pub relax_time: Option<u64>,
  pub crit_temp:  Option<i64>,
  pub debug:      bool,
}

/// Timing and threshold settings of the control loop, fixed at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeConfig {
  pub relax_time:        Duration,
  pub poll_interval:     Duration,
  /// Critical temperature in millidegrees celsius.
  pub crit_temp:         i64,
  pub max_read_failures: u32,
  pub debug:             bool,
}

impl DaemonConfig {
  pub const DEFAULT: &'static str = include_str!("config.toml");

  pub fn load_from(path: Option<&Path>) -> anyhow::Result<Self> {
    let contents = if let Some(path) = path {
      log::info!("loading config from '{path}'", path = path.display());

      &fs::read_to_string(path).with_context(|| {
        format!("failed to read config from '{path}'", path = path.display())
      })?
    } else {
      log::info!("loading default config");

      Self::DEFAULT
    };

    let config: Self = toml::from_str(contents).with_context(|| {
      path.map_or(
        "failed to parse builtin default config, this is a bug".to_owned(),
        |p| format!("failed to parse file at '{path}'", path = p.display()),
      )
    })?;

    config.validate()?;

    log::debug!("loaded config: {config:#?}");

    Ok(config)
  }

  pub fn validate(&self) -> anyhow::Result<()> {
    if !(1..1000).contains(&self.crit_temp) {
      bail!(
        "critical temperature must be between 1 and 999 degrees celsius, got \
         {}",
        self.crit_temp,
      );
    }

    if self.poll_interval == 0 {
      bail!("poll interval must be at least one second");
    }

    if self.relax_time == 0 {
      bail!("relax time must be at least one second");
    }

    if self.max_read_failures == 0 {
      bail!("max read failures must be at least 1");
    }

    for (key, value) in [
      ("governors.high", &self.governors.high),
      ("governors.low", &self.governors.low),
      ("commands.info", &self.commands.info),
      ("commands.set", &self.commands.set),
    ] {
      if value.trim().is_empty() {
        bail!("'{key}' must not be empty");
      }
    }

    Ok(())
  }

  /// Apply command line overrides and convert to loop units.
  pub fn resolve(&self, overrides: Overrides) -> anyhow::Result<RuntimeConfig> {
    let config = Self {
      relax_time: overrides.relax_time.unwrap_or(self.relax_time),
      crit_temp: overrides.crit_temp.unwrap_or(self.crit_temp),
      ..self.clone()
    };

    config.validate().context("invalid command line override")?;

    Ok(RuntimeConfig {
      relax_time:        Duration::from_secs(config.relax_time),
      poll_interval:     Duration::from_secs(config.poll_interval),
      crit_temp:         config.crit_temp * 1000,
      max_read_failures: config.max_read_failures,
      debug:             overrides.debug,
    })
  }
}
