use std::{
  collections::BTreeSet,
  fmt,
  process::Command,
};

use anyhow::{
  Context,
  bail,
};
use yansi::Paint as _;

use crate::{
  config,
  fs,
  hardware::HardwareProfile,
};

const CPUINFO_MIN_FREQ: &str =
  "/sys/devices/system/cpu/cpu0/cpufreq/cpuinfo_min_freq";
const CPUINFO_MAX_FREQ: &str =
  "/sys/devices/system/cpu/cpu0/cpufreq/cpuinfo_max_freq";
const SCALING_GOVERNOR: &str =
  "/sys/devices/system/cpu/cpu0/cpufreq/scaling_governor";

/// Governor and frequency control of the host.
///
/// Every method maps to one external query or change, so tests can
/// substitute a recording fake.
pub trait CpuFreq {
  /// Hardware frequency limits as `(minimum, maximum)` in kHz.
  fn frequency_limits(&self) -> anyhow::Result<(u64, u64)>;

  /// The governor of the current policy, if it can be determined.
  fn current_governor(&self) -> anyhow::Result<Option<String>>;

  fn available_governors(&self) -> anyhow::Result<GovernorSet>;

  /// Set the governor of the default CPU selection.
  ///
  /// For cpufrequtils that is cpu0 and the CPUs sharing its policy, not
  /// every core.
  fn set_governor(&self, governor: &str) -> anyhow::Result<()>;

  /// Cap the frequency of a single core.
  fn set_max_frequency(&self, core: u32, frequency_khz: u64)
  -> anyhow::Result<()>;
}

/// [`CpuFreq`] backed by the cpufrequtils programs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cpufrequtils {
  info: String,
  set:  String,
}

impl Cpufrequtils {
  pub fn new(commands: &config::Commands) -> Self {
    Self {
      info: commands.info.clone(),
      set:  commands.set.clone(),
    }
  }

  /// `cpufreq-set` arguments for a governor change. No `-c` is passed, so
  /// the change lands on cpu0's policy.
  fn governor_args(governor: &str) -> [&str; 2] {
    ["-g", governor]
  }

  fn run(program: &str, args: &[&str]) -> anyhow::Result<String> {
    log::debug!("running '{program} {args}'", args = args.join(" "));

    let output = Command::new(program).args(args).output().with_context(|| {
      format!("failed to run '{program}', is cpufrequtils installed?")
    })?;

    if !output.status.success() {
      let stderr = String::from_utf8_lossy(&output.stderr);

      bail!(
        "'{program} {args}' exited with {status}: {stderr}",
        args = args.join(" "),
        status = output.status,
        stderr = stderr.trim(),
      );
    }

    String::from_utf8(output.stdout)
      .with_context(|| format!("'{program}' printed invalid UTF-8"))
  }
}

impl CpuFreq for Cpufrequtils {
  fn frequency_limits(&self) -> anyhow::Result<(u64, u64)> {
    let output = Self::run(&self.info, &["-l"])?;

    parse_frequency_limits(&output)
  }

  fn current_governor(&self) -> anyhow::Result<Option<String>> {
    let output = Self::run(&self.info, &["-p"])?;

    Ok(parse_policy_governor(&output))
  }

  fn available_governors(&self) -> anyhow::Result<GovernorSet> {
    let output = Self::run(&self.info, &["-g"])?;

    Ok(GovernorSet::parse(&output))
  }

  fn set_governor(&self, governor: &str) -> anyhow::Result<()> {
    Self::run(&self.set, &Self::governor_args(governor))?;

    Ok(())
  }

  fn set_max_frequency(
    &self,
    core: u32,
    frequency_khz: u64,
  ) -> anyhow::Result<()> {
    let core = core.to_string();
    let frequency_khz = frequency_khz.to_string();

    Self::run(&self.set, &["-c", &core, "--max", &frequency_khz])?;

    Ok(())
  }
}

/// Parse `cpufreq-info -l` output: `"<minimum> <maximum>"` in kHz.
pub fn parse_frequency_limits(output: &str) -> anyhow::Result<(u64, u64)> {
  let mut parts = output.split_whitespace();

  let (Some(minimum), Some(maximum)) = (parts.next(), parts.next()) else {
    bail!(
      "expected a minimum and maximum frequency, got '{output}'",
      output = output.trim(),
    );
  };

  let minimum = minimum
    .parse()
    .with_context(|| format!("failed to parse minimum frequency '{minimum}'"))?;
  let maximum = maximum
    .parse()
    .with_context(|| format!("failed to parse maximum frequency '{maximum}'"))?;

  Ok((minimum, maximum))
}

/// Parse `cpufreq-info -p` output: `"<minimum> <maximum> <governor>"`.
pub fn parse_policy_governor(output: &str) -> Option<String> {
  let governor = output.split_whitespace().nth(2)?;

  Some(governor.to_lowercase())
}

/// Frequency limits and governor found at startup.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct FrequencyRange {
  /// 0 when unknown.
  pub minimum_khz: u64,
  /// 0 when unknown.
  pub maximum_khz: u64,
  pub governor:    Option<String>,
}

impl fmt::Display for FrequencyRange {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "{minimum} MHz - {maximum} MHz",
      minimum = self.minimum_khz / 1000,
      maximum = self.maximum_khz / 1000,
    )?;

    if let Some(governor) = &self.governor {
      write!(f, " ({governor})")?;
    }

    Ok(())
  }
}

impl FrequencyRange {
  /// Read the frequency range the way `profile` exposes it.
  ///
  /// Failures are logged and yield zero frequencies, which the daemon never
  /// writes.
  pub fn read(
    profile: HardwareProfile,
    root: &fs::Root,
    cpufreq: &impl CpuFreq,
  ) -> Self {
    let range = if profile.has_sysfs_frequency_limits() {
      Self::read_sysfs(root)
    } else {
      Self::query(cpufreq)
    };

    range.unwrap_or_else(|error| {
      log::warn!("failed to determine CPU frequency range: {error:#}");
      log::warn!("maximum frequency will not be changed");

      Self::default()
    })
  }

  fn read_sysfs(root: &fs::Root) -> anyhow::Result<Self> {
    let minimum_khz = root
      .read_n::<u64>(CPUINFO_MIN_FREQ)?
      .with_context(|| format!("'{CPUINFO_MIN_FREQ}' does not exist"))?;
    let maximum_khz = root
      .read_n::<u64>(CPUINFO_MAX_FREQ)?
      .with_context(|| format!("'{CPUINFO_MAX_FREQ}' does not exist"))?;

    let governor = root
      .read(SCALING_GOVERNOR)
      .unwrap_or_else(|error| {
        log::debug!("failed to read current governor: {error:#}");
        None
      })
      .map(|governor| governor.to_lowercase());

    Ok(Self {
      minimum_khz,
      maximum_khz,
      governor,
    })
  }

  fn query(cpufreq: &impl CpuFreq) -> anyhow::Result<Self> {
    let (minimum_khz, maximum_khz) = cpufreq.frequency_limits()?;

    let governor = cpufreq.current_governor().unwrap_or_else(|error| {
      log::debug!("failed to query current governor: {error:#}");
      None
    });

    Ok(Self {
      minimum_khz,
      maximum_khz,
      governor,
    })
  }
}

/// Governor names the hardware supports, lowercased.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct GovernorSet(BTreeSet<String>);

impl fmt::Display for GovernorSet {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if self.0.is_empty() {
      return write!(f, "none");
    }

    for (index, governor) in self.0.iter().enumerate() {
      if index != 0 {
        write!(f, ", ")?;
      }

      write!(f, "{governor}")?;
    }

    Ok(())
  }
}

impl GovernorSet {
  pub fn parse(output: &str) -> Self {
    Self(output.split_whitespace().map(str::to_lowercase).collect())
  }

  /// Query the available governors, treating a failed query as none.
  pub fn query(cpufreq: &impl CpuFreq) -> Self {
    cpufreq.available_governors().unwrap_or_else(|error| {
      log::warn!("failed to query available governors: {error:#}");

      Self::default()
    })
  }

  pub fn contains(&self, governor: &str) -> bool {
    self.0.contains(&governor.to_lowercase())
  }

  /// Resolve the governors to use, falling back when a preferred one is not
  /// available.
  pub fn select(&self, preference: &config::GovernorPreference) -> Governors {
    let high = if self.contains(&preference.high) {
      preference.high.clone()
    } else {
      log::info!(
        "governor '{preferred}' is not available, using '{fallback}' instead",
        preferred = preference.high,
        fallback = Governors::HIGH_FALLBACK,
      );

      Governors::HIGH_FALLBACK.to_owned()
    };

    let low = if self.contains(&preference.low) {
      preference.low.clone()
    } else {
      log::warn!(
        "governor '{preferred}' is not available, using '{fallback}' instead",
        preferred = preference.low,
        fallback = Governors::LOW_FALLBACK,
      );

      Governors::LOW_FALLBACK.to_owned()
    };

    Governors { high, low }
  }
}

/// The governor pair used for the life of the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Governors {
  pub high: String,
  pub low:  String,
}

impl fmt::Display for Governors {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "{high} when cool, {low} when hot",
      high = self.high.green(),
      low = self.low.red(),
    )
  }
}

impl Governors {
  pub const HIGH_FALLBACK: &'static str = "performance";
  pub const LOW_FALLBACK: &'static str = "userspace";
}
