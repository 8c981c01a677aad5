use std::{
  env,
  path::PathBuf,
  process::ExitCode,
};

use anyhow::Context as _;
use clap::Parser as _;

pub mod config;
pub mod cpufreq;
pub mod daemon;
pub mod hardware;

pub mod fs;

pub mod lock;

/// Throttle the CPU governor and maximum frequency while the CPU runs hot.
#[derive(clap::Parser, Debug)]
#[command(version, about)]
pub struct Cli {
  #[command(flatten)]
  verbosity: clap_verbosity_flag::Verbosity<clap_verbosity_flag::InfoLevel>,

  /// Seconds to let the CPU cool down before the next check. Default is 30
  /// seconds.
  #[arg(long = "time", value_name = "SECONDS")]
  relax_time: Option<u64>,

  /// Temperature in degrees celsius for the CPU to throttle down at. Default
  /// is 64.
  #[arg(long = "crit_temp", alias = "crit-temp", value_name = "CELSIUS")]
  crit_temp: Option<i64>,

  /// Output more information. Same as the highest verbosity.
  #[arg(long)]
  debug: bool,

  /// The daemon config path.
  #[arg(long, env = "CPUTHROTTLE_CONFIG")]
  config: Option<PathBuf>,

  /// Force running even if another instance is already running. Potentially
  /// destructive.
  #[arg(long)]
  force: bool,
}

impl Cli {
  fn overrides(&self) -> config::Overrides {
    config::Overrides {
      relax_time: self.relax_time,
      crit_temp:  self.crit_temp,
      debug:      self.debug,
    }
  }
}

pub fn main() -> anyhow::Result<ExitCode> {
  let cli = Cli::parse();

  yansi::whenever(yansi::Condition::TTY_AND_COLOR);

  env_logger::Builder::new()
    .filter_level(if cli.debug {
      log::LevelFilter::Debug
    } else {
      cli.verbosity.log_level_filter()
    })
    .target(env_logger::Target::Stdout)
    .format_timestamp_secs()
    .format_module_path(false)
    .init();

  let config = config::DaemonConfig::load_from(cli.config.as_deref())
    .context("failed to load daemon config")?;
  let runtime = config.resolve(cli.overrides())?;

  log::debug!(
    "critical temperature: {crit_temp} mC, relax time: {relax_time:?}, \
     poll interval: {poll_interval:?}, debug: {debug}",
    crit_temp = runtime.crit_temp,
    relax_time = runtime.relax_time,
    poll_interval = runtime.poll_interval,
    debug = runtime.debug,
  );

  if !nix::unistd::Uid::effective().is_root() {
    log::error!(
      "cputhrottle needs to run as root to change CPU governors and \
       frequencies"
    );
    return Ok(ExitCode::FAILURE);
  }

  log::info!("starting cputhrottle daemon");

  let lock_path = env::var("XDG_RUNTIME_DIR")
    .map(|dir| PathBuf::from(dir).join("cputhrottle.pid"))
    .unwrap_or_else(|_| PathBuf::from("/run/cputhrottle.pid"));

  let lock = lock::LockFile::acquire(&lock_path, cli.force).with_context(|| {
    format!("failed to acquire pid lock at {}", lock_path.display())
  })?;

  if let Some(lock) = &lock {
    log::debug!("holding pid lock at {}", lock.path().display());
  }

  let root = fs::Root::system();

  let profile = hardware::HardwareProfile::detect(&root);
  if profile == hardware::HardwareProfile::Unsupported {
    log::warn!("sorry, this hardware is not supported");
    return Ok(ExitCode::SUCCESS);
  }
  log::info!("reading temperature from {profile}");

  let cpufreq = cpufreq::Cpufrequtils::new(&config.commands);

  let frequencies = cpufreq::FrequencyRange::read(profile, &root, &cpufreq);
  log::info!("CPU frequency range: {frequencies}");

  let available = cpufreq::GovernorSet::query(&cpufreq);
  log::debug!("available governors: {available}");
  let governors = available.select(&config.governors);
  log::info!("governors: {governors}");

  let setup = daemon::Setup {
    runtime,
    frequencies,
    governors,
    cores: num_cpus::get() as u32,
  };
  log::debug!("throttling {cores} cores", cores = setup.cores);

  let shutdown = daemon::Shutdown::install()?;
  let sensor = hardware::Sensor::new(profile, root);

  daemon::run(&setup, &sensor, &cpufreq, &shutdown)?;

  log::info!("stopped cputhrottle daemon");

  Ok(ExitCode::SUCCESS)
}
