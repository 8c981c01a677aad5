use std::{
  sync::{
    Arc,
    Condvar,
    Mutex,
    PoisonError,
  },
  time::Duration,
};

use anyhow::Context;

use crate::{
  config,
  cpufreq::{
    self,
    CpuFreq,
  },
  hardware::Thermometer,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThermalState {
  /// At or below the critical temperature.
  Normal,
  /// Above the critical temperature.
  Throttled,
}

impl ThermalState {
  pub fn from_temperature(temperature_mc: i64, crit_temp_mc: i64) -> Self {
    if temperature_mc > crit_temp_mc {
      Self::Throttled
    } else {
      Self::Normal
    }
  }
}

/// Everything the control loop needs, determined once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Setup {
  pub runtime:     config::RuntimeConfig,
  pub frequencies: cpufreq::FrequencyRange,
  pub governors:   cpufreq::Governors,
  /// Number of logical cores to cap.
  pub cores:       u32,
}

/// A place the control loop can idle in until woken for shutdown.
pub trait Sleep {
  fn is_cancelled(&self) -> bool;

  /// Sleep for `duration`. Returns `true` if woken by cancellation.
  fn sleep(&self, duration: Duration) -> bool;
}

/// Shutdown request shared between the signal handler and the loop.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
  inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Shutdown {
  /// Create a token that SIGINT, SIGTERM and SIGHUP will trigger.
  pub fn install() -> anyhow::Result<Self> {
    let shutdown = Self::default();

    log::debug!("setting termination signal handler...");
    let shutdown_ = shutdown.clone();
    ctrlc::set_handler(move || {
      log::info!("received shutdown signal");
      shutdown_.request();
    })
    .context("failed to set termination signal handler")?;

    Ok(shutdown)
  }

  pub fn request(&self) {
    let (requested, wake) = &*self.inner;

    *requested.lock().unwrap_or_else(PoisonError::into_inner) = true;
    wake.notify_all();
  }
}

impl Sleep for Shutdown {
  fn is_cancelled(&self) -> bool {
    let (requested, _) = &*self.inner;

    *requested.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn sleep(&self, duration: Duration) -> bool {
    let (requested, wake) = &*self.inner;

    let guard = requested.lock().unwrap_or_else(PoisonError::into_inner);
    let (guard, _) = wake
      .wait_timeout_while(guard, duration, |requested| !*requested)
      .unwrap_or_else(PoisonError::into_inner);

    *guard
  }
}

struct Daemon<'a, C> {
  setup:   &'a Setup,
  cpufreq: &'a C,
}

impl<C: CpuFreq> Daemon<'_, C> {
  /// Push the governor and frequency of `state`, returning how long to sleep.
  fn apply(&self, state: ThermalState) -> Duration {
    let Setup {
      runtime,
      frequencies,
      governors,
      ..
    } = self.setup;

    match state {
      ThermalState::Throttled => {
        log::warn!("CPU temperature too high");
        log::info!(
          "slowing down for {seconds} seconds",
          seconds = runtime.relax_time.as_secs(),
        );

        self.set_governor(&governors.low);
        self.set_max_frequency(frequencies.minimum_khz);

        runtime.relax_time
      },

      ThermalState::Normal => {
        self.set_governor(&governors.high);
        self.set_max_frequency(frequencies.maximum_khz);

        runtime.poll_interval
      },
    }
  }

  /// Return the host to how it was running before throttling.
  fn restore(&self) {
    let Setup {
      frequencies,
      governors,
      ..
    } = self.setup;

    let governor = frequencies.governor.as_deref().unwrap_or(&governors.high);

    self.set_governor(governor);
    self.set_max_frequency(frequencies.maximum_khz);
  }

  fn set_governor(&self, governor: &str) {
    log::debug!("setting governor to '{governor}'");

    if let Err(error) = self.cpufreq.set_governor(governor) {
      log::warn!("failed to set governor to '{governor}': {error:#}");
    }
  }

  /// Cap every core to `frequency_khz`, stopping at the first failure.
  /// Zero means the frequency is unknown and nothing is written.
  fn set_max_frequency(&self, frequency_khz: u64) {
    if frequency_khz == 0 {
      log::debug!("maximum frequency is unknown, not setting it");
      return;
    }

    log::info!(
      "setting maximum frequency to {mhz} MHz",
      mhz = frequency_khz / 1000,
    );

    for core in 0..self.setup.cores {
      log::debug!("setting core {core} to {frequency_khz} kHz");

      if let Err(error) = self.cpufreq.set_max_frequency(core, frequency_khz) {
        log::warn!(
          "failed to set maximum frequency of core {core}, leaving cores \
           {core}..{cores} as they were: {error:#}",
          cores = self.setup.cores,
        );
        break;
      }
    }
  }
}

/// Run the control loop until `sleep` is cancelled.
///
/// Every iteration reads the temperature and pushes the matching governor and
/// maximum frequency, whether or not they are already in place. On exit the
/// startup governor and the maximum frequency are restored once.
pub fn run(
  setup: &Setup,
  thermometer: &impl Thermometer,
  cpufreq: &impl CpuFreq,
  sleep: &impl Sleep,
) -> anyhow::Result<()> {
  let daemon = Daemon { setup, cpufreq };
  let runtime = &setup.runtime;

  log::info!("starting control loop...");

  let mut failures = 0;

  while !sleep.is_cancelled() {
    let delay = match thermometer.read_millidegrees() {
      Ok(temperature_mc) => {
        failures = 0;

        log::info!(
          "current temperature is {celsius}°C",
          celsius = temperature_mc / 1000,
        );

        daemon.apply(ThermalState::from_temperature(
          temperature_mc,
          runtime.crit_temp,
        ))
      },

      Err(error) => {
        failures += 1;

        log::warn!(
          "failed to read temperature ({failures}/{max}): {error:#}",
          max = runtime.max_read_failures,
        );

        if failures >= runtime.max_read_failures {
          log::error!(
            "temperature could not be read {failures} times in a row, \
             restoring governor and maximum frequency"
          );
          daemon.restore();

          return Err(error).context("temperature sensor stopped responding");
        }

        runtime.poll_interval
      },
    };

    log::debug!(
      "next check in {seconds} seconds",
      seconds = delay.as_secs()
    );

    if sleep.sleep(delay) {
      break;
    }
  }

  log::warn!("terminating, restoring governor and maximum frequency");
  daemon.restore();

  Ok(())
}
