use std::fmt;

use anyhow::{
  Context,
  bail,
};
use yansi::Paint as _;

use crate::fs;

const LNX_SYSTEM_THERMAL: &str =
  "/sys/devices/LNXSYSTM:00/LNXTHERM:00/LNXTHERM:01/thermal_zone/temp";
const ACPI_BUS_THERMAL: &str =
  "/sys/bus/acpi/devices/LNXTHERM:00/thermal_zone/temp";
const HWMON: &str = "/sys/class/hwmon/hwmon0";
const HWMON_INPUT: &str = "/sys/class/hwmon/hwmon0/temp1_input";
const PROC_ACPI_THM0: &str = "/proc/acpi/thermal_zone/THM0/temperature";
const PROC_ACPI_THRM: &str = "/proc/acpi/thermal_zone/THRM/temperature";
const PROC_ACPI_THR1: &str = "/proc/acpi/thermal_zone/THR1/temperature";

/// The thermal interface layout found on this host.
///
/// Detected once at startup, never re-probed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HardwareProfile {
  /// ACPI thermal zone below the `LNXSYSTM:00` system device.
  LnxSystemThermal,
  /// ACPI thermal zone exposed on the ACPI bus. Also the only layout whose
  /// frequency limits are read from sysfs instead of `cpufreq-info`.
  AcpiBusThermal,
  /// First hardware monitor, `temp1_input`.
  Hwmon,
  /// Legacy procfs ACPI thermal zones.
  ProcAcpiThm0,
  ProcAcpiThrm,
  ProcAcpiThr1,
  Unsupported,
}

/// How a profile's temperature file encodes its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Encoding {
  /// Millidegrees, but only meaningful to whole degrees.
  WholeDegreeMillis,
  /// A plain integer.
  Raw,
  /// `temperature:             45 C`
  ProcAcpiText,
}

impl fmt::Display for HardwareProfile {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Self::LnxSystemThermal => "LNXSYSTM thermal zone",
      Self::AcpiBusThermal => "ACPI bus thermal zone",
      Self::Hwmon => "hwmon0",
      Self::ProcAcpiThm0 => "procfs ACPI thermal zone THM0",
      Self::ProcAcpiThrm => "procfs ACPI thermal zone THRM",
      Self::ProcAcpiThr1 => "procfs ACPI thermal zone THR1",
      Self::Unsupported => "unsupported hardware",
    };

    write!(f, "{name}", name = name.cyan())
  }
}

impl HardwareProfile {
  /// Profiles in probe order. Several sensors may be present at once, the
  /// first one found wins.
  pub const PROBE_ORDER: [Self; 6] = [
    Self::LnxSystemThermal,
    Self::AcpiBusThermal,
    Self::Hwmon,
    Self::ProcAcpiThm0,
    Self::ProcAcpiThrm,
    Self::ProcAcpiThr1,
  ];

  pub fn detect(root: &fs::Root) -> Self {
    for profile in Self::PROBE_ORDER {
      let Some(probe) = profile.probe_path() else {
        continue;
      };

      log::debug!("probing '{probe}' for {profile}");

      if root.exists(probe) {
        return profile;
      }
    }

    Self::Unsupported
  }

  /// The path whose existence selects this profile.
  fn probe_path(self) -> Option<&'static str> {
    match self {
      Self::Hwmon => Some(HWMON),
      other => other.temperature_path(),
    }
  }

  pub fn temperature_path(self) -> Option<&'static str> {
    Some(match self {
      Self::LnxSystemThermal => LNX_SYSTEM_THERMAL,
      Self::AcpiBusThermal => ACPI_BUS_THERMAL,
      Self::Hwmon => HWMON_INPUT,
      Self::ProcAcpiThm0 => PROC_ACPI_THM0,
      Self::ProcAcpiThrm => PROC_ACPI_THRM,
      Self::ProcAcpiThr1 => PROC_ACPI_THR1,
      Self::Unsupported => return None,
    })
  }

  pub fn has_sysfs_frequency_limits(self) -> bool {
    self == Self::AcpiBusThermal
  }

  fn encoding(self) -> Encoding {
    match self {
      Self::LnxSystemThermal | Self::AcpiBusThermal => {
        Encoding::WholeDegreeMillis
      },
      Self::Hwmon | Self::Unsupported => Encoding::Raw,
      Self::ProcAcpiThm0 | Self::ProcAcpiThrm | Self::ProcAcpiThr1 => {
        Encoding::ProcAcpiText
      },
    }
  }

  /// Parse the contents of this profile's temperature file into
  /// millidegrees celsius.
  pub fn parse_temperature(self, content: &str) -> anyhow::Result<i64> {
    let content = content.trim();

    let number = match self.encoding() {
      Encoding::ProcAcpiText => {
        content
          .trim_start_matches("temperature")
          .trim_start()
          .trim_start_matches(':')
          .trim()
          .trim_end_matches('C')
          .trim_end()
      },

      Encoding::WholeDegreeMillis | Encoding::Raw => content,
    };

    let raw = number.parse::<i64>().with_context(|| {
      format!("failed to parse temperature '{content}' reported by {self}")
    })?;

    let millidegrees = normalize_millidegrees(raw).with_context(|| {
      format!("temperature {raw} reported by {self} is out of range")
    })?;

    Ok(match self.encoding() {
      Encoding::WholeDegreeMillis => millidegrees / 1000 * 1000,
      Encoding::Raw | Encoding::ProcAcpiText => millidegrees,
    })
  }
}

/// Bring a reading to millidegrees celsius.
///
/// Kernels disagree on whether thermal zones report whole degrees or
/// millidegrees. Anything below 1000 is taken as whole degrees. This is a
/// heuristic: a sensor genuinely reporting less than one degree in
/// millidegrees would be misread.
///
/// Returns `None` when the whole-degree reading does not fit in millidegrees.
pub fn normalize_millidegrees(raw: i64) -> Option<i64> {
  if raw < 1000 { raw.checked_mul(1000) } else { Some(raw) }
}

/// Something that can report the current CPU temperature.
pub trait Thermometer {
  /// Current temperature in millidegrees celsius.
  fn read_millidegrees(&self) -> anyhow::Result<i64>;
}

/// The production [`Thermometer`], reading the detected profile's file.
#[derive(Debug, Clone)]
pub struct Sensor {
  profile: HardwareProfile,
  root:    fs::Root,
}

impl Sensor {
  pub fn new(profile: HardwareProfile, root: fs::Root) -> Self {
    Self { profile, root }
  }
}

impl Thermometer for Sensor {
  fn read_millidegrees(&self) -> anyhow::Result<i64> {
    let Self { profile, root } = self;

    let Some(path) = profile.temperature_path() else {
      bail!("cannot read temperature on {profile}");
    };

    let content = root
      .read(path)
      .with_context(|| format!("failed to read temperature of {profile}"))?
      .with_context(|| format!("'{path}' no longer exists"))?;

    profile.parse_temperature(&content)
  }
}

#[cfg(test)]
mod tests {
  use std::{
    fs as std_fs,
    path::Path,
  };

  use proptest::prelude::*;

  use super::*;

  fn touch(root: &Path, path: &str, content: &str) {
    let path = fs::Root::new(root).path(path);
    std_fs::create_dir_all(path.parent().unwrap()).unwrap();
    std_fs::write(path, content).unwrap();
  }

  #[test]
  fn empty_tree_is_unsupported() {
    let dir = tempfile::tempdir().unwrap();

    assert_eq!(
      HardwareProfile::detect(&fs::Root::new(dir.path())),
      HardwareProfile::Unsupported,
    );
  }

  #[test]
  fn detection_follows_priority_order() {
    let dir = tempfile::tempdir().unwrap();
    let root = fs::Root::new(dir.path());

    touch(dir.path(), PROC_ACPI_THR1, "temperature: 40 C\n");
    assert_eq!(HardwareProfile::detect(&root), HardwareProfile::ProcAcpiThr1);

    touch(dir.path(), PROC_ACPI_THRM, "temperature: 40 C\n");
    assert_eq!(HardwareProfile::detect(&root), HardwareProfile::ProcAcpiThrm);

    touch(dir.path(), PROC_ACPI_THM0, "temperature: 40 C\n");
    assert_eq!(HardwareProfile::detect(&root), HardwareProfile::ProcAcpiThm0);

    std_fs::create_dir_all(root.path(HWMON)).unwrap();
    assert_eq!(HardwareProfile::detect(&root), HardwareProfile::Hwmon);

    touch(dir.path(), ACPI_BUS_THERMAL, "40000\n");
    assert_eq!(
      HardwareProfile::detect(&root),
      HardwareProfile::AcpiBusThermal,
    );

    touch(dir.path(), LNX_SYSTEM_THERMAL, "40000\n");
    assert_eq!(
      HardwareProfile::detect(&root),
      HardwareProfile::LnxSystemThermal,
    );
  }

  #[test]
  fn hwmon_is_selected_by_directory_alone() {
    let dir = tempfile::tempdir().unwrap();
    let root = fs::Root::new(dir.path());
    std_fs::create_dir_all(root.path(HWMON)).unwrap();

    assert_eq!(HardwareProfile::detect(&root), HardwareProfile::Hwmon);

    // Detected, but nothing to read yet.
    let sensor = Sensor::new(HardwareProfile::Hwmon, root);
    assert!(sensor.read_millidegrees().is_err());
  }

  #[test]
  fn whole_degrees_and_millidegrees_normalize_alike() {
    assert_eq!(HardwareProfile::Hwmon.parse_temperature("45").unwrap(), 45000);
    assert_eq!(
      HardwareProfile::Hwmon.parse_temperature("45000").unwrap(),
      45000,
    );
    assert_eq!(
      HardwareProfile::Hwmon.parse_temperature("45250\n").unwrap(),
      45250,
    );
  }

  #[test]
  fn lnx_thermal_zones_drop_sub_degree_precision() {
    for profile in [
      HardwareProfile::LnxSystemThermal,
      HardwareProfile::AcpiBusThermal,
    ] {
      assert_eq!(profile.parse_temperature("47000").unwrap(), 47000);
      assert_eq!(profile.parse_temperature("47800").unwrap(), 47000);
      assert_eq!(profile.parse_temperature("47").unwrap(), 47000);
    }
  }

  #[test]
  fn proc_acpi_text_is_stripped() {
    for profile in [
      HardwareProfile::ProcAcpiThm0,
      HardwareProfile::ProcAcpiThrm,
      HardwareProfile::ProcAcpiThr1,
    ] {
      assert_eq!(
        profile
          .parse_temperature("temperature:             45 C\n")
          .unwrap(),
        45000,
      );
      assert_eq!(profile.parse_temperature("temperature : 52 C").unwrap(), 52000);
    }
  }

  #[test]
  fn garbage_is_an_error() {
    assert!(HardwareProfile::Hwmon.parse_temperature("").is_err());
    assert!(HardwareProfile::Hwmon.parse_temperature("warm").is_err());
    assert!(
      HardwareProfile::ProcAcpiThm0
        .parse_temperature("temperature: unknown")
        .is_err()
    );
  }

  #[test]
  fn absurd_readings_are_errors() {
    for profile in [
      HardwareProfile::Hwmon,
      HardwareProfile::LnxSystemThermal,
      HardwareProfile::ProcAcpiThm0,
    ] {
      assert!(profile.parse_temperature("-9223372036854775808").is_err());
      assert!(profile.parse_temperature("-9300000000000000").is_err());
    }

    assert_eq!(normalize_millidegrees(i64::MIN), None);
    assert_eq!(normalize_millidegrees(i64::MAX), Some(i64::MAX));
    assert_eq!(
      HardwareProfile::Hwmon.parse_temperature("-20").unwrap(),
      -20000,
    );

    let dir = tempfile::tempdir().unwrap();
    touch(dir.path(), HWMON_INPUT, "-9223372036854775808\n");
    let sensor = Sensor::new(HardwareProfile::Hwmon, fs::Root::new(dir.path()));
    assert!(sensor.read_millidegrees().is_err());
  }

  #[test]
  fn sensor_reads_the_detected_file() {
    let dir = tempfile::tempdir().unwrap();
    let root = fs::Root::new(dir.path());
    touch(dir.path(), HWMON_INPUT, "61000\n");

    let profile = HardwareProfile::detect(&root);
    let sensor = Sensor::new(profile, root);

    assert_eq!(sensor.read_millidegrees().unwrap(), 61000);

    touch(dir.path(), HWMON_INPUT, "66000\n");
    assert_eq!(sensor.read_millidegrees().unwrap(), 66000);

    std_fs::remove_file(fs::Root::new(dir.path()).path(HWMON_INPUT)).unwrap();
    assert!(sensor.read_millidegrees().is_err());
  }

  #[test]
  fn unsupported_sensor_cannot_read() {
    let sensor =
      Sensor::new(HardwareProfile::Unsupported, fs::Root::new("/nonexistent"));

    assert!(sensor.read_millidegrees().is_err());
  }

  proptest! {
    #[test]
    fn normalized_readings_are_millidegrees(raw in 0i64..200_000) {
      let millidegrees = normalize_millidegrees(raw).unwrap();

      prop_assert!(millidegrees >= 1000 || raw == 0);
      if raw >= 1000 {
        prop_assert_eq!(millidegrees, raw);
      } else {
        prop_assert_eq!(millidegrees, raw * 1000);
      }
    }

    #[test]
    fn whole_degree_readings_agree_with_millidegree_ones(celsius in 1i64..150) {
      let profile = HardwareProfile::LnxSystemThermal;

      prop_assert_eq!(
        profile.parse_temperature(&celsius.to_string()).unwrap(),
        profile.parse_temperature(&(celsius * 1000).to_string()).unwrap(),
      );
    }
  }
}
