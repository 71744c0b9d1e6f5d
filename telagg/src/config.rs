//! Recorder configuration.
//!
//! [`RecorderConfig`] carries the parameters of one recording run. It is
//! deserialisable from JSON with durations given in seconds, so the same
//! type backs configuration files and the control surface's start command.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

/// Default segment length: one hour.
pub const DEFAULT_TIME_PER_FILE: Duration = Duration::from_secs(60 * 60);

/// Default buffering window for engine-buffered feeds: ten minutes.
pub const DEFAULT_TIME_PER_FRAME: Duration = Duration::from_secs(60 * 10);

/// Default data directory.
pub const DEFAULT_DATA_DIR: &str = "data/";

/// Default resolution of the rotation check.
pub const DEFAULT_TICK: Duration = Duration::from_millis(100);

/// Parameters of a recording run.
///
/// # Example
///
/// ```rust
/// use telagg::config::RecorderConfig;
/// use std::time::Duration;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = RecorderConfig::from_json(
///     r#"{ "data_dir": "/var/lib/hk", "time_per_file": 600 }"#,
/// )?;
/// assert_eq!(config.time_per_file, Duration::from_secs(600));
/// assert_eq!(config.time_per_frame, Duration::from_secs(600));
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RecorderConfig {
    /// Root directory for segment files.
    pub data_dir: PathBuf,

    /// How long a segment stays open before rotating to a new one.
    #[serde(with = "seconds")]
    pub time_per_file: Duration,

    /// Accumulation window for engine-buffered feeds that do not advertise
    /// their own `buffer_time`.
    #[serde(with = "seconds")]
    pub time_per_frame: Duration,

    /// Resolution of the control loop's rotation check.
    #[serde(with = "seconds")]
    pub tick: Duration,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            time_per_file: DEFAULT_TIME_PER_FILE,
            time_per_frame: DEFAULT_TIME_PER_FRAME,
            tick: DEFAULT_TICK,
        }
    }
}

impl RecorderConfig {
    /// Creates a configuration with default timings rooted at `data_dir`.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Parses and validates a JSON configuration document.
    ///
    /// Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] if the document is malformed or has
    /// unknown fields, or the validation error otherwise.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the data directory is empty or any duration
    /// is zero.
    pub fn validate(&self) -> Result<()> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(ConfigError::EmptyDataDir.into());
        }

        for (name, duration) in [
            ("time_per_file", self.time_per_file),
            ("time_per_frame", self.time_per_frame),
            ("tick", self.tick),
        ] {
            if duration.is_zero() {
                return Err(ConfigError::InvalidDuration { name, value: 0.0 }.into());
            }
        }

        Ok(())
    }
}

/// Converts a user-supplied number of seconds into a positive [`Duration`].
///
/// # Errors
///
/// Returns [`ConfigError::InvalidDuration`] for zero, negative, NaN or
/// overflowing values.
pub fn positive_seconds(name: &'static str, value: f64) -> Result<Duration> {
    match Duration::try_from_secs_f64(value) {
        Ok(duration) if !duration.is_zero() => Ok(duration),
        _ => Err(ConfigError::InvalidDuration { name, value }.into()),
    }
}

/// Serde support for `Duration` fields as (fractional) seconds.
pub(crate) mod seconds {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer, de::Error};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(D::Error::custom)
    }
}

/// Serde support for `Option<Duration>` fields as (fractional) seconds.
pub(crate) mod opt_seconds {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer, de::Error};

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.map(|d| d.as_secs_f64()).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<f64>::deserialize(deserializer)?
            .map(|secs| Duration::try_from_secs_f64(secs).map_err(D::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TelaggError;

    #[test]
    fn test_defaults() {
        let config = RecorderConfig::default();
        assert_eq!(config.data_dir, PathBuf::from("data/"));
        assert_eq!(config.time_per_file, Duration::from_secs(3600));
        assert_eq!(config.time_per_frame, Duration::from_secs(600));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        let mut config = RecorderConfig::new("");
        assert!(config.validate().is_err());

        config.data_dir = PathBuf::from("/tmp/hk");
        config.time_per_frame = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_json_seconds() {
        let config: RecorderConfig =
            serde_json::from_str(r#"{ "time_per_file": 1.5, "tick": 0.05 }"#).unwrap();
        assert_eq!(config.time_per_file, Duration::from_millis(1500));
        assert_eq!(config.tick, Duration::from_millis(50));
        assert_eq!(config.time_per_frame, DEFAULT_TIME_PER_FRAME);

        assert!(serde_json::from_str::<RecorderConfig>(r#"{ "time_per_file": -1 }"#).is_err());
        assert!(serde_json::from_str::<RecorderConfig>(r#"{ "bogus": 1 }"#).is_err());
    }

    #[test]
    fn test_from_json() {
        let config = RecorderConfig::from_json(r#"{ "data_dir": "/tmp/hk", "time_per_frame": 30 }"#)
            .unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/tmp/hk"));
        assert_eq!(config.time_per_frame, Duration::from_secs(30));

        for bad in [r#"{ "bogus": 1 }"#, "not json", r#"{ "tick": "fast" }"#] {
            let err = RecorderConfig::from_json(bad).unwrap_err();
            assert!(
                matches!(err, TelaggError::Config(ConfigError::Parse(_))),
                "{bad}: {err}"
            );
        }

        let err = RecorderConfig::from_json(r#"{ "data_dir": "" }"#).unwrap_err();
        assert!(matches!(err, TelaggError::Config(ConfigError::EmptyDataDir)));
    }

    #[test]
    fn test_positive_seconds() {
        assert_eq!(
            positive_seconds("x", 2.5).unwrap(),
            Duration::from_millis(2500)
        );
        assert!(positive_seconds("x", 0.0).is_err());
        assert!(positive_seconds("x", -3.0).is_err());
        assert!(positive_seconds("x", f64::NAN).is_err());
    }
}
