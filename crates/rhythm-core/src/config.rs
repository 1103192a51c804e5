use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use crate::{error::SessionError, motion::SamplingProfile};

/// Get the local data directory for rhythm.
///
/// # Errors
///
/// Returns an error if the local data directory cannot be determined.
pub fn get_data_dir() -> Result<PathBuf> {
    let mut path =
        dirs::data_local_dir().ok_or_else(|| anyhow::anyhow!("Failed to get local data dir"))?;
    path.push("rhythm");
    Ok(path)
}

/// Default location of `config.toml`.
///
/// # Errors
///
/// Returns an error if the local data directory cannot be determined.
pub fn default_config_path() -> Result<PathBuf> {
    Ok(get_data_dir()?.join("config.toml"))
}

/// Parameters of one training session.
///
/// Built once at session start and never mutated afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub total_reps: u32,
    pub rep_interval: Duration,
    pub countdown_from: u32,
    /// Multiplier on `rep_interval` that defines the compliance window
    pub missed_rep_grace_factor: f64,
    /// Length of one countdown step
    pub countdown_tick: Duration,
    /// Delay between `Finished` and the dismiss signal.
    ///
    /// An absolute duration, independent of `countdown_tick`. The default is
    /// two default countdown ticks.
    pub dismiss_delay: Duration,
    pub sampling: SamplingProfile,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            total_reps: 20,
            rep_interval: Duration::from_secs(2),
            countdown_from: 3,
            missed_rep_grace_factor: 2.2,
            countdown_tick: Duration::from_secs(1),
            dismiss_delay: Duration::from_secs(2),
            sampling: SamplingProfile::HIGH_RATE,
        }
    }
}

impl SessionConfig {
    /// Compliance window: a rep is missed when no activity was seen for longer than this
    #[must_use]
    pub fn compliance_window(&self) -> Duration {
        self.checked_compliance_window().unwrap_or(Duration::MAX)
    }

    fn checked_compliance_window(&self) -> Option<Duration> {
        Duration::try_from_secs_f64(self.rep_interval.as_secs_f64() * self.missed_rep_grace_factor)
            .ok()
    }

    /// Check the config for values the engine cannot run with.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::InvalidConfig` naming the first offending field.
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.total_reps == 0 {
            return Err(SessionError::InvalidConfig(
                "total_reps must be at least 1".to_string(),
            ));
        }
        if self.countdown_from == 0 {
            return Err(SessionError::InvalidConfig(
                "countdown_from must be at least 1".to_string(),
            ));
        }
        if self.rep_interval.is_zero() || self.countdown_tick.is_zero() {
            return Err(SessionError::InvalidConfig(
                "rep_interval and countdown_tick must be non-zero".to_string(),
            ));
        }
        if !self.missed_rep_grace_factor.is_finite() || self.missed_rep_grace_factor <= 0.0 {
            return Err(SessionError::InvalidConfig(format!(
                "missed_rep_grace_factor must be a positive number, got {}",
                self.missed_rep_grace_factor
            )));
        }
        let Some(window) = self.checked_compliance_window() else {
            return Err(SessionError::InvalidConfig(format!(
                "missed_rep_grace_factor {} overflows the compliance window",
                self.missed_rep_grace_factor
            )));
        };
        // Every timer deadline must be representable from now
        let now = Instant::now();
        for (name, period) in [
            ("rep_interval", self.rep_interval),
            ("countdown_tick", self.countdown_tick),
            ("dismiss_delay", self.dismiss_delay),
            ("compliance window", window),
        ] {
            if now.checked_add(period).is_none() {
                return Err(SessionError::InvalidConfig(format!(
                    "{name} of {period:?} is too long"
                )));
            }
        }
        self.sampling.validate()
    }
}

/// On-disk settings (`config.toml`). Every field has a default, so partial files are fine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub session: SessionSettings,
    pub motion: MotionSettings,
    pub companion: CompanionSettings,
    pub transport: TransportSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub total_reps: u32,
    pub rep_interval_secs: f64,
    pub countdown_from: u32,
    pub grace_factor: f64,
    pub countdown_tick_secs: f64,
    pub dismiss_delay_secs: f64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            total_reps: 20,
            rep_interval_secs: 2.0,
            countdown_from: 3,
            grace_factor: 2.2,
            countdown_tick_secs: 1.0,
            dismiss_delay_secs: 2.0,
        }
    }
}

/// Sampling interval and activity threshold.
///
/// The two values are tuned together: a faster sampling rate sees smaller
/// per-sample deltas and needs a lower threshold, a slower one needs a higher
/// threshold to stay above sensor noise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionSettings {
    pub sampling_interval_ms: u64,
    pub threshold: f64,
}

impl Default for MotionSettings {
    fn default() -> Self {
        let profile = SamplingProfile::HIGH_RATE;
        Self {
            sampling_interval_ms: u64::try_from(profile.interval.as_millis()).unwrap_or(50),
            threshold: profile.threshold,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompanionSettings {
    /// Ceiling on how long the companion stays "in progress" without a `Finished` fact
    pub safety_timeout_secs: u64,
}

impl Default for CompanionSettings {
    fn default() -> Self {
        Self {
            safety_timeout_secs: 180,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    pub watch_socket: Option<PathBuf>,
    pub companion_socket: Option<PathBuf>,
    pub retry_interval_secs: u64,
    pub connect_timeout_ms: u64,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            watch_socket: None,
            companion_socket: None,
            retry_interval_secs: 5,
            connect_timeout_ms: 500,
        }
    }
}

impl TransportSettings {
    /// Socket the wrist device listens on.
    ///
    /// # Errors
    ///
    /// Returns an error if no path is configured and the data dir cannot be determined.
    pub fn watch_socket_path(&self) -> Result<PathBuf> {
        match &self.watch_socket {
            Some(path) => Ok(path.clone()),
            None => Ok(get_data_dir()?.join("watch.sock")),
        }
    }

    /// Socket the companion device listens on.
    ///
    /// # Errors
    ///
    /// Returns an error if no path is configured and the data dir cannot be determined.
    pub fn companion_socket_path(&self) -> Result<PathBuf> {
        match &self.companion_socket {
            Some(path) => Ok(path.clone()),
            None => Ok(get_data_dir()?.join("companion.sock")),
        }
    }

    #[must_use]
    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs.max(1))
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.max(1))
    }
}

impl Settings {
    /// Load settings from `path`, or from the default location when `None`.
    ///
    /// A missing file yields the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => default_config_path()?,
        };

        if !path.exists() {
            log::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let settings: Self = toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        log::debug!("Loaded config from {}", path.display());
        Ok(settings)
    }

    /// Write settings as TOML, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_toml()?)?;
        Ok(())
    }

    /// Render settings as TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Build a validated session config.
    ///
    /// # Errors
    ///
    /// Returns an error if any duration is negative or not finite, or if the
    /// resulting config does not validate.
    pub fn session_config(&self) -> Result<SessionConfig> {
        let s = &self.session;
        let config = SessionConfig {
            total_reps: s.total_reps,
            rep_interval: secs("session.rep_interval_secs", s.rep_interval_secs)?,
            countdown_from: s.countdown_from,
            missed_rep_grace_factor: s.grace_factor,
            countdown_tick: secs("session.countdown_tick_secs", s.countdown_tick_secs)?,
            dismiss_delay: secs("session.dismiss_delay_secs", s.dismiss_delay_secs)?,
            sampling: SamplingProfile::new(
                Duration::from_millis(self.motion.sampling_interval_ms),
                self.motion.threshold,
            ),
        };
        config.validate()?;
        Ok(config)
    }

    #[must_use]
    pub fn safety_timeout(&self) -> Duration {
        Duration::from_secs(self.companion.safety_timeout_secs)
    }
}

fn secs(field: &str, value: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(value)
        .map_err(|e| anyhow::anyhow!("Invalid duration for {field} ({value}): {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings_match_default_session_config() {
        let config = Settings::default().session_config().unwrap();
        assert_eq!(config, SessionConfig::default());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let settings: Settings = toml::from_str(
            r"
[session]
total_reps = 5
rep_interval_secs = 1.0

[motion]
sampling_interval_ms = 100
threshold = 0.1
",
        )
        .unwrap();

        assert_eq!(settings.session.total_reps, 5);
        assert_eq!(settings.session.countdown_from, 3);
        assert_eq!(settings.companion.safety_timeout_secs, 180);

        let config = settings.session_config().unwrap();
        assert_eq!(config.rep_interval, Duration::from_secs(1));
        assert_eq!(config.sampling, SamplingProfile::LOW_RATE);
    }

    #[test]
    fn test_negative_interval_is_rejected() {
        let mut settings = Settings::default();
        settings.session.rep_interval_secs = -1.0;
        assert!(settings.session_config().is_err());
    }

    #[test]
    fn test_zero_reps_is_rejected() {
        let config = SessionConfig {
            total_reps: 0,
            ..SessionConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(SessionError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_nan_grace_factor_is_rejected() {
        let config = SessionConfig {
            missed_rep_grace_factor: f64::NAN,
            ..SessionConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_overflowing_grace_factor_is_rejected() {
        let config = SessionConfig {
            missed_rep_grace_factor: 1e300,
            ..SessionConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(SessionError::InvalidConfig(_))
        ));
        assert_eq!(config.compliance_window(), Duration::MAX);
    }

    #[test]
    fn test_unbounded_intervals_are_rejected() {
        let config = SessionConfig {
            rep_interval: Duration::MAX,
            missed_rep_grace_factor: 0.5,
            ..SessionConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(SessionError::InvalidConfig(_))
        ));

        let config = SessionConfig {
            countdown_tick: Duration::MAX,
            ..SessionConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_huge_interval_in_settings_is_rejected() {
        let mut settings = Settings::default();
        settings.session.rep_interval_secs = 1.5e19;
        assert!(settings.session_config().is_err());
    }

    #[test]
    fn test_default_dismiss_delay_is_two_ticks() {
        let config = SessionConfig::default();
        assert_eq!(config.dismiss_delay, config.countdown_tick * 2);
    }

    #[test]
    fn test_compliance_window() {
        let config = SessionConfig {
            rep_interval: Duration::from_secs(1),
            missed_rep_grace_factor: 2.0,
            ..SessionConfig::default()
        };
        assert_eq!(config.compliance_window(), Duration::from_secs(2));
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut settings = Settings::default();
        settings.session.total_reps = 12;
        settings.transport.watch_socket = Some(dir.path().join("w.sock"));
        settings.save(&path).unwrap();

        let loaded = Settings::load(Some(&path)).unwrap();
        assert_eq!(loaded, settings);
        assert_eq!(
            loaded.transport.watch_socket_path().unwrap(),
            dir.path().join("w.sock")
        );
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "session = 3").unwrap();
        assert!(Settings::load(Some(&path)).is_err());
    }
}
