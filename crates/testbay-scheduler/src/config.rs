//! Configuration types for the scheduler.

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::Deserialize;

use crate::error::SchedulerResult;
use crate::scheduler::DEFAULT_SYSTEM_ACTOR;

/// Scheduler configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Tick loop configuration.
    pub tick: TickConfig,
    /// Device policy sources.
    pub policy: PolicyConfig,
    /// Initial fleet.
    pub fleet: FleetConfig,
    /// Event publication.
    pub events: EventsConfig,
    /// Submitter of injected health checks and actor of automated audit
    /// entries.
    pub health_check_submitter: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick: TickConfig::default(),
            policy: PolicyConfig::default(),
            fleet: FleetConfig::default(),
            events: EventsConfig::default(),
            health_check_submitter: DEFAULT_SYSTEM_ACTOR.to_owned(),
        }
    }
}

impl SchedulerConfig {
    /// Loads configuration from the default path (`testbay.toml`).
    pub fn load() -> SchedulerResult<Self> {
        Self::load_from("testbay.toml")
    }

    /// Loads configuration from a TOML file. A missing file yields the
    /// defaults.
    ///
    /// Environment variables prefixed with `TESTBAY_` override file
    /// settings; nested keys are separated by `__`, e.g.
    /// `TESTBAY_TICK__PING_TIMEOUT=90`.
    pub fn load_from(path: impl AsRef<Path>) -> SchedulerResult<Self> {
        let config = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("TESTBAY_").split("__"))
            .extract()?;
        Ok(config)
    }

    /// Parses configuration from a TOML string.
    pub fn parse(content: &str) -> SchedulerResult<Self> {
        let config = Figment::new().merge(Toml::string(content)).extract()?;
        Ok(config)
    }
}

/// Tick loop configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TickConfig {
    /// Maximum time between ticks.
    #[serde(with = "serde_duration_secs")]
    pub interval: Duration,
    /// Silence after which an online worker is moved offline.
    #[serde(with = "serde_duration_secs")]
    pub ping_timeout: Duration,
    /// Pins the device shuffle.
    pub seed: Option<u64>,
}

impl Default for TickConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(20),
            ping_timeout: Duration::from_secs(60),
            seed: None,
        }
    }
}

/// Device policy sources.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Directory of `<hostname>.yaml` device dictionaries.
    pub devices_dir: Option<PathBuf>,
    /// Directory of `<name>.yaml` health-check bodies.
    pub health_checks_dir: Option<PathBuf>,
}

impl PolicyConfig {
    /// Both directories, when configured.
    #[must_use]
    pub fn dirs(&self) -> Option<(&Path, &Path)> {
        Some((self.devices_dir.as_deref()?, self.health_checks_dir.as_deref()?))
    }
}

/// Initial fleet.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    /// YAML file of device types, workers, devices and queued jobs.
    pub seed_file: Option<PathBuf>,
}

/// Event publication.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Broadcast channel capacity.
    pub capacity: usize,
    /// Topic prefix.
    pub topic_prefix: String,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            topic_prefix: "org.testbay".to_owned(),
        }
    }
}

/// Serde helper for Duration as seconds.
mod serde_duration_secs {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
