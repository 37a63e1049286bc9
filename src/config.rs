use ngbs_icon_lib::{
    discovery,
    poller::{PollPolicy, PollSettings},
    service_client,
};
use serde::Deserialize;
use std::fs::File;
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "icon.yml";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Timeout of a single request
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    /// Time each host gets to answer during a scan
    #[serde(default = "default_scan_timeout", with = "humantime_serde")]
    pub scan_timeout: Duration,
    #[serde(default)]
    pub poll: PollConfig,
}

fn default_timeout() -> Duration {
    service_client::DEFAULT_TIMEOUT
}

fn default_scan_timeout() -> Duration {
    discovery::DEFAULT_SCAN_TIMEOUT
}

impl Default for Config {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
            scan_timeout: default_scan_timeout(),
            poll: PollConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyConfig {
    /// Zero is rejected, every polled write reads the device at least once.
    pub attempts: NonZeroU32,
    #[serde(with = "humantime_serde")]
    pub delay: Duration,
}

impl From<PollPolicy> for PolicyConfig {
    fn from(policy: PollPolicy) -> Self {
        Self {
            attempts: NonZeroU32::new(policy.attempts).unwrap_or(NonZeroU32::MIN),
            delay: policy.delay,
        }
    }
}

impl From<PolicyConfig> for PollPolicy {
    fn from(config: PolicyConfig) -> Self {
        PollPolicy::new(config.attempts.get(), config.delay)
    }
}

fn default_thermostat_policy() -> PolicyConfig {
    PollPolicy::THERMOSTAT.into()
}

fn default_master_policy() -> PolicyConfig {
    PollPolicy::MASTER.into()
}

fn default_mode_flip_policy() -> PolicyConfig {
    PollPolicy::MODE_FLIP.into()
}

/// Budgets for waiting on writes.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PollConfig {
    #[serde(default = "default_thermostat_policy")]
    pub thermostat: PolicyConfig,
    #[serde(default = "default_master_policy")]
    pub master: PolicyConfig,
    #[serde(default = "default_mode_flip_policy")]
    pub mode_flip: PolicyConfig,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            thermostat: default_thermostat_policy(),
            master: default_master_policy(),
            mode_flip: default_mode_flip_policy(),
        }
    }
}

impl From<PollConfig> for PollSettings {
    fn from(config: PollConfig) -> Self {
        PollSettings {
            thermostat: config.thermostat.into(),
            master: config.master.into(),
            mode_flip: config.mode_flip.into(),
        }
    }
}

/// Loads the configuration.
///
/// An explicitly given file must exist. Without one, `icon.yml` in the
/// working directory is used when present, otherwise the defaults.
pub fn get_config(path: Option<&Path>) -> anyhow::Result<Config> {
    let path: PathBuf = match path {
        Some(path) => path.to_path_buf(),
        None if Path::new(DEFAULT_CONFIG_FILE).exists() => PathBuf::from(DEFAULT_CONFIG_FILE),
        None => return Ok(Config::default()),
    };
    log::debug!("Loading config file from {:?}", &path);
    let config_file = File::open(&path)?;
    let config: Config = serde_yaml::from_reader(&config_file)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(PollSettings::from(config.poll), PollSettings::default());
    }

    #[test]
    fn overrides() {
        let config: Config = serde_yaml::from_str(
            "timeout: 5s\npoll:\n  master:\n    attempts: 40\n    delay: 1s\n",
        )
        .unwrap();
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.scan_timeout, discovery::DEFAULT_SCAN_TIMEOUT);
        let poll = PollSettings::from(config.poll);
        assert_eq!(poll.master, PollPolicy::new(40, Duration::from_secs(1)));
        assert_eq!(poll.thermostat, PollPolicy::THERMOSTAT);
    }

    #[test]
    fn zero_attempts_are_rejected() {
        let yaml = "poll:\n  thermostat:\n    attempts: 0\n    delay: 1s\n";
        assert!(serde_yaml::from_str::<Config>(yaml).is_err());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(serde_yaml::from_str::<Config>("timeuot: 5s").is_err());
    }
}
