use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Runtime configuration, normally read once from the environment.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Config {
    /// Keep intermediate compiler artifacts and linked program images on disk.
    pub leave_compiler_temp_files: bool,
    /// Log transfers and compiler invocations at `info` level, with throughput figures.
    pub verbose: bool,
    /// Drivers allowed to report devices. `None` allows every driver.
    pub devices: Option<Vec<String>>,
    /// Upper bound on waiting for a core to signal completion.
    pub poll_timeout: Option<Duration>,
}

impl Config {
    pub const LEAVE_COMPILER_TEMP_FILES: &str = "HEDDLE_LEAVE_KERNEL_COMPILER_TEMP_FILES";
    pub const VERBOSE: &str = "HEDDLE_VERBOSE";
    pub const DEVICES: &str = "HEDDLE_DEVICES";
    pub const POLL_TIMEOUT_MS: &str = "HEDDLE_POLL_TIMEOUT_MS";

    /// Reads the configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the configuration through an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let flag = |key: &str| lookup(key).as_deref().is_some_and(parse_bool);

        let devices = lookup(Self::DEVICES).map(|value| {
            value
                .split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_lowercase)
                .collect()
        });

        let poll_timeout = lookup(Self::POLL_TIMEOUT_MS).and_then(|value| {
            match value.trim().parse::<u64>() {
                Ok(0) => None,
                Ok(ms) => Some(Duration::from_millis(ms)),
                Err(err) => {
                    log::warn!("ignoring {}={value}: {err}", Self::POLL_TIMEOUT_MS);
                    None
                }
            }
        });

        Self {
            leave_compiler_temp_files: flag(Self::LEAVE_COMPILER_TEMP_FILES),
            verbose: flag(Self::VERBOSE),
            devices,
            poll_timeout,
        }
    }

    /// Whether the driver named `driver` may report devices.
    pub fn allows_driver(&self, driver: &str) -> bool {
        match &self.devices {
            Some(devices) => devices.iter().any(|name| name.eq_ignore_ascii_case(driver)),
            None => true,
        }
    }

    /// Log level used for transfers and compiler invocations.
    #[inline]
    pub fn transfer_level(&self) -> log::Level {
        match self.verbose {
            true => log::Level::Info,
            false => log::Level::Debug,
        }
    }
}

/// Parses a boolean toggle; accepts `1`, `true`, `yes` and `on` in any case.
pub fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rustc_hash::FxHashMap as HashMap;

    use super::{Config, parse_bool};

    #[test]
    fn test_parse_bool() {
        for value in ["1", "true", "TRUE", "Yes", " on "] {
            assert!(parse_bool(value), "{value}");
        }
        for value in ["0", "false", "off", "", "2"] {
            assert!(!parse_bool(value), "{value}");
        }
    }

    #[test]
    fn test_from_lookup() {
        let vars: HashMap<&str, &str> = [
            (Config::LEAVE_COMPILER_TEMP_FILES, "1"),
            (Config::DEVICES, "host, Softcore,,"),
            (Config::POLL_TIMEOUT_MS, "250"),
        ]
        .into_iter()
        .collect();
        let config = Config::from_lookup(|key| vars.get(key).map(|value| value.to_string()));

        assert!(config.leave_compiler_temp_files);
        assert!(!config.verbose);
        assert_eq!(config.poll_timeout, Some(Duration::from_millis(250)));
        assert!(config.allows_driver("host"));
        assert!(config.allows_driver("softcore"));
        assert!(!config.allows_driver("gpu"));

        let config = Config::from_lookup(|_| None);
        assert_eq!(config, Config::default());
        assert!(config.allows_driver("anything"));
    }

    #[test]
    fn test_bad_timeout() {
        let config = Config::from_lookup(|key| {
            (key == Config::POLL_TIMEOUT_MS).then(|| "soon".to_string())
        });
        assert_eq!(config.poll_timeout, None);
    }
}
