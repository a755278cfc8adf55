// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::str::FromStr;
use std::time::Duration;

/// Action taken when the engine reports an unhandled exception.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnhandledExceptionAction {
    /// Schedule cancellation in the engine.
    Cancel,
    /// Terminate the instance with the exception as reason.
    Terminate,
    /// Unlock the durable record without saving and abort the in-memory instance.
    Abandon,
    /// Mark the durable record suspended, unlock it and abort the in-memory instance.
    #[default]
    AbandonAndSuspend,
}

impl UnhandledExceptionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cancel => "cancel",
            Self::Terminate => "terminate",
            Self::Abandon => "abandon",
            Self::AbandonAndSuspend => "abandon_and_suspend",
        }
    }
}

impl FromStr for UnhandledExceptionAction {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cancel" => Ok(Self::Cancel),
            "terminate" => Ok(Self::Terminate),
            "abandon" => Ok(Self::Abandon),
            "abandon_and_suspend" | "abandonandsuspend" => Ok(Self::AbandonAndSuspend),
            _ => Err(ConfigError::Invalid(
                "SOJOURN_UNHANDLED_EXCEPTION_ACTION",
                "must be one of cancel, terminate, abandon, abandon_and_suspend",
            )),
        }
    }
}

/// Idle timings driving the unload policy.
///
/// `None` disables the corresponding timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnloadTimings {
    pub time_to_persist: Option<Duration>,
    pub time_to_unload: Option<Duration>,
}

impl Default for UnloadTimings {
    fn default() -> Self {
        Self {
            time_to_persist: None,
            time_to_unload: Some(Duration::from_secs(60)),
        }
    }
}

impl UnloadTimings {
    /// Persist-before-unload applies when the persist timer fires strictly
    /// before the unload timer.
    pub fn persist_enabled(&self, can_persist: bool) -> bool {
        match (self.time_to_persist, self.time_to_unload) {
            (Some(persist), Some(unload)) => can_persist && persist < unload,
            (Some(_), None) => can_persist,
            (None, _) => false,
        }
    }

    pub fn unload_enabled(&self, can_persist: bool) -> bool {
        can_persist && self.time_to_unload.is_some()
    }
}

/// Sojourn host configuration
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// SQLite connection URL for the bundled store (in-memory hosting when unset)
    pub database_url: Option<String>,
    /// Maximum number of instances resident in the directory
    pub max_instances: usize,
    /// Idle persist/unload timings
    pub unload: UnloadTimings,
    /// Timeout for storage saves issued by the controller
    pub persist_timeout: Duration,
    /// Timeout for flushing tracking records
    pub track_timeout: Duration,
    /// Timeout for background execution lock acquisition (aborts, policy timers)
    pub lock_timeout: Duration,
    /// Reaction to unhandled engine exceptions
    pub unhandled_exception_action: UnhandledExceptionAction,
    /// Persist key associations as soon as they are made
    pub keys_globally_consistent: bool,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            max_instances: 32,
            unload: UnloadTimings::default(),
            persist_timeout: Duration::from_secs(30),
            track_timeout: Duration::from_secs(30),
            lock_timeout: Duration::from_secs(30),
            unhandled_exception_action: UnhandledExceptionAction::default(),
            keys_globally_consistent: false,
        }
    }
}

impl HostConfig {
    /// Load a `.env` file if present, then read the environment.
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_env()
    }

    /// Load configuration from environment variables.
    ///
    /// All variables are optional:
    /// - `SOJOURN_DATABASE_URL`: SQLite connection string for the bundled store
    /// - `SOJOURN_MAX_INSTANCES`: resident instance limit (default: 32)
    /// - `SOJOURN_TIME_TO_PERSIST_MS`: idle time before persisting (default: disabled)
    /// - `SOJOURN_TIME_TO_UNLOAD_MS`: idle time before unloading, or `never` (default: 60000)
    /// - `SOJOURN_PERSIST_TIMEOUT_MS`, `SOJOURN_TRACK_TIMEOUT_MS`, `SOJOURN_LOCK_TIMEOUT_MS` (default: 30000)
    /// - `SOJOURN_UNHANDLED_EXCEPTION_ACTION`: `cancel`, `terminate`, `abandon` or
    ///   `abandon_and_suspend` (default)
    /// - `SOJOURN_KEYS_GLOBALLY_CONSISTENT`: `true`/`false` (default: false)
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let database_url = std::env::var("SOJOURN_DATABASE_URL")
            .ok()
            .filter(|url| !url.trim().is_empty());

        let max_instances: usize = match std::env::var("SOJOURN_MAX_INSTANCES") {
            Ok(raw) => raw.parse().ok().filter(|n| *n > 0).ok_or(ConfigError::Invalid(
                "SOJOURN_MAX_INSTANCES",
                "must be a positive integer",
            ))?,
            Err(_) => defaults.max_instances,
        };

        let time_to_persist = optional_millis("SOJOURN_TIME_TO_PERSIST_MS")?;
        let time_to_unload = match std::env::var("SOJOURN_TIME_TO_UNLOAD_MS") {
            Ok(raw) if raw.trim().eq_ignore_ascii_case("never") => None,
            Ok(raw) => Some(parse_millis("SOJOURN_TIME_TO_UNLOAD_MS", &raw)?),
            Err(_) => defaults.unload.time_to_unload,
        };

        let persist_timeout =
            optional_millis("SOJOURN_PERSIST_TIMEOUT_MS")?.unwrap_or(defaults.persist_timeout);
        let track_timeout =
            optional_millis("SOJOURN_TRACK_TIMEOUT_MS")?.unwrap_or(defaults.track_timeout);
        let lock_timeout =
            optional_millis("SOJOURN_LOCK_TIMEOUT_MS")?.unwrap_or(defaults.lock_timeout);

        let unhandled_exception_action = match std::env::var("SOJOURN_UNHANDLED_EXCEPTION_ACTION")
        {
            Ok(raw) => raw.parse()?,
            Err(_) => defaults.unhandled_exception_action,
        };

        let keys_globally_consistent = match std::env::var("SOJOURN_KEYS_GLOBALLY_CONSISTENT") {
            Ok(raw) => raw.trim().parse().map_err(|_| {
                ConfigError::Invalid("SOJOURN_KEYS_GLOBALLY_CONSISTENT", "must be true or false")
            })?,
            Err(_) => defaults.keys_globally_consistent,
        };

        Ok(Self {
            database_url,
            max_instances,
            unload: UnloadTimings {
                time_to_persist,
                time_to_unload,
            },
            persist_timeout,
            track_timeout,
            lock_timeout,
            unhandled_exception_action,
            keys_globally_consistent,
        })
    }
}

fn optional_millis(var: &'static str) -> Result<Option<Duration>, ConfigError> {
    match std::env::var(var) {
        Ok(raw) => parse_millis(var, &raw).map(Some),
        Err(_) => Ok(None),
    }
}

fn parse_millis(var: &'static str, raw: &str) -> Result<Duration, ConfigError> {
    raw.trim()
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|_| ConfigError::Invalid(var, "must be a number of milliseconds"))
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that modify environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const ALL_VARS: &[&str] = &[
        "SOJOURN_DATABASE_URL",
        "SOJOURN_MAX_INSTANCES",
        "SOJOURN_TIME_TO_PERSIST_MS",
        "SOJOURN_TIME_TO_UNLOAD_MS",
        "SOJOURN_PERSIST_TIMEOUT_MS",
        "SOJOURN_TRACK_TIMEOUT_MS",
        "SOJOURN_LOCK_TIMEOUT_MS",
        "SOJOURN_UNHANDLED_EXCEPTION_ACTION",
        "SOJOURN_KEYS_GLOBALLY_CONSISTENT",
    ];

    /// Helper to set env vars for a test and restore them after
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn clean() -> Self {
            let mut guard = Self { vars: Vec::new() };
            for var in ALL_VARS {
                guard.remove(var);
            }
            guard
        }

        fn set(&mut self, key: &str, value: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::set_var(key, value) };
        }

        fn remove(&mut self, key: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::remove_var(key) };
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..).rev() {
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
                unsafe {
                    match value {
                        Some(v) => env::set_var(&key, v),
                        None => env::remove_var(&key),
                    }
                }
            }
        }
    }

    #[test]
    fn test_config_from_env_with_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let _guard = EnvGuard::clean();

        let config = HostConfig::from_env().unwrap();

        assert!(config.database_url.is_none());
        assert_eq!(config.max_instances, 32);
        assert_eq!(config.unload.time_to_persist, None);
        assert_eq!(config.unload.time_to_unload, Some(Duration::from_secs(60)));
        assert_eq!(config.persist_timeout, Duration::from_secs(30));
        assert_eq!(
            config.unhandled_exception_action,
            UnhandledExceptionAction::AbandonAndSuspend
        );
        assert!(!config.keys_globally_consistent);
    }

    #[test]
    fn test_config_from_env_all_custom() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();

        guard.set("SOJOURN_DATABASE_URL", "sqlite:instances.db");
        guard.set("SOJOURN_MAX_INSTANCES", "8");
        guard.set("SOJOURN_TIME_TO_PERSIST_MS", "500");
        guard.set("SOJOURN_TIME_TO_UNLOAD_MS", "2000");
        guard.set("SOJOURN_PERSIST_TIMEOUT_MS", "1500");
        guard.set("SOJOURN_LOCK_TIMEOUT_MS", "250");
        guard.set("SOJOURN_UNHANDLED_EXCEPTION_ACTION", "Terminate");
        guard.set("SOJOURN_KEYS_GLOBALLY_CONSISTENT", "true");

        let config = HostConfig::from_env().unwrap();

        assert_eq!(config.database_url.as_deref(), Some("sqlite:instances.db"));
        assert_eq!(config.max_instances, 8);
        assert_eq!(config.unload.time_to_persist, Some(Duration::from_millis(500)));
        assert_eq!(config.unload.time_to_unload, Some(Duration::from_secs(2)));
        assert_eq!(config.persist_timeout, Duration::from_millis(1500));
        assert_eq!(config.lock_timeout, Duration::from_millis(250));
        assert_eq!(config.track_timeout, Duration::from_secs(30));
        assert_eq!(
            config.unhandled_exception_action,
            UnhandledExceptionAction::Terminate
        );
        assert!(config.keys_globally_consistent);
    }

    #[test]
    fn test_config_unload_never() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();

        guard.set("SOJOURN_TIME_TO_UNLOAD_MS", "never");
        guard.set("SOJOURN_TIME_TO_PERSIST_MS", "100");

        let config = HostConfig::from_env().unwrap();

        assert_eq!(config.unload.time_to_unload, None);
        assert!(config.unload.persist_enabled(true));
        assert!(!config.unload.unload_enabled(true));
    }

    #[test]
    fn test_config_invalid_max_instances() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();

        guard.set("SOJOURN_MAX_INSTANCES", "0");
        let err = HostConfig::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("SOJOURN_MAX_INSTANCES", _)));

        guard.set("SOJOURN_MAX_INSTANCES", "lots");
        let err = HostConfig::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("SOJOURN_MAX_INSTANCES", _)));
    }

    #[test]
    fn test_config_invalid_timings() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();

        guard.set("SOJOURN_TIME_TO_PERSIST_MS", "-1");
        let err = HostConfig::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("SOJOURN_TIME_TO_PERSIST_MS", _)));
    }

    #[test]
    fn test_config_invalid_unhandled_exception_action() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();

        guard.set("SOJOURN_UNHANDLED_EXCEPTION_ACTION", "ignore");
        let err = HostConfig::from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid("SOJOURN_UNHANDLED_EXCEPTION_ACTION", _)
        ));
    }

    #[test]
    fn test_persist_enabled_requires_persist_before_unload() {
        let timings = UnloadTimings {
            time_to_persist: Some(Duration::from_secs(5)),
            time_to_unload: Some(Duration::from_secs(5)),
        };
        assert!(!timings.persist_enabled(true));
        assert!(timings.unload_enabled(true));

        let timings = UnloadTimings {
            time_to_persist: Some(Duration::from_secs(1)),
            time_to_unload: Some(Duration::from_secs(5)),
        };
        assert!(timings.persist_enabled(true));
        assert!(!timings.persist_enabled(false));
        assert!(!timings.unload_enabled(false));
    }

    #[test]
    fn test_config_error_display() {
        let invalid = ConfigError::Invalid("MY_VAR", "must be a number");
        assert_eq!(
            invalid.to_string(),
            "invalid value for MY_VAR: must be a number"
        );
    }
}
