// Session defaults and configuration layering.
use serde::Deserialize;
use std::fs;

use crate::error::{Result, SessionError};

/// Default number of prefetched messages at which the channel is suspended.
pub const DEFAULT_PREFETCH_HIGH_MARK: usize = 5000;

/// Default number of prefetched messages below which the channel is resumed.
pub const DEFAULT_PREFETCH_LOW_MARK: usize = 2500;

/// Producers ask the broker to bounce unroutable messages by default.
pub const DEFAULT_MANDATORY: bool = true;

/// Producers do not require a ready consumer by default.
pub const DEFAULT_IMMEDIATE: bool = false;

/// Process-wide session switches, injected at session construction.
///
/// ```
/// use tern_session::SessionSettings;
///
/// let settings = SessionSettings::default();
/// assert!(!settings.strict);
/// assert_eq!(settings.prefetch_high, 5000);
/// ```
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Reject or degrade operations strict protocol compliance cannot cover.
    pub strict: bool,
    /// Under strict compliance, fail instead of degrading.
    pub strict_fatal: bool,
    /// Let the broker push the prefetch window as soon as subscribe returns.
    pub immediate_prefetch: bool,
    pub prefetch_high: usize,
    pub prefetch_low: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            strict: false,
            strict_fatal: true,
            immediate_prefetch: false,
            prefetch_high: DEFAULT_PREFETCH_HIGH_MARK,
            prefetch_low: DEFAULT_PREFETCH_LOW_MARK,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
struct SettingsOverride {
    strict: Option<bool>,
    strict_fatal: Option<bool>,
    immediate_prefetch: Option<bool>,
    prefetch_high: Option<usize>,
    prefetch_low: Option<usize>,
}

impl SettingsOverride {
    fn apply(&self, settings: &mut SessionSettings) {
        if let Some(value) = self.strict {
            settings.strict = value;
        }
        if let Some(value) = self.strict_fatal {
            settings.strict_fatal = value;
        }
        if let Some(value) = self.immediate_prefetch {
            settings.immediate_prefetch = value;
        }
        if let Some(value) = self.prefetch_high
            && value > 0
        {
            settings.prefetch_high = value;
        }
        if let Some(value) = self.prefetch_low {
            settings.prefetch_low = value;
        }
    }
}

impl SessionSettings {
    /// Defaults overridden by `TERN_*` environment variables.
    pub fn from_env() -> Self {
        let mut settings = Self::default();
        if let Some(value) = read_bool_env("TERN_STRICT_AMQP") {
            settings.strict = value;
        }
        if let Some(value) = read_bool_env("TERN_STRICT_AMQP_FATAL") {
            settings.strict_fatal = value;
        }
        if let Some(value) = read_bool_env("TERN_IMMEDIATE_PREFETCH") {
            settings.immediate_prefetch = value;
        }
        if let Some(value) = read_usize_env("TERN_PREFETCH_HIGH") {
            settings.prefetch_high = value;
        }
        if let Some(value) = read_usize_env("TERN_PREFETCH_LOW") {
            settings.prefetch_low = value;
        }
        settings
    }

    /// Environment layering plus an optional YAML override file, either the
    /// given path or `TERN_SESSION_CONFIG`.
    pub fn from_env_or_yaml(config_path: Option<&str>) -> Result<Self> {
        let mut settings = Self::from_env();
        let override_path = config_path
            .map(|value| value.to_string())
            .or_else(|| std::env::var("TERN_SESSION_CONFIG").ok());
        if let Some(path) = override_path.as_deref() {
            let contents = fs::read_to_string(path)
                .map_err(|err| SessionError::Config(format!("read session config {path}: {err}")))?;
            let override_cfg: SettingsOverride = serde_yaml::from_str(&contents)
                .map_err(|err| SessionError::Config(format!("parse session config yaml: {err}")))?;
            override_cfg.apply(&mut settings);
        }
        Ok(settings)
    }

    /// Strict compliance forbids delaying the prefetch window, so strict
    /// sessions always prefetch immediately.
    pub fn effective_immediate_prefetch(&self) -> bool {
        self.strict || self.immediate_prefetch
    }
}

fn read_bool_env(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
}

fn read_usize_env(key: &str) -> Option<usize> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_marks() {
        let settings = SessionSettings::default();
        assert_eq!(settings.prefetch_high, 5000);
        assert_eq!(settings.prefetch_low, 2500);
        assert!(!settings.strict);
        assert!(settings.strict_fatal);
        assert!(!settings.immediate_prefetch);
    }

    #[test]
    fn strict_implies_immediate_prefetch() {
        let settings = SessionSettings {
            strict: true,
            immediate_prefetch: false,
            ..SessionSettings::default()
        };
        assert!(settings.effective_immediate_prefetch());
    }

    #[test]
    fn yaml_override_wins_over_defaults() {
        let mut settings = SessionSettings::default();
        let override_cfg: SettingsOverride =
            serde_yaml::from_str("strict: true\nprefetch_high: 100\nprefetch_low: 50\n")
                .expect("parse");
        override_cfg.apply(&mut settings);
        assert!(settings.strict);
        assert_eq!(settings.prefetch_high, 100);
        assert_eq!(settings.prefetch_low, 50);
    }

    #[test]
    fn zero_prefetch_high_override_is_ignored() {
        let mut settings = SessionSettings::default();
        let override_cfg: SettingsOverride =
            serde_yaml::from_str("prefetch_high: 0\n").expect("parse");
        override_cfg.apply(&mut settings);
        assert_eq!(settings.prefetch_high, DEFAULT_PREFETCH_HIGH_MARK);
    }
}
