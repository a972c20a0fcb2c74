// ABOUTME: Runtime settings for the sandbox manager loaded from the environment
// ABOUTME: Concurrency caps, TTL bounds, output ceilings, terminal defaults and sweep cadence

use crate::error::{Result, SandboxError};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxSettings {
    // Sources
    pub registry_path: PathBuf,
    pub languages_path: Option<PathBuf>,

    // Admission control
    pub max_concurrent_sessions: usize,

    // Lifecycle
    pub sweep_interval_secs: u64,
    pub max_session_ttl_secs: u64,
    pub stop_timeout_secs: u64,
    pub image_timeout_secs: u64,
    pub terminated_retention_secs: u64,
    pub engine_availability_ttl_secs: u64,

    // Execution
    pub default_exec_timeout_secs: u64,
    pub max_exec_timeout_secs: u64,
    pub max_output_bytes: usize,
    pub max_code_bytes: usize,

    // Terminal bridge
    pub terminal_port: u16,
    pub terminal_command: String,
    pub terminal_host: String,

    /// Prefix for labels put on every managed container
    pub label_prefix: String,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            registry_path: PathBuf::from("registry.json"),
            languages_path: None,
            max_concurrent_sessions: 8,
            sweep_interval_secs: 30,
            max_session_ttl_secs: 3600,
            stop_timeout_secs: 5,
            image_timeout_secs: 600,
            terminated_retention_secs: 600,
            engine_availability_ttl_secs: 10,
            default_exec_timeout_secs: 30,
            max_exec_timeout_secs: 300,
            max_output_bytes: 1024 * 1024,
            max_code_bytes: 512 * 1024,
            terminal_port: 7681,
            terminal_command: "ttyd".to_string(),
            terminal_host: "localhost".to_string(),
            label_prefix: "sandkeep.sandbox".to_string(),
        }
    }
}

impl SandboxSettings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build settings from an arbitrary key lookup, falling back to defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let settings = Self {
            registry_path: lookup("SANDKEEP_REGISTRY_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.registry_path),
            languages_path: lookup("SANDKEEP_LANGUAGES_PATH")
                .filter(|s| !s.trim().is_empty())
                .map(PathBuf::from),
            max_concurrent_sessions: parse_var(
                &lookup,
                "SANDKEEP_MAX_SESSIONS",
                defaults.max_concurrent_sessions,
            )?,
            sweep_interval_secs: parse_var(
                &lookup,
                "SANDKEEP_SWEEP_INTERVAL_SECS",
                defaults.sweep_interval_secs,
            )?,
            max_session_ttl_secs: parse_var(
                &lookup,
                "SANDKEEP_MAX_TTL_SECS",
                defaults.max_session_ttl_secs,
            )?,
            stop_timeout_secs: parse_var(
                &lookup,
                "SANDKEEP_STOP_TIMEOUT_SECS",
                defaults.stop_timeout_secs,
            )?,
            image_timeout_secs: parse_var(
                &lookup,
                "SANDKEEP_IMAGE_TIMEOUT_SECS",
                defaults.image_timeout_secs,
            )?,
            terminated_retention_secs: parse_var(
                &lookup,
                "SANDKEEP_RETENTION_SECS",
                defaults.terminated_retention_secs,
            )?,
            engine_availability_ttl_secs: defaults.engine_availability_ttl_secs,
            default_exec_timeout_secs: parse_var(
                &lookup,
                "SANDKEEP_EXEC_TIMEOUT_SECS",
                defaults.default_exec_timeout_secs,
            )?,
            max_exec_timeout_secs: parse_var(
                &lookup,
                "SANDKEEP_MAX_EXEC_TIMEOUT_SECS",
                defaults.max_exec_timeout_secs,
            )?,
            max_output_bytes: parse_var(
                &lookup,
                "SANDKEEP_MAX_OUTPUT_BYTES",
                defaults.max_output_bytes,
            )?,
            max_code_bytes: parse_var(&lookup, "SANDKEEP_MAX_CODE_BYTES", defaults.max_code_bytes)?,
            terminal_port: parse_var(&lookup, "SANDKEEP_TERMINAL_PORT", defaults.terminal_port)?,
            terminal_command: lookup("SANDKEEP_TERMINAL_COMMAND")
                .unwrap_or(defaults.terminal_command),
            terminal_host: lookup("SANDKEEP_TERMINAL_HOST").unwrap_or(defaults.terminal_host),
            label_prefix: lookup("SANDKEEP_LABEL_PREFIX").unwrap_or(defaults.label_prefix),
        };

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_sessions == 0 {
            return Err(SandboxError::Config(
                "SANDKEEP_MAX_SESSIONS must be at least 1".to_string(),
            ));
        }
        if self.sweep_interval_secs == 0 {
            return Err(SandboxError::Config(
                "SANDKEEP_SWEEP_INTERVAL_SECS must be at least 1".to_string(),
            ));
        }
        if self.max_session_ttl_secs == 0 {
            return Err(SandboxError::Config(
                "SANDKEEP_MAX_TTL_SECS must be at least 1".to_string(),
            ));
        }
        if self.max_exec_timeout_secs == 0 {
            return Err(SandboxError::Config(
                "SANDKEEP_MAX_EXEC_TIMEOUT_SECS must be at least 1".to_string(),
            ));
        }
        if self.terminal_port == 0 {
            return Err(SandboxError::Config(
                "Terminal port 0 is out of valid range (1-65535)".to_string(),
            ));
        }
        if self.default_exec_timeout_secs == 0
            || self.default_exec_timeout_secs > self.max_exec_timeout_secs
        {
            return Err(SandboxError::Config(format!(
                "Default execution timeout {}s must be between 1 and {}s",
                self.default_exec_timeout_secs, self.max_exec_timeout_secs
            )));
        }
        if self.label_prefix.trim().is_empty() {
            return Err(SandboxError::Config(
                "Label prefix must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Clamp a requested execution timeout to the configured bounds
    pub fn exec_timeout(&self, requested: Option<Duration>) -> Duration {
        let max = Duration::from_secs(self.max_exec_timeout_secs);
        match requested {
            Some(t) if t.is_zero() => Duration::from_secs(self.default_exec_timeout_secs),
            Some(t) => t.min(max),
            None => Duration::from_secs(self.default_exec_timeout_secs),
        }
    }
}

/// Label key marking a container as owned by this manager
pub fn managed_label(label_prefix: &str) -> String {
    format!("{}.managed", label_prefix)
}

fn parse_var<T, F>(lookup: &F, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw.trim().parse::<T>().map_err(|e| {
            SandboxError::Config(format!("Invalid value '{}' for {}: {}", raw, key, e))
        }),
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let settings = SandboxSettings::from_lookup(|_| None).unwrap();
        assert_eq!(settings.max_concurrent_sessions, 8);
        assert_eq!(settings.terminal_port, 7681);
        assert_eq!(
            managed_label(&settings.label_prefix),
            "sandkeep.sandbox.managed"
        );
    }

    #[test]
    fn test_overrides_are_parsed() {
        let settings = SandboxSettings::from_lookup(lookup_from(&[
            ("SANDKEEP_MAX_SESSIONS", "3"),
            ("SANDKEEP_SWEEP_INTERVAL_SECS", "5"),
            ("SANDKEEP_REGISTRY_PATH", "/etc/sandkeep/registry.toml"),
        ]))
        .unwrap();
        assert_eq!(settings.max_concurrent_sessions, 3);
        assert_eq!(settings.sweep_interval(), Duration::from_secs(5));
        assert_eq!(
            settings.registry_path,
            PathBuf::from("/etc/sandkeep/registry.toml")
        );
    }

    #[test]
    fn test_invalid_number_is_config_error() {
        let err = SandboxSettings::from_lookup(lookup_from(&[("SANDKEEP_MAX_SESSIONS", "many")]))
            .unwrap_err();
        assert!(matches!(err, SandboxError::Config(_)));
        assert!(err.to_string().contains("SANDKEEP_MAX_SESSIONS"));
    }

    #[rstest]
    #[case("SANDKEEP_MAX_SESSIONS")]
    #[case("SANDKEEP_MAX_TTL_SECS")]
    #[case("SANDKEEP_MAX_EXEC_TIMEOUT_SECS")]
    #[case("SANDKEEP_SWEEP_INTERVAL_SECS")]
    fn test_zero_limit_rejected(#[case] key: &str) {
        let err = SandboxSettings::from_lookup(lookup_from(&[(key, "0")])).unwrap_err();
        assert!(matches!(err, SandboxError::Config(_)));
        assert!(err.to_string().contains(key));
    }

    #[test]
    fn test_exec_timeout_clamped() {
        let settings = SandboxSettings::default();
        assert_eq!(settings.exec_timeout(None), Duration::from_secs(30));
        assert_eq!(
            settings.exec_timeout(Some(Duration::from_secs(10_000))),
            Duration::from_secs(300)
        );
        assert_eq!(
            settings.exec_timeout(Some(Duration::from_millis(1500))),
            Duration::from_millis(1500)
        );
    }
}
