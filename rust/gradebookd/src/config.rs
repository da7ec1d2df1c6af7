use anyhow::{anyhow, Context};
use std::path::PathBuf;
use std::time::Duration;

pub const ENV_LOG_LEVEL: &str = "GRADEBOOKD_LOG_LEVEL";
pub const ENV_LOG_DIR: &str = "GRADEBOOKD_LOG_DIR";
pub const ENV_AUTOSAVE_DELAY_MS: &str = "GRADEBOOKD_AUTOSAVE_DELAY_MS";

pub const MIN_AUTOSAVE_DELAY_MS: u64 = 100;
pub const MAX_AUTOSAVE_DELAY_MS: u64 = 60_000;
const DEFAULT_AUTOSAVE_DELAY_MS: u64 = 2000;

/// Process-level settings read once at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct DaemonConfig {
    pub log_level: &'static str,
    pub log_dir: Option<PathBuf>,
    pub autosave_delay: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_dir: None,
            autosave_delay: Duration::from_millis(DEFAULT_AUTOSAVE_DELAY_MS),
        }
    }
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        if let Some(level) = lookup(ENV_LOG_LEVEL).filter(|s| !s.trim().is_empty()) {
            cfg.log_level = normalize_level(&level)?;
        }
        if let Some(dir) = lookup(ENV_LOG_DIR).filter(|s| !s.trim().is_empty()) {
            let path = PathBuf::from(dir.trim());
            if !path.is_absolute() {
                return Err(anyhow!(
                    "{} must be an absolute path, got `{}`",
                    ENV_LOG_DIR,
                    dir
                ));
            }
            cfg.log_dir = Some(path);
        }
        if let Some(raw) = lookup(ENV_AUTOSAVE_DELAY_MS).filter(|s| !s.trim().is_empty()) {
            let ms: u64 = raw
                .trim()
                .parse()
                .with_context(|| format!("{} must be an integer", ENV_AUTOSAVE_DELAY_MS))?;
            if !(MIN_AUTOSAVE_DELAY_MS..=MAX_AUTOSAVE_DELAY_MS).contains(&ms) {
                return Err(anyhow!(
                    "{} must be in {}..={}",
                    ENV_AUTOSAVE_DELAY_MS,
                    MIN_AUTOSAVE_DELAY_MS,
                    MAX_AUTOSAVE_DELAY_MS
                ));
            }
            cfg.autosave_delay = Duration::from_millis(ms);
        }
        Ok(cfg)
    }
}

pub fn default_log_level() -> &'static str {
    if cfg!(debug_assertions) {
        "debug"
    } else {
        "info"
    }
}

pub fn normalize_level(level: &str) -> anyhow::Result<&'static str> {
    match level.trim().to_ascii_lowercase().as_str() {
        "trace" => Ok("trace"),
        "debug" => Ok("debug"),
        "info" => Ok("info"),
        "warn" | "warning" => Ok("warn"),
        "error" => Ok("error"),
        other => Err(anyhow!(
            "unsupported log level `{other}`; expected trace|debug|info|warn|error"
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> anyhow::Result<DaemonConfig> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        DaemonConfig::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn empty_environment_gives_defaults() {
        let cfg = from_pairs(&[]).expect("defaults");
        assert_eq!(cfg, DaemonConfig::default());
        assert_eq!(cfg.autosave_delay, Duration::from_millis(2000));
    }

    #[test]
    fn values_are_normalized_and_validated() {
        let cfg = from_pairs(&[
            (ENV_LOG_LEVEL, " Warning "),
            (ENV_AUTOSAVE_DELAY_MS, "750"),
        ])
        .expect("valid");
        assert_eq!(cfg.log_level, "warn");
        assert_eq!(cfg.autosave_delay, Duration::from_millis(750));

        assert!(from_pairs(&[(ENV_LOG_LEVEL, "loud")]).is_err());
        assert!(from_pairs(&[(ENV_AUTOSAVE_DELAY_MS, "5")]).is_err());
        assert!(from_pairs(&[(ENV_AUTOSAVE_DELAY_MS, "soon")]).is_err());
        assert!(from_pairs(&[(ENV_LOG_DIR, "logs/dev")]).is_err());
    }
}
