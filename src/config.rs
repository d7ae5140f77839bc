// ABOUTME: Configuration loading for toolgate.
// ABOUTME: Reads ~/.toolgate/config.toml and resolves the tiered rule directories.

use std::path::PathBuf;

use serde::Deserialize;

use crate::policy::types::{ApprovalMode, Decision, RuleTier};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub policy: PolicySettings,
    pub checkers: CheckerSettings,
}

/// Policy evaluation settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PolicySettings {
    pub mode: ApprovalMode,
    pub non_interactive: bool,
    pub default_decision: Decision,
    pub confirmation_timeout_ms: u64,
}

impl Default for PolicySettings {
    fn default() -> Self {
        Self {
            mode: ApprovalMode::Suggest,
            non_interactive: false,
            default_decision: Decision::AskUser,
            confirmation_timeout_ms: crate::confirm::DEFAULT_CONFIRMATION_TIMEOUT_MS,
        }
    }
}

/// Safety checker settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CheckerSettings {
    /// Directory scanned for external checker executables.
    pub dir: Option<PathBuf>,
    pub timeout_ms: u64,
}

impl Default for CheckerSettings {
    fn default() -> Self {
        Self {
            dir: None,
            timeout_ms: crate::checker::DEFAULT_CHECKER_TIMEOUT_MS,
        }
    }
}

impl Config {
    /// Load config from ~/.toolgate/config.toml, falling back to defaults.
    pub fn load() -> anyhow::Result<Self> {
        let path = Self::config_path();
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Path to the config file.
    pub fn config_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".toolgate")
            .join("config.toml")
    }

    /// The tiered rule directories in precedence order: bundled defaults
    /// are outranked by the user directory, which is outranked by the
    /// system-wide admin directory.
    pub fn rule_dirs() -> Vec<(PathBuf, RuleTier)> {
        let user_dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".toolgate")
            .join("rules.d");
        vec![
            (PathBuf::from("/usr/share/toolgate/rules.d"), RuleTier::Default),
            (user_dir, RuleTier::User),
            (PathBuf::from("/etc/toolgate/rules.d"), RuleTier::Admin),
        ]
    }
}
