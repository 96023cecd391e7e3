//! `dblint.toml` configuration.

use anyhow::{Context, Result};
use loader::{Category, RuleSelection, Severity};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const CONFIG_FILE: &str = "dblint.toml";

#[cfg(windows)]
pub fn config_dir() -> PathBuf {
    std::env::var("APPDATA")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
        .join("dblint")
}

#[cfg(not(windows))]
pub fn config_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(".config")
        .join("dblint")
}

#[derive(Debug, Serialize, Deserialize, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RulesConfig {
    #[serde(default)]
    pub enable: Vec<String>,
    #[serde(default)]
    pub disable: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PathsConfig {
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct EngineSection {
    pub max_steps: Option<usize>,
    pub unit_timeout_ms: Option<u64>,
    pub threads: Option<usize>,
    pub suppress_comment: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub rules: RulesConfig,
    /// Category name to severity name.
    #[serde(default)]
    pub severity: BTreeMap<String, String>,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub policy: BTreeMap<String, bool>,
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub catalog_dirs: Vec<PathBuf>,
}

impl Config {
    pub fn parse(content: &str, origin: &Path) -> Result<Self> {
        toml::from_str(content).with_context(|| format!("failed to parse {}", origin.display()))
    }

    /// Rule selection described by the `[rules]` and `[severity]` sections.
    pub fn selection(&self) -> Result<RuleSelection> {
        let mut severity = BTreeMap::new();
        for (cat, sev) in &self.severity {
            let cat: Category = cat
                .parse()
                .map_err(|e: String| anyhow::anyhow!("[severity] {e}"))?;
            let sev: Severity = sev
                .parse()
                .map_err(|e: String| anyhow::anyhow!("[severity] {e}"))?;
            severity.insert(cat, sev);
        }
        Ok(RuleSelection {
            only: Vec::new(),
            enable: self.rules.enable.clone(),
            disable: self.rules.disable.clone(),
            severity,
        })
    }
}

/// Looks for the configuration: `explicit`, then `./dblint.toml`, then the
/// user configuration directory. Only an explicit path must exist.
pub fn locate_config(explicit: Option<&Path>) -> Result<Option<PathBuf>> {
    if let Some(p) = explicit {
        if !p.is_file() {
            anyhow::bail!("config file not found: {}", p.display());
        }
        return Ok(Some(p.to_path_buf()));
    }
    let local = PathBuf::from(CONFIG_FILE);
    if local.is_file() {
        return Ok(Some(local));
    }
    let user = config_dir().join("config.toml");
    Ok(user.is_file().then_some(user))
}

pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    match locate_config(explicit)? {
        Some(path) => {
            debug!(file = %path.display(), "Loading configuration");
            let content = fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let mut cfg = Config::parse(&content, &path)?;
            let base = path.parent().unwrap_or(Path::new("."));
            for dir in &mut cfg.catalog_dirs {
                if dir.is_relative() {
                    *dir = base.join(&*dir);
                }
            }
            Ok(cfg)
        }
        None => Ok(Config::default()),
    }
}
