//! Configuration for lwmq deployments.
//!
//! TOML file + `LWMQ_` environment overrides, catalog extension, and
//! translation to [`lwmq_core::ShepherdConfig`]. The core crate never
//! touches disk; embedders load a [`Config`] here and hand the result over.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use lwmq_core::{Catalog, ShepherdConfig};

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

fn invalid(field: impl Into<String>, reason: impl Into<String>) -> ConfigError {
    ConfigError::Validation {
        field: field.into(),
        reason: reason.into(),
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    /// Timers and channel sizing.
    #[serde(default)]
    pub shepherd: ShepherdSettings,

    /// Extra or overridden catalog objects, keyed by numeric object id.
    #[serde(default)]
    pub catalog: BTreeMap<String, CatalogObject>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ShepherdSettings {
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    #[serde(default = "default_quick_ping_timeout_ms")]
    pub quick_ping_timeout_ms: u64,

    #[serde(default = "default_sleep_margin_ms")]
    pub sleep_margin_ms: u64,

    #[serde(default = "default_sleep_retry_interval_ms")]
    pub sleep_retry_interval_ms: u64,

    #[serde(default = "default_sleep_probe_attempts")]
    pub sleep_probe_attempts: u32,

    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Start from the built-in LWM2M object names. Off means raw ids only.
    #[serde(default = "default_true")]
    pub core_catalog: bool,
}

impl Default for ShepherdSettings {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
            quick_ping_timeout_ms: default_quick_ping_timeout_ms(),
            sleep_margin_ms: default_sleep_margin_ms(),
            sleep_retry_interval_ms: default_sleep_retry_interval_ms(),
            sleep_probe_attempts: default_sleep_probe_attempts(),
            event_capacity: default_event_capacity(),
            core_catalog: true,
        }
    }
}

fn default_request_timeout_ms() -> u64 {
    10_000
}
fn default_quick_ping_timeout_ms() -> u64 {
    1_000
}
fn default_sleep_margin_ms() -> u64 {
    1_000
}
fn default_sleep_retry_interval_ms() -> u64 {
    500
}
fn default_sleep_probe_attempts() -> u32 {
    4
}
fn default_event_capacity() -> usize {
    256
}
fn default_true() -> bool {
    true
}

/// One `[catalog.<oid>]` table.
///
/// With a `name` the entry defines the object outright, replacing any
/// built-in definition. Without one it adds resource names to an object
/// the catalog already knows.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct CatalogObject {
    pub name: Option<String>,

    /// Resource names keyed by numeric resource id.
    #[serde(default)]
    pub resources: BTreeMap<String, String>,
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("org", "lwmq", "lwmq").map_or_else(
        || {
            let mut p = dirs_fallback();
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

fn dirs_fallback() -> PathBuf {
    let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
    p.push(".config");
    p.push("lwmq");
    p
}

// ── Config loading ──────────────────────────────────────────────────

/// Load the full Config from the platform path + environment.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&config_path())
}

/// Load from `path` + environment. A missing file yields the defaults.
///
/// Environment keys nest with `__`, e.g. `LWMQ_SHEPHERD__REQUEST_TIMEOUT_MS`.
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    debug!(path = %path.display(), "loading config");
    let figment = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("LWMQ_").split("__"));

    let config: Config = figment.extract()?;
    Ok(config)
}

// ── Config saving ───────────────────────────────────────────────────

/// Serialize config to TOML and write it to `path`, creating parent dirs.
pub fn save_config_to(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(cfg)?;
    std::fs::write(path, toml_str)?;
    Ok(())
}

// ── Translation ─────────────────────────────────────────────────────

impl Config {
    /// Validate and build the runtime configuration.
    pub fn to_shepherd_config(&self) -> Result<ShepherdConfig, ConfigError> {
        let s = &self.shepherd;
        let request_timeout = positive_ms("shepherd.request_timeout_ms", s.request_timeout_ms)?;
        let quick_ping_timeout =
            positive_ms("shepherd.quick_ping_timeout_ms", s.quick_ping_timeout_ms)?;
        if s.sleep_probe_attempts == 0 {
            return Err(invalid("shepherd.sleep_probe_attempts", "must be at least 1"));
        }
        if s.event_capacity == 0 {
            return Err(invalid("shepherd.event_capacity", "must be at least 1"));
        }

        Ok(ShepherdConfig {
            request_timeout,
            quick_ping_timeout,
            sleep_margin: Duration::from_millis(s.sleep_margin_ms),
            sleep_retry_interval: Duration::from_millis(s.sleep_retry_interval_ms),
            sleep_probe_attempts: s.sleep_probe_attempts,
            event_capacity: s.event_capacity,
            catalog: self.build_catalog()?,
        })
    }

    fn build_catalog(&self) -> Result<Catalog, ConfigError> {
        let mut catalog = if self.shepherd.core_catalog {
            Catalog::lwm2m_core()
        } else {
            Catalog::new()
        };

        for (raw_oid, entry) in &self.catalog {
            let field = format!("catalog.{raw_oid}");
            let oid: u16 = raw_oid
                .parse()
                .map_err(|_| invalid(&field, "object id must be a number in 0..=65535"))?;
            let resources = parse_resources(&field, &entry.resources)?;
            let pairs = resources.iter().map(|(rid, name)| (*rid, name.as_str()));

            match &entry.name {
                Some(name) => {
                    if name.is_empty() || name.parse::<u16>().is_ok() {
                        return Err(invalid(
                            &field,
                            format!("object name {name:?} must be symbolic"),
                        ));
                    }
                    if let Some(other) = catalog.oid_number(name).filter(|other| *other != oid) {
                        return Err(invalid(
                            &field,
                            format!("object name {name:?} is already used by object {other}"),
                        ));
                    }
                    catalog.insert_object(oid, name, pairs);
                }
                None => {
                    if !catalog.extend_resources(oid, pairs) {
                        return Err(invalid(&field, "unknown object needs a name"));
                    }
                }
            }
        }
        Ok(catalog)
    }
}

fn positive_ms(field: &str, ms: u64) -> Result<Duration, ConfigError> {
    if ms == 0 {
        return Err(invalid(field, "must be greater than zero"));
    }
    Ok(Duration::from_millis(ms))
}

fn parse_resources<'a>(
    field: &str,
    raw: &'a BTreeMap<String, String>,
) -> Result<Vec<(u16, &'a String)>, ConfigError> {
    let mut seen = HashSet::new();
    raw.iter()
        .map(|(rid, name)| {
            let id: u16 = rid.parse().map_err(|_| {
                invalid(
                    format!("{field}.resources"),
                    format!("resource id {rid:?} must be numeric"),
                )
            })?;
            if name.is_empty() || name.parse::<u16>().is_ok() {
                return Err(invalid(
                    format!("{field}.resources.{rid}"),
                    format!("resource name {name:?} must be symbolic"),
                ));
            }
            if !seen.insert(name.as_str()) {
                return Err(invalid(
                    format!("{field}.resources.{rid}"),
                    format!("resource name {name:?} is used twice"),
                ));
            }
            Ok((id, name))
        })
        .collect()
}
