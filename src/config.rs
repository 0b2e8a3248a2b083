//! Configuration loading.
//!
//! Configuration is YAML (spec.md §6). We mirror `cascade`'s style of
//! `#[serde(default)]`-driven structs (see `policy/file/v1.rs` in the
//! teacher) rather than hand-rolling a defaulting pass over an untyped
//! document the way the original Python `populate_cfg_defaults` did.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ExitError;

fn default_host() -> String {
    "127.0.0.1".to_string()
}

const fn default_port() -> u16 {
    8461
}

const fn default_true() -> bool {
    true
}

const fn default_shutdown_timeout() -> u64 {
    20
}

const fn default_cache_grace() -> u64 {
    60
}

const fn default_proactive_interval() -> u64 {
    86_400
}

const fn default_concurrency_limit() -> usize {
    100
}

const fn default_grace_ratio() -> f64 {
    2.0
}

const fn default_zone_timeout() -> f64 {
    4.0
}

const fn default_internal_cache_size() -> usize {
    10_000
}

/// Top-level daemon configuration, as loaded from the YAML config file.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    /// Listen host, when not listening on a UNIX socket.
    pub host: String,

    /// Listen port, when not listening on a UNIX socket.
    pub port: u16,

    /// UNIX socket path. Mutually exclusive with `host`/`port`.
    pub path: Option<PathBuf>,

    /// Permission bits to apply to the UNIX socket after bind, e.g. `0o660`.
    pub mode: Option<u32>,

    /// Whether to set `SO_REUSEPORT` (or the platform equivalent) in
    /// addition to `SO_REUSEADDR`.
    #[serde(default = "default_true")]
    pub reuse_port: bool,

    /// Seconds to wait for in-flight connections to drain on shutdown.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,

    /// Maximum age at which a cached entry is served without attempting a
    /// refresh, even if `max_age` has not elapsed.
    #[serde(default = "default_cache_grace")]
    pub cache_grace: u64,

    /// Proactive, periodic cache pre-warming.
    pub proactive_policy_fetching: ProactiveFetchConfig,

    /// The cache backend.
    pub cache: CacheConfig,

    /// The zone used when a request's leading token doesn't name a
    /// configured zone.
    pub default_zone: ZoneSpec,

    /// Named zones, selected by the leading token of each socketmap
    /// request.
    #[serde(default)]
    pub zones: std::collections::HashMap<String, ZoneSpec>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            path: None,
            mode: None,
            reuse_port: true,
            shutdown_timeout: default_shutdown_timeout(),
            cache_grace: default_cache_grace(),
            proactive_policy_fetching: ProactiveFetchConfig::default(),
            cache: CacheConfig::default(),
            default_zone: ZoneSpec::default(),
            zones: Default::default(),
        }
    }
}

impl Config {
    /// Load and validate a configuration file.
    pub fn from_file(path: &Path) -> Result<Self, ExitError> {
        let contents = fs::read(path)
            .map_err(|err| ExitError::Config(format!("cannot read {}: {err}", path.display())))?;
        let config: Config = serde_yaml::from_slice(&contents)
            .map_err(|err| ExitError::Config(format!("cannot parse {}: {err}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ExitError> {
        if self.path.is_some() && (self.host != default_host() || self.port != default_port()) {
            return Err(ExitError::Config(
                "'path' is mutually exclusive with 'host'/'port'".to_string(),
            ));
        }
        Ok(())
    }
}

/// Periodic cache pre-warming configuration.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct ProactiveFetchConfig {
    pub enabled: bool,
    #[serde(default = "default_proactive_interval")]
    pub interval: u64,
    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: usize,
    #[serde(default = "default_grace_ratio")]
    pub grace_ratio: f64,
}

impl Default for ProactiveFetchConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: default_proactive_interval(),
            concurrency_limit: default_concurrency_limit(),
            grace_ratio: default_grace_ratio(),
        }
    }
}

/// A single zone's resolver settings (spec.md §3 `ZoneConfig`, minus the
/// constructed `STSResolver` which is built at startup from `timeout`).
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct ZoneSpec {
    #[serde(default = "default_zone_timeout")]
    pub timeout: f64,
    pub strict_testing: bool,
    #[serde(default = "default_true")]
    pub require_sni: bool,
}

impl Default for ZoneSpec {
    fn default() -> Self {
        Self {
            timeout: default_zone_timeout(),
            strict_testing: false,
            require_sni: true,
        }
    }
}

/// The cache type and its backend-specific options.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct CacheConfig {
    #[serde(rename = "type")]
    pub kind: CacheKind,
    pub options: serde_yaml::Mapping,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            kind: CacheKind::Internal,
            options: serde_yaml::Mapping::new(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheKind {
    #[default]
    Internal,
    Sqlite,
    Redis,
    Postgres,
}

impl std::fmt::Display for CacheKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CacheKind::Internal => "internal",
            CacheKind::Sqlite => "sqlite",
            CacheKind::Redis => "redis",
            CacheKind::Postgres => "postgres",
        };
        f.write_str(s)
    }
}

/// Options for the in-memory LRU cache backend.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct InternalCacheOptions {
    #[serde(default = "default_internal_cache_size")]
    pub cache_size: usize,
}

impl Default for InternalCacheOptions {
    fn default() -> Self {
        Self {
            cache_size: default_internal_cache_size(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip() {
        let cfg: Config = serde_yaml::from_str("cache: {}\n").unwrap();
        assert_eq!(cfg.host, "127.0.0.1");
        assert_eq!(cfg.port, 8461);
        assert!(cfg.reuse_port);
        assert_eq!(cfg.shutdown_timeout, 20);
        assert_eq!(cfg.cache_grace, 60);
        assert!(!cfg.proactive_policy_fetching.enabled);
        assert_eq!(cfg.proactive_policy_fetching.interval, 86_400);
        assert_eq!(cfg.cache.kind, CacheKind::Internal);
        assert!(!cfg.default_zone.strict_testing);
        assert!(cfg.default_zone.require_sni);
    }

    #[test]
    fn path_conflicts_with_host_port() {
        let yaml = "path: /run/mta-sts.sock\nhost: 1.2.3.4\ncache: {}\n";
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zone_inherits_defaults_but_can_override() {
        let yaml = r#"
cache: {}
zones:
  tenant-a:
    strict_testing: true
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        let zone = &cfg.zones["tenant-a"];
        assert!(zone.strict_testing);
        assert_eq!(zone.timeout, 4.0);
        assert!(zone.require_sni);
    }
}
