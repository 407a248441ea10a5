//! Connection-wide settings
//!
//! Defaults can be overridden per model on the [`ModelSchema`](crate::ModelSchema)
//! builder and per call through `GetOptions` / `FindOptions`.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ModelError, ModelResult};

/// How instances are kept in the identity map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "CacheSetting", into = "CacheSetting")]
pub enum CachePolicy {
    Disabled,
    Enabled,
    /// Entries expire after the given duration
    Ttl(Duration),
}

impl CachePolicy {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, CachePolicy::Disabled)
    }

    pub fn ttl(&self) -> Option<Duration> {
        match self {
            CachePolicy::Ttl(ttl) => Some(*ttl),
            _ => None,
        }
    }
}

impl Default for CachePolicy {
    fn default() -> Self {
        CachePolicy::Enabled
    }
}

impl From<bool> for CachePolicy {
    fn from(enabled: bool) -> Self {
        if enabled {
            CachePolicy::Enabled
        } else {
            CachePolicy::Disabled
        }
    }
}

impl From<Duration> for CachePolicy {
    fn from(ttl: Duration) -> Self {
        CachePolicy::Ttl(ttl)
    }
}

/// Wire form: `true` / `false` or a number of seconds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(untagged)]
enum CacheSetting {
    Flag(bool),
    Seconds(u64),
}

impl From<CacheSetting> for CachePolicy {
    fn from(setting: CacheSetting) -> Self {
        match setting {
            CacheSetting::Flag(enabled) => enabled.into(),
            CacheSetting::Seconds(0) => CachePolicy::Disabled,
            CacheSetting::Seconds(secs) => CachePolicy::Ttl(Duration::from_secs(secs)),
        }
    }
}

impl From<CachePolicy> for CacheSetting {
    fn from(policy: CachePolicy) -> Self {
        match policy {
            CachePolicy::Disabled => CacheSetting::Flag(false),
            CachePolicy::Enabled => CacheSetting::Flag(true),
            CachePolicy::Ttl(ttl) => CacheSetting::Seconds(ttl.as_secs()),
        }
    }
}

/// Instance behaviour defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceSettings {
    pub cache: CachePolicy,
    pub cache_save_check: bool,
    pub auto_fetch: bool,
    pub auto_fetch_limit: u32,
    pub cascade_remove: bool,
    pub return_all_errors: bool,
}

impl Default for InstanceSettings {
    fn default() -> Self {
        Self {
            cache: CachePolicy::Enabled,
            cache_save_check: true,
            auto_fetch: false,
            auto_fetch_limit: 1,
            cascade_remove: true,
            return_all_errors: false,
        }
    }
}

/// Property declaration defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PropertySettings {
    pub required: bool,
    pub primary_key: String,
}

impl Default for PropertySettings {
    fn default() -> Self {
        Self {
            required: false,
            primary_key: "id".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrmSettings {
    pub instance: InstanceSettings,
    pub properties: PropertySettings,
}

impl OrmSettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse settings from a JSON document; missing keys keep their defaults.
    pub fn from_json(value: &Value) -> ModelResult<Self> {
        Ok(serde_json::from_value(value.clone())?)
    }

    /// Load defaults overridden by `RELMAP_*` environment variables.
    pub fn from_env() -> ModelResult<Self> {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable lookup.
    pub fn from_env_with<F>(lookup: F) -> ModelResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Self::default();
        let instance = &mut settings.instance;

        if let Some(raw) = lookup("RELMAP_CACHE") {
            instance.cache = match parse_bool(&raw) {
                Some(enabled) => enabled.into(),
                None => {
                    let secs = parse_number("RELMAP_CACHE", &raw)?;
                    CacheSetting::Seconds(secs).into()
                }
            };
        }
        if let Some(raw) = lookup("RELMAP_CACHE_SAVE_CHECK") {
            instance.cache_save_check = require_bool("RELMAP_CACHE_SAVE_CHECK", &raw)?;
        }
        if let Some(raw) = lookup("RELMAP_AUTO_FETCH") {
            instance.auto_fetch = require_bool("RELMAP_AUTO_FETCH", &raw)?;
        }
        if let Some(raw) = lookup("RELMAP_AUTO_FETCH_LIMIT") {
            let limit = parse_number("RELMAP_AUTO_FETCH_LIMIT", &raw)?;
            instance.auto_fetch_limit = u32::try_from(limit).map_err(|_| {
                ModelError::Configuration(format!("RELMAP_AUTO_FETCH_LIMIT out of range: {limit}"))
            })?;
        }
        if let Some(raw) = lookup("RELMAP_CASCADE_REMOVE") {
            instance.cascade_remove = require_bool("RELMAP_CASCADE_REMOVE", &raw)?;
        }
        if let Some(raw) = lookup("RELMAP_RETURN_ALL_ERRORS") {
            instance.return_all_errors = require_bool("RELMAP_RETURN_ALL_ERRORS", &raw)?;
        }

        Ok(settings)
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" => Some(true),
        "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn require_bool(key: &str, raw: &str) -> ModelResult<bool> {
    match raw.trim() {
        "1" => Ok(true),
        "0" => Ok(false),
        other => parse_bool(other)
            .ok_or_else(|| ModelError::Configuration(format!("{key} must be a boolean, got '{raw}'"))),
    }
}

fn parse_number(key: &str, raw: &str) -> ModelResult<u64> {
    raw.trim()
        .parse::<u64>()
        .map_err(|_| ModelError::Configuration(format!("{key} must be a number, got '{raw}'")))
}
