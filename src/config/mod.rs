//! Engine configuration: the option set supplied once at construction.
//!
//! Options are read from JSON (camelCase keys) or assembled in code:
//!
//! ```json
//! {
//!   "routes": {
//!     "/users": 3000,
//!     "/users/:id": "increasing",
//!     "/search": { "timeout": true, "cacheKeyArgs": { "query": true } },
//!     "/admin/*": false
//!   },
//!   "defaultTimeout": 5000,
//!   "increasing": { "1": "1s", "5": "30s", "20": "5m" },
//!   "debug": false
//! }
//! ```
//!
//! Route values stay raw [`serde_json::Value`]s here: the route table compiler
//! decides which entries are usable and drops the rest with a warning. Route
//! declaration order is preserved (`serde_json` is built with `preserve_order`).

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::warn;

/// TTL applied when a route does not name its own, in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 5_000;

/// Step table used when adaptive routes exist and `increasing` is not configured.
pub const DEFAULT_STEPS: [(u64, u64); 5] =
    [(1, 1_000), (3, 2_000), (10, 3_000), (20, 4_000), (50, 5_000)];

/// Configuration problems. None of them abort setup: the offending entry is
/// logged and dropped, except [`ConfigError::Json`] which means there was no
/// configuration to read at all.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("route {route:?} has an unsupported value: {value}")]
    InvalidRoute { route: String, value: Value },

    #[error("route {route:?} has an unsupported timeout: {value}")]
    InvalidTimeout { route: String, value: Value },

    #[error("route {route:?} uses an array for cacheKeyArgs, which is not supported")]
    ArrayKeyArgs { route: String },

    #[error("route {route:?} has an unsupported cacheKeyArgs.{field}: {value}")]
    InvalidKeyArgs {
        route: String,
        field: &'static str,
        value: Value,
    },

    #[error("invalid duration {0:?}, expected <n>s, <n>m, <n>h or <n>d")]
    InvalidDuration(String),

    #[error("invalid step threshold {0:?}, expected an integer >= 1")]
    InvalidThreshold(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// The full option set of a cache engine.
///
/// # Examples
///
/// ```
/// use route_cache::config::CacheConfig;
///
/// let config = CacheConfig::from_json(r#"{
///     "routes": { "/ping": 1000, "/users/:id": "increasing" },
///     "increasing": { "1": "2s", "10": "1m" }
/// }"#).unwrap();
///
/// assert_eq!(config.default_timeout(), 5000);
/// assert_eq!(config.step_table().get(&10), Some(&60_000));
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheConfig {
    #[serde(default)]
    routes: Map<String, Value>,

    #[serde(default = "default_timeout")]
    default_timeout: u64,

    #[serde(default)]
    increasing: Option<Map<String, Value>>,

    #[serde(default)]
    debug: bool,
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_MS
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            routes: Map::new(),
            default_timeout: DEFAULT_TIMEOUT_MS,
            increasing: None,
            debug: false,
        }
    }
}

impl CacheConfig {
    /// Creates a configuration from a route table, keeping every other option at
    /// its default.
    pub fn new(routes: Map<String, Value>) -> Self {
        Self {
            routes,
            ..Self::default()
        }
    }

    /// Parses a configuration document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Json`] if `text` is not JSON or its top-level
    /// options have the wrong shape. Individual route values are never rejected
    /// here.
    pub fn from_json(text: &str) -> ConfigResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Appends a route, keeping declaration order.
    #[must_use]
    pub fn route(mut self, pattern: impl Into<String>, value: impl Into<Value>) -> Self {
        self.routes.insert(pattern.into(), value.into());
        self
    }

    /// Sets the TTL used by routes configured with `true`.
    #[must_use]
    pub fn with_default_timeout(mut self, millis: u64) -> Self {
        self.default_timeout = millis;
        self
    }

    /// Replaces the adaptive step table. Values may be milliseconds or duration strings.
    #[must_use]
    pub fn with_increasing(mut self, steps: Map<String, Value>) -> Self {
        self.increasing = Some(steps);
        self
    }

    /// Turns per-request decision tracing on or off.
    #[must_use]
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn routes(&self) -> &Map<String, Value> {
        &self.routes
    }

    pub fn default_timeout(&self) -> u64 {
        self.default_timeout
    }

    pub fn debug(&self) -> bool {
        self.debug
    }

    /// Returns the normalized adaptive step table, threshold → milliseconds.
    ///
    /// Falls back to [`DEFAULT_STEPS`] when `increasing` is absent. Entries whose
    /// threshold is not a positive integer, or whose value is neither a number
    /// nor a valid duration string, are dropped with a warning.
    pub fn step_table(&self) -> BTreeMap<u64, u64> {
        let Some(raw) = &self.increasing else {
            return DEFAULT_STEPS.into_iter().collect();
        };

        let mut steps = BTreeMap::new();
        for (threshold, value) in raw {
            match normalize_step(threshold, value) {
                Ok((count, millis)) => {
                    steps.insert(count, millis);
                }
                Err(e) => warn!(error = %e, "dropping adaptive step"),
            }
        }
        steps
    }
}

fn normalize_step(threshold: &str, value: &Value) -> ConfigResult<(u64, u64)> {
    let count = threshold
        .trim()
        .parse::<u64>()
        .ok()
        .filter(|count| *count >= 1)
        .ok_or_else(|| ConfigError::InvalidThreshold(threshold.to_owned()))?;

    let millis = match value {
        Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| ConfigError::InvalidDuration(n.to_string()))?,
        Value::String(s) => parse_duration(s)?,
        other => return Err(ConfigError::InvalidDuration(other.to_string())),
    };

    Ok((count, millis))
}

/// Converts a duration string (`"30s"`, `"5m"`, `"2h"`, `"1d"`) to milliseconds.
///
/// The string must be digits followed by exactly one unit suffix.
///
/// # Examples
///
/// ```
/// use route_cache::config::parse_duration;
///
/// assert_eq!(parse_duration("30s").unwrap(), 30_000);
/// assert_eq!(parse_duration("2h").unwrap(), 7_200_000);
/// assert!(parse_duration("15").is_err());
/// ```
pub fn parse_duration(text: &str) -> ConfigResult<u64> {
    let invalid = || ConfigError::InvalidDuration(text.to_owned());

    let unit = text.chars().last().ok_or_else(invalid)?;
    let factor: u64 = match unit {
        's' => 1_000,
        'm' => 60_000,
        'h' => 3_600_000,
        'd' => 86_400_000,
        _ => return Err(invalid()),
    };

    let digits = &text[..text.len() - unit.len_utf8()];
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }

    digits
        .parse::<u64>()
        .ok()
        .and_then(|n| n.checked_mul(factor))
        .ok_or_else(invalid)
}
