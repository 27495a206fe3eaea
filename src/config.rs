//! Core configuration

use std::str::FromStr;

use crate::protocol::Level;
use crate::sender::DEFAULT_BACKLOG;

/// Environment variable holding the backlog capacity.
pub const ENV_BACKLOG: &str = "LOGSTREAM_BACKLOG";
/// Environment variable holding the default level (name or number).
pub const ENV_DEFAULT_LEVEL: &str = "LOGSTREAM_DEFAULT_LEVEL";

/// Get environment variable parsed as type T, or return default
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Settings a [`Core`](crate::core::Core) starts with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Per-subscriber backlog. Positive values are a limit, 0 selects the
    /// default (1000), negative values mean unlimited.
    pub backlog: i64,

    /// Global threshold for categories without a level of their own.
    pub default_level: Level,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backlog: DEFAULT_BACKLOG as i64,
            default_level: Level::Info,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `LOGSTREAM_BACKLOG` and
    /// `LOGSTREAM_DEFAULT_LEVEL`. Unparseable values are ignored, as is an
    /// `undefined` default level.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let level = env_get(ENV_DEFAULT_LEVEL, defaults.default_level);
        Self {
            backlog: env_get(ENV_BACKLOG, defaults.backlog),
            default_level: if level.is_defined() { level } else { defaults.default_level },
        }
    }

    /// Set the backlog capacity
    pub fn backlog(mut self, backlog: i64) -> Self {
        self.backlog = backlog;
        self
    }

    /// Set the default level
    pub fn default_level(mut self, level: Level) -> Self {
        self.default_level = level;
        self
    }
}
