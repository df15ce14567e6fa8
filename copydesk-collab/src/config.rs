//! Runtime configuration for the collaboration core.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Which transform step the operation broker runs before appending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformMode {
    /// Shift concurrent character-offset edits against each other.
    Positional,
    /// Append operations unchanged, never reporting conflicts.
    PassThrough,
}

impl FromStr for TransformMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "positional" => Ok(Self::Positional),
            "pass_through" | "passthrough" => Ok(Self::PassThrough),
            other => Err(format!("unknown transform mode: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CollabConfig {
    /// Address the WebSocket endpoint binds to
    pub bind_addr: String,
    /// Inactivity after which the sweeper expires a session
    pub session_timeout: Duration,
    /// How often the sweeper runs
    pub sweep_interval: Duration,
    /// Operations retained per content item before the oldest are evicted
    pub history_cap: usize,
    /// Most recent operations included in a join snapshot
    pub snapshot_window: usize,
    /// Maximum comment body length in characters
    pub max_comment_length: usize,
    /// Entries kept in each session's undo and redo stacks
    pub undo_capacity: usize,
    /// Outbound messages queued per connection before delivery is dropped
    pub connection_buffer: usize,
    pub transform: TransformMode,
    /// RocksDB path (None = in-memory store)
    pub storage_path: Option<PathBuf>,
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            session_timeout: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(5 * 60),
            history_cap: 10_000,
            snapshot_window: 100,
            max_comment_length: 10_000,
            undo_capacity: 100,
            connection_buffer: 256,
            transform: TransformMode::Positional,
            storage_path: None,
        }
    }
}

impl CollabConfig {
    /// Small buffers and caps for tests.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            history_cap: 64,
            snapshot_window: 16,
            undo_capacity: 8,
            connection_buffer: 32,
            ..Self::default()
        }
    }

    /// Overlay `COPYDESK_*` environment variables on top of the defaults.
    ///
    /// Unparseable values are logged and ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("COPYDESK_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Some(secs) = env_parse::<u64>("COPYDESK_SESSION_TIMEOUT_SECS") {
            config.session_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("COPYDESK_SWEEP_INTERVAL_SECS") {
            config.sweep_interval = Duration::from_secs(secs);
        }
        if let Some(cap) = env_parse::<usize>("COPYDESK_HISTORY_CAP") {
            config.history_cap = cap;
        }
        if let Some(mode) = env_parse::<TransformMode>("COPYDESK_TRANSFORM") {
            config.transform = mode;
        }
        if let Ok(path) = std::env::var("COPYDESK_STORAGE_PATH") {
            if !path.is_empty() {
                config.storage_path = Some(PathBuf::from(path));
            }
        }

        config
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            log::warn!("Ignoring {key}={raw}: not a valid value");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = CollabConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.session_timeout, Duration::from_secs(1800));
        assert_eq!(config.sweep_interval, Duration::from_secs(300));
        assert_eq!(config.history_cap, 10_000);
        assert_eq!(config.transform, TransformMode::Positional);
        assert!(config.storage_path.is_none());
    }

    #[test]
    fn test_transform_mode_parse() {
        assert_eq!("positional".parse::<TransformMode>(), Ok(TransformMode::Positional));
        assert_eq!("pass_through".parse::<TransformMode>(), Ok(TransformMode::PassThrough));
        assert!("merge".parse::<TransformMode>().is_err());
    }

    #[test]
    fn test_config_for_testing_keeps_timeouts() {
        let config = CollabConfig::for_testing();
        assert_eq!(config.session_timeout, Duration::from_secs(1800));
        assert_eq!(config.history_cap, 64);
    }
}
