//! Runtime configuration loaded from TOML.
//!
//! Every field has a default, so an empty file (or no file at all) yields a
//! working configuration and a partial file only overrides what it names.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub update: UpdateSection,
    #[serde(default)]
    pub live: LiveSection,
    #[serde(default)]
    pub callbacks: CallbackSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UpdateSection {
    /// Quiet period before a batch of queued updates is drained, in ms.
    pub debounce_ms: u64,
    /// Bounded depth of the update queue; overflow runs updates inline.
    pub queue_capacity: usize,
}

impl Default for UpdateSection {
    fn default() -> Self {
        Self {
            debounce_ms: 50,
            queue_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LiveSection {
    /// Per-connection outbound queue depth; a full queue drops the client.
    pub send_queue_capacity: usize,
    pub heartbeat_interval_secs: u64,
    /// Connections silent for longer than this are closed by the heartbeat.
    pub heartbeat_timeout_secs: u64,
}

impl Default for LiveSection {
    fn default() -> Self {
        Self {
            send_queue_capacity: 64,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 90,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CallbackSection {
    /// Callbacks idle for longer than this are eligible for sweeping.
    pub ttl_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for CallbackSection {
    fn default() -> Self {
        Self {
            ttl_secs: 2 * 60 * 60,
            sweep_interval_secs: 60 * 60,
        }
    }
}

impl RuntimeConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: RuntimeConfig = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        Ok(config)
    }
}

impl UpdateSection {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

impl LiveSection {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }
}

impl CallbackSection {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_complete() {
        let config = RuntimeConfig::default();
        assert_eq!(config.update.debounce_ms, 50);
        assert_eq!(config.update.queue_capacity, 256);
        assert_eq!(config.live.send_queue_capacity, 64);
        assert_eq!(config.live.heartbeat_interval_secs, 30);
        assert_eq!(config.live.heartbeat_timeout_secs, 90);
        assert_eq!(config.callbacks.ttl_secs, 7200);
        assert_eq!(config.callbacks.sweep_interval_secs, 3600);
    }

    #[test]
    fn empty_toml_uses_defaults() {
        let config: RuntimeConfig = toml::from_str("").unwrap();
        assert_eq!(config.update.debounce_ms, 50);
        assert_eq!(config.callbacks.ttl_secs, 7200);
    }

    #[test]
    fn partial_toml_overrides_only_named_fields() {
        let config: RuntimeConfig = toml::from_str(
            r#"
            [update]
            debounce_ms = 10

            [live]
            heartbeat_timeout_secs = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.update.debounce_ms, 10);
        assert_eq!(config.update.queue_capacity, 256);
        assert_eq!(config.live.heartbeat_timeout_secs, 5);
        assert_eq!(config.live.send_queue_capacity, 64);
    }

    #[test]
    fn duration_accessors_convert_units() {
        let config = RuntimeConfig::default();
        assert_eq!(config.update.debounce(), Duration::from_millis(50));
        assert_eq!(config.callbacks.ttl(), Duration::from_secs(7200));
        assert_eq!(config.live.heartbeat_interval(), Duration::from_secs(30));
    }
}
