//! Server configuration.
//!
//! Read from a JSON file whose path is the binary's single CLI argument.
//! Every key is optional; missing sections fall back to their defaults.

use std::path::Path;

use anyhow::Context;
use serde::Deserialize;

use crate::game::GameSettings;

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listener: ListenerConfig,
    /// Extra runtime worker threads. `0` means the main thread only; `-1`
    /// means one fewer than the machine's available parallelism.
    pub number_of_additional_threads: i64,
    pub logger: LoggerConfig,
    pub game: GameConfig,
    pub player: PlayerConfig,
}

/// `listener` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address; `"0.0.0.0"` means all interfaces.
    pub interface: String,
    /// Bind port; `0` lets the OS pick one.
    pub port: u16,
    /// OS listen backlog depth.
    pub max_queued_connections: u32,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            interface: "0.0.0.0".into(),
            port: 8080,
            max_queued_connections: 128,
        }
    }
}

/// `logger` section.
///
/// `level` seeds the tracing filter (`RUST_LOG` still wins when set) and
/// `root`/`extension` redirect output to `<root>/server<extension>`. The
/// remaining keys are accepted so existing config files keep parsing; the
/// formatter's layout is fixed.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    pub root: Option<String>,
    pub extension: String,
    pub level: String,
    pub pattern: Option<String>,
    pub register_by_default: bool,
    pub flush_every: u64,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            root: None,
            extension: ".log".into(),
            level: "info".into(),
            pattern: None,
            register_by_default: false,
            flush_every: 5,
        }
    }
}

/// `game` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GameConfig {
    /// Broadcast the post-leave state to the remaining players.
    pub broadcast_on_leave: bool,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            broadcast_on_leave: true,
        }
    }
}

/// `player` section: defaults applied to newly created players.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    pub health: f64,
    pub angle: f64,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            health: 100.0,
            angle: 0.0,
        }
    }
}

impl Config {
    /// Loads the configuration from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Config = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    /// Number of tokio worker threads; `0` selects a current-thread runtime.
    pub fn worker_threads(&self) -> usize {
        match self.number_of_additional_threads {
            0 => 0,
            n if n < 0 => std::thread::available_parallelism()
                .map(|p| p.get().saturating_sub(1))
                .unwrap_or(1)
                .max(1),
            n => n as usize,
        }
    }

    /// The per-game tunables derived from this configuration.
    pub fn game_settings(&self) -> GameSettings {
        GameSettings {
            broadcast_on_leave: self.game.broadcast_on_leave,
            default_health: self.player.health,
            default_angle: self.player.angle,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_yields_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.listener.interface, "0.0.0.0");
        assert_eq!(config.listener.port, 8080);
        assert_eq!(config.listener.max_queued_connections, 128);
        assert_eq!(config.number_of_additional_threads, 0);
        assert_eq!(config.logger.level, "info");
        assert!(config.game.broadcast_on_leave);
        assert_eq!(config.player.health, 100.0);
    }

    #[test]
    fn full_config_parses() {
        let config: Config = serde_json::from_str(
            r#"{
                "listener": {
                    "interface": "127.0.0.1",
                    "port": 9001,
                    "max_queued_connections": 64
                },
                "number_of_additional_threads": 3,
                "logger": {
                    "root": "logs/",
                    "extension": ".txt",
                    "level": "debug",
                    "pattern": "[%H:%M:%S]",
                    "register_by_default": true,
                    "flush_every": 1
                },
                "game": {"broadcast_on_leave": false},
                "player": {"health": 50.0, "angle": 90.0}
            }"#,
        )
        .unwrap();
        assert_eq!(config.listener.interface, "127.0.0.1");
        assert_eq!(config.listener.port, 9001);
        assert_eq!(config.worker_threads(), 3);
        assert_eq!(config.logger.root.as_deref(), Some("logs/"));
        assert!(!config.game.broadcast_on_leave);
        let settings = config.game_settings();
        assert_eq!(settings.default_health, 50.0);
        assert_eq!(settings.default_angle, 90.0);
        assert!(!settings.broadcast_on_leave);
    }

    #[test]
    fn negative_thread_count_maps_to_parallelism() {
        let config: Config =
            serde_json::from_str(r#"{"number_of_additional_threads": -1}"#).unwrap();
        assert!(config.worker_threads() >= 1);
    }

    #[test]
    fn zero_threads_selects_current_thread_runtime() {
        let config = Config::default();
        assert_eq!(config.worker_threads(), 0);
    }
}
