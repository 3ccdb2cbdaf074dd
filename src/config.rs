// src/config.rs - Loader configuration (TOML)
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Top-level configuration for the blade loader host.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub serial: SerialConfig,

    #[serde(default)]
    pub motion: MotionConfig,

    #[serde(default)]
    pub timing: TimingConfig,

    /// Where taught positions are persisted between runs.
    #[serde(default = "default_positions_file")]
    pub positions_file: String,
}

/// Serial link configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SerialConfig {
    #[serde(default = "default_port")]
    pub port: String,

    #[serde(default = "default_baud")]
    pub baud: u32,

    /// Hard deadline on the `ok` acknowledgement wait. The arm firmware has
    /// no failure reply, so a silent line manifests here as a timeout.
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,

    /// Backoff between empty reads while waiting for an acknowledgement.
    #[serde(default = "default_ack_poll_ms")]
    pub ack_poll_ms: u64,

    /// The arm resets on port open; give it time before the first exchange.
    #[serde(default = "default_connect_settle_ms")]
    pub connect_settle_ms: u64,
}

/// Feedrates for commanded moves, in mm/min as the firmware expects.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MotionConfig {
    #[serde(default = "default_feedrate")]
    pub feedrate: u32,

    #[serde(default = "default_jog_feedrate")]
    pub jog_feedrate: u32,
}

/// Dwell and polling intervals, all in milliseconds.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TimingConfig {
    /// Dwell after activating suction so the blade is actually gripped.
    #[serde(default = "default_suction_grab_delay_ms")]
    pub suction_grab_delay_ms: u64,

    /// Dwell after releasing air pressure before stopping the pump.
    #[serde(default = "default_suction_release_delay_ms")]
    pub suction_release_delay_ms: u64,

    /// Short settle after the pump stops, before the arm lifts away.
    #[serde(default = "default_pump_stop_settle_ms")]
    pub pump_stop_settle_ms: u64,

    /// Settle after `M888` module select.
    #[serde(default = "default_module_settle_ms")]
    pub module_settle_ms: u64,

    /// Mechanical settle after `M1112` homing.
    #[serde(default = "default_home_settle_ms")]
    pub home_settle_ms: u64,

    /// Settle after an `M894` encoder replay before resyncing position.
    #[serde(default = "default_replay_settle_ms")]
    pub replay_settle_ms: u64,

    /// Read attempts while waiting for an `M893` encoder report.
    #[serde(default = "default_encoder_poll_attempts")]
    pub encoder_poll_attempts: u32,

    #[serde(default = "default_encoder_poll_ms")]
    pub encoder_poll_ms: u64,

    /// Poll interval while a paused cycle spins waiting for resume or stop.
    #[serde(default = "default_pause_poll_ms")]
    pub pause_poll_ms: u64,
}

// Default value functions
fn default_positions_file() -> String { "blade_positions.json".to_string() }
fn default_port() -> String { "/dev/ttyACM0".to_string() }
fn default_baud() -> u32 { 115200 }
fn default_ack_timeout_ms() -> u64 { 10_000 }
fn default_ack_poll_ms() -> u64 { 50 }
fn default_connect_settle_ms() -> u64 { 2000 }
fn default_feedrate() -> u32 { 3000 }
fn default_jog_feedrate() -> u32 { 1000 }
fn default_suction_grab_delay_ms() -> u64 { 500 }
fn default_suction_release_delay_ms() -> u64 { 300 }
fn default_pump_stop_settle_ms() -> u64 { 200 }
fn default_module_settle_ms() -> u64 { 300 }
fn default_home_settle_ms() -> u64 { 2000 }
fn default_replay_settle_ms() -> u64 { 200 }
fn default_encoder_poll_attempts() -> u32 { 20 }
fn default_encoder_poll_ms() -> u64 { 100 }
fn default_pause_poll_ms() -> u64 { 100 }

impl Default for Config {
    fn default() -> Self {
        Self {
            serial: SerialConfig::default(),
            motion: MotionConfig::default(),
            timing: TimingConfig::default(),
            positions_file: default_positions_file(),
        }
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            baud: default_baud(),
            ack_timeout_ms: default_ack_timeout_ms(),
            ack_poll_ms: default_ack_poll_ms(),
            connect_settle_ms: default_connect_settle_ms(),
        }
    }
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            feedrate: default_feedrate(),
            jog_feedrate: default_jog_feedrate(),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            suction_grab_delay_ms: default_suction_grab_delay_ms(),
            suction_release_delay_ms: default_suction_release_delay_ms(),
            pump_stop_settle_ms: default_pump_stop_settle_ms(),
            module_settle_ms: default_module_settle_ms(),
            home_settle_ms: default_home_settle_ms(),
            replay_settle_ms: default_replay_settle_ms(),
            encoder_poll_attempts: default_encoder_poll_attempts(),
            encoder_poll_ms: default_encoder_poll_ms(),
            pause_poll_ms: default_pause_poll_ms(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        tracing::info!("Loaded configuration from {}", path);
        Ok(config)
    }

    /// Load configuration, falling back to defaults when the file is absent.
    pub fn load_or_default(path: &str) -> Result<Self, ConfigError> {
        match std::fs::metadata(path) {
            Ok(_) => Self::load(path),
            Err(_) => {
                tracing::info!("No config file at {}, using defaults", path);
                Ok(Self::default())
            }
        }
    }
}

impl TimingConfig {
    pub fn suction_grab_delay(&self) -> Duration {
        Duration::from_millis(self.suction_grab_delay_ms)
    }
    pub fn suction_release_delay(&self) -> Duration {
        Duration::from_millis(self.suction_release_delay_ms)
    }
    pub fn pump_stop_settle(&self) -> Duration {
        Duration::from_millis(self.pump_stop_settle_ms)
    }
    pub fn encoder_poll(&self) -> Duration {
        Duration::from_millis(self.encoder_poll_ms)
    }
    pub fn pause_poll(&self) -> Duration {
        Duration::from_millis(self.pause_poll_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_arm_expectations() {
        let config = Config::default();
        assert_eq!(config.serial.baud, 115200);
        assert_eq!(config.motion.feedrate, 3000);
        assert_eq!(config.positions_file, "blade_positions.json");
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            positions_file = "custom.json"

            [serial]
            port = "/dev/ttyUSB3"
            "#,
        )
        .unwrap();
        assert_eq!(config.serial.port, "/dev/ttyUSB3");
        assert_eq!(config.serial.baud, 115200);
        assert_eq!(config.positions_file, "custom.json");
        assert_eq!(config.motion.jog_feedrate, 1000);
    }
}
