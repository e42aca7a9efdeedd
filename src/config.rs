use std::{fs, path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Hash, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum PinDirection {
    Input,
    Output,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum EdgeKind {
    Falling,
    Rising,
    Both,
}

impl EdgeKind {
    /// Whether a transition to `new_state` counts as this edge.
    pub fn matches(self, new_state: bool) -> bool {
        match self {
            EdgeKind::Falling => !new_state,
            EdgeKind::Rising => new_state,
            EdgeKind::Both => true,
        }
    }
}

#[derive(Debug, Default, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ResistorMode {
    #[default]
    Off,
    PullDown,
    PullUp,
}

impl ResistorMode {
    /// Value written into the pull control register (GPPUD) for this mode.
    pub fn code(self) -> u32 {
        match self {
            ResistorMode::Off => 0b00,
            ResistorMode::PullDown => 0b01,
            ResistorMode::PullUp => 0b10,
        }
    }
}

/// Clocks for the pin manager. The defaults suit a mechanical button on real
/// hardware; tests shrink them to keep the monitor loop fast.
#[derive(Debug, Deserialize, Serialize, Clone, Copy)]
pub struct GpioTimings {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
}

fn default_poll_interval_ms() -> u64 {
    10
}

fn default_debounce_ms() -> u64 {
    150
}

fn default_settle_delay_ms() -> u64 {
    100
}

impl Default for GpioTimings {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            debounce_ms: default_debounce_ms(),
            settle_delay_ms: default_settle_delay_ms(),
        }
    }
}

impl GpioTimings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DoorbellConfig {
    pub pin: u32,
    #[serde(default = "default_edge")]
    pub edge: EdgeKind,
    #[serde(default = "default_resistor")]
    pub resistor: ResistorMode,
}

fn default_edge() -> EdgeKind {
    EdgeKind::Falling
}

fn default_resistor() -> ResistorMode {
    ResistorMode::PullUp
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PushbulletConfig {
    pub access_token: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CameraConfig {
    #[serde(default = "default_resolution")]
    pub resolution: String,
    #[serde(default = "default_rotation")]
    pub rotation: u32,
}

fn default_resolution() -> String {
    "1280x720".to_string()
}

fn default_rotation() -> u32 {
    90
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            resolution: default_resolution(),
            rotation: default_rotation(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AppConfig {
    pub doorbell: DoorbellConfig,
    #[serde(default)]
    pub gpio: GpioTimings,
    pub pushbullet: PushbulletConfig,
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default = "default_snapshot_dir")]
    pub snapshot_dir: String,
    #[serde(default)]
    pub sound_file: Option<String>,
}

fn default_snapshot_dir() -> String {
    "snaps".to_string()
}

impl AppConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents =
            fs::read_to_string(&path).map_err(|e| ConfigError::Read(e.to_string()))?;
        serde_json::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string()))
    }
}
