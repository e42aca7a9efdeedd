mod backend;
mod capture;
mod config;
mod error;
mod gpio;
mod notify;

pub use backend::{MockBackend, PullWrite, SysfsBackend};
pub use capture::{Camera, play_sound};
pub use config::{
    AppConfig, CameraConfig, DoorbellConfig, EdgeKind, GpioTimings, PinDirection,
    PushbulletConfig, ResistorMode,
};
pub use error::{CaptureError, ConfigError, GpioError, PushError};
pub use gpio::{GpioBackend, GpioManager, Pin};
pub use notify::Pushbullet;
