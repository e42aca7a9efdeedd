use std::path::Path;
use std::process::Command;

use log::warn;

use crate::config::CameraConfig;
use crate::error::CaptureError;

/// Webcam snapshots via the external `fswebcam` tool.
pub struct Camera {
    resolution: String,
    rotation: u32,
}

impl Camera {
    pub fn new(config: &CameraConfig) -> Self {
        Self {
            resolution: config.resolution.clone(),
            rotation: config.rotation,
        }
    }

    pub fn capture(&self, path: &Path) -> Result<(), CaptureError> {
        let status = Command::new("fswebcam")
            .arg("-q")
            .arg("-r")
            .arg(&self.resolution)
            .arg("--rotate")
            .arg(self.rotation.to_string())
            .arg(path)
            .status()
            .map_err(|e| CaptureError::Spawn {
                command: "fswebcam".to_string(),
                reason: e.to_string(),
            })?;

        if !status.success() {
            return Err(CaptureError::Failed {
                command: "fswebcam".to_string(),
                status: status.to_string(),
            });
        }

        // fswebcam can exit zero without producing anything when the device
        // is missing.
        if !path.exists() {
            return Err(CaptureError::NoImage(path.display().to_string()));
        }

        Ok(())
    }
}

/// Fire-and-forget chime playback through `mpg123`.
pub fn play_sound(path: &Path) {
    if let Err(e) = Command::new("mpg123").arg("-q").arg(path).spawn() {
        warn!("failed to play {}: {e}", path.display());
    }
}
