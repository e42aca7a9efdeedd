use thiserror::Error;

#[derive(Debug, Error)]
pub enum GpioError {
    #[error("Pin {0} is already exported")]
    AlreadyExported(u32),
    #[error("Pin {0} is not exported")]
    NotExported(u32),
    #[error("Invalid direction: {0}")]
    InvalidDirection(String),
    #[error("Pin {0} is already being monitored")]
    AlreadyMonitoring(u32),
    #[error("Hardware I/O failure: {0}")]
    Hardware(String),
}

#[derive(Debug, Error)]
pub enum PushError {
    #[error("Pushbullet request failed: {0}")]
    Transport(String),
    #[error("Pushbullet rejected the push: {0}")]
    Api(String),
    #[error("Cannot read attachment: {0}")]
    Attachment(String),
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("Failed to run {command}: {reason}")]
    Spawn { command: String, reason: String },
    #[error("{command} exited with {status}")]
    Failed { command: String, status: String },
    #[error("No image was produced at {0}")]
    NoImage(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Read(String),
    #[error("Invalid config json: {0}")]
    Parse(String),
}
