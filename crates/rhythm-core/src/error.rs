use thiserror::Error;

/// Errors raised while setting up a training session
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("invalid session config: {0}")]
    InvalidConfig(String),
}

/// Errors reported by a motion source
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MotionError {
    /// No accelerometer on this device, or it refused to start
    #[error("motion sensor unavailable: {0}")]
    Unavailable(String),

    #[error("motion source is already subscribed")]
    AlreadySubscribed,
}
