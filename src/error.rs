//! Error taxonomy shared by every component of the session.

use std::time::Duration;

use thiserror::Error;

use crate::portal::HandshakeStep;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// The user declined the consent dialog (portal status 1).
    #[error("permission denied by the user during {step}")]
    PermissionDenied { step: HandshakeStep },

    /// The interaction was ended by something other than the user (portal status 2).
    #[error("{step} was cancelled")]
    Cancelled { step: HandshakeStep },

    #[error("{step} did not complete within {timeout:?}")]
    HandshakeTimeout {
        step: HandshakeStep,
        timeout: Duration,
    },

    #[error("{step} failed: {reason}")]
    StepFailed { step: HandshakeStep, reason: String },

    #[error("screen capture is not available for this session")]
    StreamUnavailable,

    #[error("no fresh frame within {0:?}")]
    FrameTimeout(Duration),

    #[error("unknown key '{0}'")]
    UnknownKey(String),

    #[error("session is not initialized")]
    NotInitialized,

    #[error("operation not valid in state {0}")]
    InvalidState(String),

    #[error("PipeWire error: {0}")]
    PipeWire(String),

    #[error("invalid consent record: {0}")]
    InvalidConsent(String),

    #[error(transparent)]
    Dbus(#[from] zbus::Error),

    #[error(transparent)]
    Fdo(#[from] zbus::fdo::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Config(#[from] toml::de::Error),
}

impl Error {
    /// Maps a non-zero portal response status to the matching error.
    pub fn from_response_status(step: HandshakeStep, status: u32) -> Self {
        match status {
            1 => Error::PermissionDenied { step },
            2 => Error::Cancelled { step },
            other => Error::StepFailed {
                step,
                reason: format!("portal returned status {other}"),
            },
        }
    }

    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Error::PermissionDenied { .. })
    }
}

impl From<pipewire::Error> for Error {
    fn from(err: pipewire::Error) -> Self {
        Error::PipeWire(err.to_string())
    }
}
