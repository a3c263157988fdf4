//! Error taxonomy for the synchronization core.
//!
//! None of these reach the end user as a hard failure. Callers log them and
//! keep running on local-only state.

use crate::record::SaveId;

#[derive(Debug, Clone, thiserror::Error)]
pub enum SyncError {
    /// The platform refused to start a session, or the user declined.
    #[error("session activation failed: {0}")]
    ActivationFailed(String),

    /// A discovered session could not be joined.
    #[error("failed to join session: {0}")]
    JoinFailed(String),

    /// A discovered session has no system coordinator to configure.
    #[error("session has no system coordinator")]
    NoSystemCoordinator,

    /// A message could not be handed to the transport.
    #[error("failed to send message: {0}")]
    SendFailed(String),

    /// Opening an immersive space failed or was cancelled.
    #[error("presentation failed: {0}")]
    PresentationFailed(String),

    #[error("failed to encode message: {0}")]
    Encode(String),

    #[error("failed to decode message: {0}")]
    Decode(String),

    #[error("unknown save: {0}")]
    UnknownSave(SaveId),

    /// The controller actor has shut down.
    #[error("session controller is gone")]
    ControllerGone,
}

impl SyncError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::ActivationFailed(_) => "activation_failed",
            Self::JoinFailed(_) => "join_failed",
            Self::NoSystemCoordinator => "no_system_coordinator",
            Self::SendFailed(_) => "send_failed",
            Self::PresentationFailed(_) => "presentation_failed",
            Self::Encode(_) => "encode_failed",
            Self::Decode(_) => "decode_failed",
            Self::UnknownSave(_) => "unknown_save",
            Self::ControllerGone => "controller_gone",
        }
    }

    /// Whether the discovery loop should skip this session and keep going.
    pub fn skips_discovery(&self) -> bool {
        matches!(self, Self::NoSystemCoordinator | Self::JoinFailed(_))
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Decode(err.to_string())
    }
}
