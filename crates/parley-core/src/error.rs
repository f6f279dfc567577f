//! Public error taxonomy of the chat controller.

use thiserror::Error;

use crate::credentials::CredentialError;
use crate::providers::{ProviderError, ProviderErrorKind};
use crate::transcript::{RegenerateError, TranscriptError};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatError {
    /// No usable credential; raised before any network call.
    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error("network error: {0}")]
    Network(String),

    #[error("{message}")]
    HttpStatus { status: u16, message: String },

    /// Error reported by the vendor mid-stream.
    #[error("{message}")]
    Api { message: String },

    #[error(transparent)]
    Regenerate(#[from] RegenerateError),

    #[error("a response is already being generated")]
    Busy,

    #[error("{model} does not accept image attachments")]
    VisionUnsupported { model: String },

    #[error(transparent)]
    Transcript(#[from] TranscriptError),

    /// The request could not be assembled; nothing was sent.
    #[error("{0}")]
    Setup(String),
}

impl ChatError {
    /// Whether the error came from a session that reached the network.
    pub fn is_session_failure(&self) -> bool {
        matches!(
            self,
            ChatError::Network(_) | ChatError::HttpStatus { .. } | ChatError::Api { .. }
        )
    }
}

impl From<ProviderError> for ChatError {
    fn from(err: ProviderError) -> Self {
        match err.kind {
            ProviderErrorKind::HttpStatus => ChatError::HttpStatus {
                status: err.status.unwrap_or_default(),
                message: err.message,
            },
            ProviderErrorKind::Network => ChatError::Network(err.message),
            ProviderErrorKind::ApiError | ProviderErrorKind::Parse => {
                ChatError::Api { message: err.message }
            }
            ProviderErrorKind::InvalidRequest => ChatError::Setup(err.message),
        }
    }
}
