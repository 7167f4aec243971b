//! Error taxonomy shared by the geometry, engine and worker layers

use thiserror::Error;

/// Errors surfaced by the face pipeline
#[derive(Debug, Error)]
pub enum FaceError {
    /// No model bytes were supplied for the requested model kind.
    #[error("model not found: {0}")]
    ModelNotFound(String),

    /// The inference engine could not be created, even after the CPU retry.
    #[error("interpreter creation failed: {0}")]
    InterpreterCreationFailed(String),

    #[error("image decode failed: {0}")]
    ImageDecodeFailed(String),

    /// Input image below the 16x16 minimum.
    #[error("image too small: {width}x{height} (minimum 16x16)")]
    ImageTooSmall { width: u32, height: u32 },

    #[error("inference failed: {0}")]
    InferenceFailed(String),

    #[error("unexpected tensor shape: {0}")]
    UnexpectedTensorShape(String),

    /// Operation attempted before the owning component was set up.
    #[error("not initialized: {0}")]
    NotInitialized(String),

    #[error("worker handshake timed out after {0}ms")]
    HandshakeTimeout(u64),

    #[error("disposed")]
    Disposed,

    /// Programming or usage error (bad point count, missing image size, ...).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Error string reported by a worker context in an `{id, error}` response.
    #[error("worker error: {0}")]
    Worker(String),
}

impl FaceError {
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidArgument(reason.into())
    }

    pub fn shape(reason: impl Into<String>) -> Self {
        Self::UnexpectedTensorShape(reason.into())
    }

    pub fn inference(reason: impl Into<String>) -> Self {
        Self::InferenceFailed(reason.into())
    }

    /// Stable identifier sent next to the message in worker error responses
    pub fn code(&self) -> &'static str {
        match self {
            Self::ModelNotFound(_) => "model_not_found",
            Self::InterpreterCreationFailed(_) => "interpreter_creation_failed",
            Self::ImageDecodeFailed(_) => "image_decode_failed",
            Self::ImageTooSmall { .. } => "image_too_small",
            Self::InferenceFailed(_) => "inference_failed",
            Self::UnexpectedTensorShape(_) => "unexpected_tensor_shape",
            Self::NotInitialized(_) => "not_initialized",
            Self::HandshakeTimeout(_) => "handshake_timeout",
            Self::Disposed => "disposed",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::Worker(_) => "worker",
        }
    }

    /// Rebuild an error received from a worker context
    ///
    /// Setup failures and disposal keep their kind; everything else arrives
    /// as `Worker` carrying the remote message.
    pub fn from_remote(code: Option<&str>, message: String) -> Self {
        let strip = |prefix: &str| {
            message
                .strip_prefix(prefix)
                .map(str::to_owned)
                .unwrap_or_else(|| message.clone())
        };
        match code {
            Some("disposed") => Self::Disposed,
            Some("model_not_found") => Self::ModelNotFound(strip("model not found: ")),
            Some("interpreter_creation_failed") => {
                Self::InterpreterCreationFailed(strip("interpreter creation failed: "))
            }
            Some("worker") => Self::Worker(strip("worker error: ")),
            _ => Self::Worker(message),
        }
    }
}

pub type Result<T> = std::result::Result<T, FaceError>;
