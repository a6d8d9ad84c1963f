//! Error types for tethering operations.

use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetShareError {
    #[error("Command failed: {command} - {message}")]
    CommandFailed { command: String, message: String },

    #[error("No downstream interface available for sharing")]
    NoDownstreamInterface,

    #[error("Sharing already active for requester '{requester}'")]
    AlreadySharing { requester: String },

    #[error("Requester '{requester}' does not own the sharing session")]
    RequesterMismatch { requester: String },

    #[error("Sharing is recovering from an error ({error})")]
    InErrorState { error: ShareErrorType },

    #[error("Failed to activate downstream interface(s): {}", interfaces.join(", "))]
    ActivationFailed { interfaces: Vec<String> },

    #[error("Sharing failed: {error}")]
    SharingFailed { error: ShareErrorType },

    #[error("Interface {0} is already registered")]
    DuplicateInterface(String),

    #[error("Interface {0} is not registered")]
    UnknownInterface(String),

    #[error("Interface {0} is still up after being brought down")]
    InterfaceStillUp(String),

    #[error("Timed out after {after:?}: {operation}")]
    Timeout { operation: String, after: Duration },

    #[error("Permission denied. Run as root.")]
    PermissionDenied,

    #[error("Failed to parse output: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, NetShareError>;

/// Classification of systemic faults that force the coordinator into Error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShareErrorType {
    /// No specific cause recorded.
    Unspecified,
    /// Applying or removing a forwarding pair failed.
    ForwardingFailed,
    /// The upstream monitor reported an unrecoverable fault.
    UpstreamFault,
    /// An interface could not be brought down.
    InterfaceControl,
    /// A collaborator call exceeded the operation timeout.
    Timeout,
    /// The caller lost the right to share mid-session.
    PermissionLost,
}

impl ShareErrorType {
    /// `Unspecified` never overwrites an error that was already recorded.
    pub fn is_trivial(self) -> bool {
        self == ShareErrorType::Unspecified
    }
}

impl std::fmt::Display for ShareErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            ShareErrorType::Unspecified => "unspecified",
            ShareErrorType::ForwardingFailed => "forwarding failed",
            ShareErrorType::UpstreamFault => "upstream monitor fault",
            ShareErrorType::InterfaceControl => "interface control failed",
            ShareErrorType::Timeout => "operation timed out",
            ShareErrorType::PermissionLost => "permission lost",
        };
        f.write_str(text)
    }
}

impl NetShareError {
    /// Systemic classification of an error raised by a collaborator call.
    pub fn systemic_type(&self, fallback: ShareErrorType) -> ShareErrorType {
        match self {
            NetShareError::Timeout { .. } => ShareErrorType::Timeout,
            NetShareError::PermissionDenied => ShareErrorType::PermissionLost,
            _ => fallback,
        }
    }
}

/// Bound a collaborator call by `after`, mapping expiry to [`NetShareError::Timeout`].
pub async fn with_timeout<T, F>(after: Duration, operation: impl Into<String>, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(result) => result,
        Err(_) => Err(NetShareError::Timeout {
            operation: operation.into(),
            after,
        }),
    }
}
