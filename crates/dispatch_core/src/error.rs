use std::time::Duration;

use shared::{
    domain::{LoadId, LoadStatus},
    error::ApiError,
    protocol::SnapshotError,
};
use thiserror::Error;

use crate::pending::OperationKind;

/// Failure talking to the load service. Every variant is treated as "the
/// service did not accept the change".
#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    #[error("load service unreachable: {0}")]
    Transport(String),
    #[error("load service responded with status {status}{}", describe_api_error(.api))]
    Status { status: u16, api: Option<ApiError> },
    #[error("load service did not answer within {after:?}")]
    Timeout { after: Duration },
    #[error("load service sent an unreadable payload: {0}")]
    Decode(String),
}

fn describe_api_error(api: &Option<ApiError>) -> String {
    match api {
        Some(api) => format!(" ({:?}: {})", api.code, api.message),
        None => String::new(),
    }
}

impl RemoteError {
    pub fn is_transient(&self) -> bool {
        match self {
            RemoteError::Transport(_) | RemoteError::Timeout { .. } => true,
            RemoteError::Status { status, api } => {
                *status >= 500 || api.as_ref().is_some_and(|api| api.code.is_transient())
            }
            RemoteError::Decode(_) => false,
        }
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            RemoteError::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            RemoteError::Status {
                status: status.as_u16(),
                api: None,
            }
        } else {
            RemoteError::Transport(err.to_string())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("load {load_id} is available but carries a driver")]
    AvailableWithDriver { load_id: LoadId },
}

#[derive(Debug, Clone, Error)]
pub enum SyncError {
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("malformed board snapshot: {0}")]
    MalformedSnapshot(#[from] SnapshotError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchErrorKind {
    InvalidTransition,
    Precondition,
    Conflict,
    UnknownLoad,
    MutationFailed,
    SyncFailed,
    Internal,
}

#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    #[error("load {load_id} cannot move from {from} to {to}")]
    InvalidTransition {
        load_id: LoadId,
        from: LoadStatus,
        to: LoadStatus,
    },
    #[error("load {load_id}: {reason}")]
    Precondition { load_id: LoadId, reason: String },
    #[error("load {load_id} already has a pending {pending}; retry once it settles")]
    Conflict {
        load_id: LoadId,
        pending: OperationKind,
    },
    #[error("load {load_id} is not on the board")]
    UnknownLoad { load_id: LoadId },
    #[error("{operation} for load {load_id} was rolled back: {source}")]
    MutationFailed {
        load_id: LoadId,
        operation: OperationKind,
        #[source]
        source: RemoteError,
    },
    #[error("board refresh failed: {0}")]
    SyncFailed(#[from] SyncError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl DispatchError {
    pub fn kind(&self) -> DispatchErrorKind {
        match self {
            DispatchError::InvalidTransition { .. } => DispatchErrorKind::InvalidTransition,
            DispatchError::Precondition { .. } => DispatchErrorKind::Precondition,
            DispatchError::Conflict { .. } => DispatchErrorKind::Conflict,
            DispatchError::UnknownLoad { .. } => DispatchErrorKind::UnknownLoad,
            DispatchError::MutationFailed { .. } => DispatchErrorKind::MutationFailed,
            DispatchError::SyncFailed(_) => DispatchErrorKind::SyncFailed,
            DispatchError::Registry(_) => DispatchErrorKind::Internal,
        }
    }

    /// Whether repeating the same user action later can succeed. Validation
    /// failures need a different action instead.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            DispatchErrorKind::Conflict
                | DispatchErrorKind::MutationFailed
                | DispatchErrorKind::SyncFailed
        )
    }

    pub(crate) fn precondition(load_id: LoadId, reason: impl Into<String>) -> Self {
        DispatchError::Precondition {
            load_id,
            reason: reason.into(),
        }
    }
}
