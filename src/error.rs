use thiserror::Error;

/// Errors surfaced by the offline data layer.
///
/// Network-class failures are recovered internally (fall back to the local
/// store, queue the mutation); callers only see `Network` when no local
/// fallback exists at all. Non-network remote failures propagate untouched
/// as `RemoteRejected`.
#[derive(Debug, Error)]
pub enum DataError {
    /// No live session and no cached user id to fall back to.
    #[error("no resolvable user id")]
    Unauthenticated,

    /// Transient inability to reach the server.
    #[error("network unreachable: {0}")]
    Network(String),

    /// The server explicitly rejected the request (validation, business
    /// rule, conflict). Never retried automatically.
    #[error("server rejected the request: {0}")]
    RemoteRejected(String),

    /// The local persistence engine cannot be opened or has failed. There is
    /// no further fallback.
    #[error("local store unavailable: {0}")]
    StorageUnavailable(String),

    /// An update or delete referenced a record that does not exist for the
    /// current user.
    #[error("{entity} {id} not found")]
    RecordNotFound { entity: &'static str, id: String },

    /// Input failed entity constraints before any write was attempted.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl From<rusqlite::Error> for DataError {
    fn from(e: rusqlite::Error) -> Self {
        DataError::StorageUnavailable(e.to_string())
    }
}

impl From<serde_json::Error> for DataError {
    fn from(e: serde_json::Error) -> Self {
        DataError::StorageUnavailable(format!("corrupt record body: {e}"))
    }
}
