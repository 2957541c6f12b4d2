//! Sync error handling
//!
//! Typed errors for table, channel and protocol operations. Only operations a
//! caller explicitly awaits (`save`, `wait`, one-shot queries) surface these;
//! a single rejected write or malformed frame is reported as a table event
//! instead.

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while synchronizing a table
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// A write was missing one of the table's primary-key fields
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    /// A query was not of the form `{table: [template]}`
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// The operation needs the network and the client is offline
    #[error("Not connected to the server")]
    Disconnected,

    /// The operation did not complete before its deadline
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// The caller cancelled the operation
    #[error("Operation cancelled")]
    Cancelled,

    /// The server refused a specific write
    #[error("Server rejected write '{id}': {message}")]
    ServerRejected { id: String, message: String },

    /// The table (or channel) has been closed
    #[error("Table is closed")]
    Closed,

    /// A channel with this name is already routed on the connection
    #[error("Channel '{0}' is already open on this connection")]
    ChannelInUse(String),

    /// A frame could not be encoded or decoded
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl SyncError {
    /// Check if retrying the same operation later can succeed
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SyncError::Disconnected | SyncError::Timeout(_) | SyncError::ChannelInUse(_)
        )
    }

    /// Get a hint for the caller, if there is a useful one
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            SyncError::Disconnected => Some("Wait for the connection to come back and save again."),
            SyncError::Timeout(_) => Some("The server is slow or unreachable; retry the operation."),
            SyncError::InvalidRecord(_) => {
                Some("Include every primary-key field of the table in the record.")
            }
            SyncError::InvalidQuery(_) => {
                Some("Queries look like {\"table\": [{\"column\": null, \"filter\": value}]}.")
            }
            _ => None,
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Protocol(err.to_string())
    }
}

/// Result type for sync operations
pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        assert!(SyncError::Disconnected.is_recoverable());
        assert!(SyncError::Timeout(Duration::from_secs(1)).is_recoverable());
        assert!(!SyncError::InvalidRecord("id".into()).is_recoverable());
        assert!(!SyncError::Cancelled.is_recoverable());
    }

    #[test]
    fn test_error_display() {
        let err = SyncError::ServerRejected {
            id: "c1:3".to_string(),
            message: "permission denied".to_string(),
        };

        let msg = err.to_string();
        assert!(msg.contains("c1:3"));
        assert!(msg.contains("permission denied"));
    }

    #[test]
    fn test_recovery_suggestion() {
        assert!(SyncError::Disconnected.recovery_suggestion().is_some());
        assert!(SyncError::Closed.recovery_suggestion().is_none());
    }
}
