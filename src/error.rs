use crate::types::ConnId;

pub type Result<T> = std::result::Result<T, TrigonError>;

#[derive(Debug, thiserror::Error)]
pub enum TrigonError {
    #[error("device operation failed: {message}")]
    Device {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("allocation of {bytes} bytes failed: {reason}")]
    Allocation { bytes: usize, reason: String },

    #[error("transport operation on connection {conn_id} failed: {reason}")]
    Transport { conn_id: ConnId, reason: String },

    /// A transport call has been posted but not yet completed. Not a
    /// failure; the proxy loop keeps running when it sees this.
    #[error("operation still in progress")]
    InProgress,

    #[error("connection id {conn_id} out of range: communicator has {count} connections")]
    UnknownConnection { conn_id: ConnId, count: usize },

    #[error("trigger field {field} = {value} exceeds its {bits}-bit encoding")]
    TriggerOverflow {
        field: &'static str,
        value: u64,
        bits: u32,
    },

    #[error("NUMA bind to node {node} failed: {reason}")]
    NumaBind { node: usize, reason: String },

    #[error("proxy limit reached: communicator allows at most {max}")]
    TooManyProxies { max: usize },

    #[error("connection limit reached: communicator allows at most {max}")]
    TooManyConnections { max: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TrigonError {
    /// Create a `Device` error with just a message.
    pub fn device(msg: impl Into<String>) -> Self {
        Self::Device {
            message: msg.into(),
            source: None,
        }
    }

    /// Create a `Device` error with a message and a source error.
    pub fn device_with_source(
        msg: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Device {
            message: msg.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a `Transport` error for the given connection.
    pub fn transport(conn_id: ConnId, reason: impl Into<String>) -> Self {
        Self::Transport {
            conn_id,
            reason: reason.into(),
        }
    }

    /// True for return codes the proxy loop must not treat as fatal.
    pub fn is_in_progress(&self) -> bool {
        matches!(self, Self::InProgress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_display() {
        let e = TrigonError::device("stream create failed");
        assert_eq!(
            e.to_string(),
            "device operation failed: stream create failed"
        );
    }

    #[test]
    fn test_transport_display() {
        let e = TrigonError::transport(3, "post_send rc=12");
        assert_eq!(
            e.to_string(),
            "transport operation on connection 3 failed: post_send rc=12"
        );
    }

    #[test]
    fn test_in_progress_classification() {
        assert!(TrigonError::InProgress.is_in_progress());
        assert!(!TrigonError::device("x").is_in_progress());
    }

    #[test]
    fn test_source_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::OutOfMemory, "mmap failed");
        let e = TrigonError::device_with_source("pinned alloc", io);
        assert!(std::error::Error::source(&e).is_some());
    }
}
