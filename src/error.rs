use thiserror::Error;

/// Boxed error cause carried by [`TransportError`] variants.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur while bridging MCP traffic over a broker.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Broker connect, channel, link or publish failure.
    #[error("connection error: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// A required configuration field is missing or invalid.
    #[error("invalid configuration for `{field}`: {message}")]
    Validation { field: &'static str, message: String },

    /// Payload could not be decoded or does not form a JSON-RPC record.
    #[error("message error: {message}")]
    Message {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// `send()` was called before `start()` completed.
    #[error("transport not started")]
    NotStarted,

    /// `start()` was called on a transport that is not idle.
    #[error("transport already started")]
    AlreadyStarted,

    /// The transport (or its broker connection) has been closed.
    #[error("transport closed")]
    Closed,

    /// Stdio or subprocess I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    // ---

    /// Connection error with the broker client's original cause attached.
    pub fn connection<E>(message: impl Into<String>, source: E) -> Self
    where
        E: Into<BoxError>,
    {
        // ---
        Self::Connection {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Connection error without an underlying cause.
    pub fn connection_msg(message: impl Into<String>) -> Self {
        // ---
        Self::Connection {
            message: message.into(),
            source: None,
        }
    }

    /// Message error with the decoder's original cause attached.
    pub fn message<E>(message: impl Into<String>, source: E) -> Self
    where
        E: Into<BoxError>,
    {
        // ---
        Self::Message {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Message error without an underlying cause.
    pub fn message_msg(message: impl Into<String>) -> Self {
        // ---
        Self::Message {
            message: message.into(),
            source: None,
        }
    }

    /// Validation error naming the offending field.
    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        // ---
        Self::Validation {
            field,
            message: message.into(),
        }
    }

    /// Name of the configuration field for validation errors.
    pub fn field(&self) -> Option<&'static str> {
        match self {
            Self::Validation { field, .. } => Some(field),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        Self::message("invalid JSON payload", err)
    }
}

/// Result type alias for transport operations
pub type Result<T> = std::result::Result<T, TransportError>;

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_connection_keeps_cause() {
        // ---
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = TransportError::connection("amqp: connection failed", io);

        assert!(err.to_string().contains("amqp: connection failed"));
        assert_eq!(err.source().map(|s| s.to_string()), Some("refused".into()));
    }

    #[test]
    fn test_validation_names_field() {
        // ---
        let err = TransportError::validation("hostname", "must be provided");
        assert_eq!(err.field(), Some("hostname"));
        assert!(err.to_string().contains("`hostname`"));
    }

    #[test]
    fn test_json_error_is_message_error() {
        // ---
        let err: TransportError = serde_json::from_str::<serde_json::Value>("{nope")
            .unwrap_err()
            .into();
        assert!(matches!(err, TransportError::Message { source: Some(_), .. }));
    }
}
