use thiserror::Error;

/// Errors raised while decoding or encoding event payloads.
#[derive(Debug, Error)]
pub enum EventError {
    /// The payload JSON did not match the schema of its type tag.
    #[error("Malformed payload for event type {event_type}: {source}")]
    MalformedPayload {
        event_type: String,
        #[source]
        source: serde_json::Error,
    },

    /// Event payloads must be JSON objects.
    #[error("Payload for event type {event_type} is not a JSON object")]
    PayloadNotObject { event_type: String },

    /// An event type tag was empty.
    #[error("Event type must not be empty")]
    EmptyEventType,

    /// A serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for event operations.
pub type Result<T> = std::result::Result<T, EventError>;
