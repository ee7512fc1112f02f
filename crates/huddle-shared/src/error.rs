use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Missing event_type")]
    MissingEventType,

    #[error("Unrecognized event type: {0}")]
    UnknownEvent(String),

    #[error("Invalid ID: {0}")]
    InvalidId(String),
}
