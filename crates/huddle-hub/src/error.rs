use thiserror::Error;

use huddle_shared::types::MessageId;
use huddle_store::StoreError;

#[derive(Error, Debug)]
pub enum HubError {
    #[error("Hub actor '{0}' is not running")]
    Closed(&'static str),

    #[error("Attachment error: {0}")]
    Attachment(#[from] AttachmentError),

    #[error("Call error: {0}")]
    Call(#[from] CallError),

    #[error("Encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum AttachmentError {
    #[error("No attachment metadata for message {0}")]
    NoMetadata(MessageId),

    #[error("Attachment metadata for message {0} already exists")]
    AlreadyExists(MessageId),

    #[error("Attachment upload for message {0} failed")]
    Failed(MessageId),

    #[error("Attachment upload for message {0} timed out")]
    TimedOut(MessageId),

    #[error("Attachment for message {0} is not yet complete")]
    Incomplete(MessageId),

    #[error("Attachment for message {0} is missing chunks")]
    Corrupt(MessageId),

    #[error("Chunk too large: {size} bytes (max {max})")]
    ChunkTooLarge { size: usize, max: usize },

    #[error("Attachment too large: {size} bytes (max {max})")]
    TooLarge { size: u64, max: u64 },

    #[error("Attachment storage error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CallError {
    #[error("You cannot call yourself")]
    SelfCall,

    #[error("You cannot accept a call to another user on your own behalf")]
    AcceptOnOwnBehalf,

    #[error("You are not a party to this call")]
    NotAParty,
}
