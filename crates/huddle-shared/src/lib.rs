//! # huddle-shared
//!
//! Types shared by every huddle crate: identifiers, topic names, protocol
//! constants and the JSON wire format spoken over the WebSocket.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod types;

pub use error::ProtocolError;
pub use protocol::{ClientEvent, Frame, ServerEvent};
pub use types::{ChunkId, ConnId, MessageId, Topic, UserId};
