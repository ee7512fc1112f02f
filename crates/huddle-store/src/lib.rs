//! # huddle-store
//!
//! Document storage for chat attachments. An attachment is one metadata
//! record keyed by its message id plus a singly linked list of chunk
//! records; the first chunk's id equals the message id so a download can
//! start without a separate index.
//!
//! [`AttachmentStore`] is the seam the hub talks to. [`Database`] backs it
//! with SQLite, [`MemoryStore`] keeps everything in process memory.

pub mod attachments;
pub mod database;
pub mod memory;
pub mod migrations;
pub mod models;
pub mod store;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use models::*;
pub use store::AttachmentStore;
