//! # huddle-hub
//!
//! The real-time core of a huddle server. It tracks live connections, fans
//! events out to topic subscribers, ingests chunked attachment uploads and
//! brokers 1:1 call signaling.
//!
//! Every mutable registry is owned by a single actor task and only touched
//! through that actor's command channel:
//!
//! - **connections** -- connection id to user id, direct-to-user delivery
//! - **subscriptions** -- topic membership, per-connection cap, fan-out
//! - **attachments** -- in-flight uploads, chunk storage, timeout sweep
//! - **calls** -- pending and active call tables
//!
//! Outbound frames are queued on a per-connection [`Connection`] outbox that
//! exactly one writer task drains, so a connection is never written to
//! concurrently and per-connection order is preserved.
//!
//! [`Hub`] is the cloneable handle collaborators use. Operations spanning
//! several registries (unregistering a connection) are sequenced by the
//! handle in the fixed order connections, subscriptions, attachments, calls;
//! no actor ever waits on an actor earlier in that order.

mod attachments;
mod calls;
mod config;
mod connections;
mod dispatch;
mod error;
mod hub;
mod subscriptions;
mod supervisor;

pub use attachments::{AttachmentDownload, ChunkAck};
pub use calls::CallSnapshot;
pub use config::HubConfig;
pub use dispatch::{run_writer, Connection, OutboxReceiver};
pub use error::{AttachmentError, CallError, HubError};
pub use hub::Hub;
