use std::time::Duration;

use huddle_shared::constants::{
    COMMAND_BUFFER, MAX_ATTACHMENT_SIZE, MAX_SUBSCRIPTIONS_PER_CONNECTION, OUTBOX_BUFFER,
    UPLOAD_SWEEP_INTERVAL,
};

/// Tunables for the hub's actors.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Topics one connection may hold before further subscribes are ignored.
    pub max_subscriptions: usize,

    /// How often the upload sweep runs. An upload idle for longer than this
    /// is timed out.
    pub upload_sweep_interval: Duration,

    /// Largest declared attachment size accepted at registration.
    pub max_attachment_size: u64,

    /// Capacity of every actor command channel. Senders wait when full.
    pub command_buffer: usize,

    /// Capacity of each connection's outbound queue.
    pub outbox_buffer: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            max_subscriptions: MAX_SUBSCRIPTIONS_PER_CONNECTION,
            upload_sweep_interval: UPLOAD_SWEEP_INTERVAL,
            max_attachment_size: MAX_ATTACHMENT_SIZE,
            command_buffer: COMMAND_BUFFER,
            outbox_buffer: OUTBOX_BUFFER,
        }
    }
}
