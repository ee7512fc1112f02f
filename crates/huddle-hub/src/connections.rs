//! Connection registry actor: which user each live connection belongs to,
//! and direct delivery to all of a user's connections.

use std::collections::{HashMap, HashSet};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use huddle_shared::protocol::{Frame, ServerEvent};
use huddle_shared::types::{ConnId, UserId};

use crate::dispatch::Connection;
use crate::supervisor::guarded;

pub(crate) const ACTOR: &str = "connections";

pub(crate) enum ConnectionCommand {
    Register {
        conn: Connection,
        uid: Option<UserId>,
    },
    Unregister {
        conn_id: ConnId,
        reply: oneshot::Sender<Option<Departure>>,
    },
    SendToUsers {
        uids: HashSet<UserId>,
        frame: Frame,
    },
    IsOnline {
        uid: UserId,
        reply: oneshot::Sender<bool>,
    },
    Count {
        reply: oneshot::Sender<usize>,
    },
}

/// Outcome of removing a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Departure {
    pub uid: Option<UserId>,
    /// The connection was its user's last one.
    pub last_for_user: bool,
}

/// Sender side used by the other actors to reach users directly.
#[derive(Clone)]
pub(crate) struct UserSender {
    tx: mpsc::Sender<ConnectionCommand>,
}

impl UserSender {
    pub(crate) fn new(tx: mpsc::Sender<ConnectionCommand>) -> Self {
        Self { tx }
    }

    /// Encode `event` and queue it for every connection of every user in
    /// `uids`. Best effort: offline users are skipped.
    pub(crate) async fn send_event(&self, uids: HashSet<UserId>, event: &ServerEvent) {
        if uids.is_empty() {
            return;
        }
        let frame = match Frame::event(event) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Failed to encode event: {}", e);
                return;
            }
        };
        if self
            .tx
            .send(ConnectionCommand::SendToUsers { uids, frame })
            .await
            .is_err()
        {
            warn!("Connection registry is gone, event dropped");
        }
    }
}

#[derive(Default)]
pub(crate) struct ConnectionRegistry {
    connections: HashMap<ConnId, (Connection, Option<UserId>)>,
    by_user: HashMap<UserId, HashSet<ConnId>>,
}

impl ConnectionRegistry {
    pub(crate) async fn run(mut self, mut rx: mpsc::Receiver<ConnectionCommand>) {
        while let Some(command) = rx.recv().await {
            guarded(ACTOR, self.handle(command)).await;
        }
        debug!("Connection registry stopped");
    }

    async fn handle(&mut self, command: ConnectionCommand) {
        match command {
            ConnectionCommand::Register { conn, uid } => self.register(conn, uid),
            ConnectionCommand::Unregister { conn_id, reply } => {
                let _ = reply.send(self.unregister(conn_id));
            }
            ConnectionCommand::SendToUsers { uids, frame } => {
                for conn in self.connections_of(&uids) {
                    conn.deliver(frame.clone());
                }
            }
            ConnectionCommand::IsOnline { uid, reply } => {
                let _ = reply.send(self.by_user.contains_key(&uid));
            }
            ConnectionCommand::Count { reply } => {
                let _ = reply.send(self.connections.len());
            }
        }
    }

    fn register(&mut self, conn: Connection, uid: Option<UserId>) {
        let conn_id = conn.id();
        if let Some(uid) = uid {
            self.by_user.entry(uid).or_default().insert(conn_id);
        }
        if let Some((_, previous)) = self.connections.insert(conn_id, (conn, uid)) {
            // Re-registration under a different identity; drop the stale index entry.
            if previous != uid {
                if let Some(previous) = previous {
                    self.forget(previous, conn_id);
                }
            }
        }
        info!(
            conn = %conn_id,
            user = uid.map(|u| u.short()).unwrap_or_else(|| "anonymous".into()),
            "Connection registered"
        );
    }

    fn unregister(&mut self, conn_id: ConnId) -> Option<Departure> {
        let (_, uid) = self.connections.remove(&conn_id)?;
        let last_for_user = match uid {
            Some(uid) => self.forget(uid, conn_id),
            None => false,
        };
        info!(conn = %conn_id, last_for_user, "Connection unregistered");
        Some(Departure { uid, last_for_user })
    }

    /// Remove `conn_id` from the user's index; true if it was the last one.
    fn forget(&mut self, uid: UserId, conn_id: ConnId) -> bool {
        let Some(conns) = self.by_user.get_mut(&uid) else {
            return false;
        };
        conns.remove(&conn_id);
        if conns.is_empty() {
            self.by_user.remove(&uid);
            true
        } else {
            false
        }
    }

    fn connections_of(&self, uids: &HashSet<UserId>) -> Vec<Connection> {
        uids.iter()
            .filter_map(|uid| self.by_user.get(uid))
            .flatten()
            .filter_map(|conn_id| self.connections.get(conn_id))
            .map(|(conn, _)| conn.clone())
            .collect()
    }
}
