//! Call signaling actor.
//!
//! Both call tables live here so accepting a call (drop the pending entry,
//! evict earlier calls of both parties, pair them) is one atomic step.
//! A user appears in at most one active call, as either side.

use std::collections::{HashMap, HashSet};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use huddle_shared::protocol::{CallSignal, ServerEvent};
use huddle_shared::types::UserId;

use crate::connections::UserSender;
use crate::supervisor::guarded;

pub(crate) const ACTOR: &str = "calls";

pub(crate) enum CallCommand {
    Request {
        caller: UserId,
        called: UserId,
    },
    Response {
        caller: UserId,
        called: UserId,
        accept: bool,
    },
    Leave {
        uid: UserId,
    },
    RelayOffer {
        caller: UserId,
        signal: CallSignal,
    },
    RelayAnswer {
        called: UserId,
        signal: CallSignal,
    },
    RelayReinitRequest {
        called: UserId,
    },
    Disconnect {
        uid: UserId,
    },
    Snapshot {
        reply: oneshot::Sender<CallSnapshot>,
    },
}

/// Point-in-time copy of both call tables, keyed by caller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallSnapshot {
    pub pending: HashMap<UserId, UserId>,
    pub active: HashMap<UserId, UserId>,
}

type Notice = (Vec<UserId>, ServerEvent);

pub(crate) struct CallManager {
    pending: HashMap<UserId, UserId>,
    active: HashMap<UserId, UserId>,
    users: UserSender,
}

impl CallManager {
    pub(crate) fn new(users: UserSender) -> Self {
        Self {
            pending: HashMap::new(),
            active: HashMap::new(),
            users,
        }
    }

    pub(crate) async fn run(mut self, mut rx: mpsc::Receiver<CallCommand>) {
        while let Some(command) = rx.recv().await {
            guarded(ACTOR, self.handle(command)).await;
        }
        debug!("Call manager stopped");
    }

    async fn handle(&mut self, command: CallCommand) {
        let notices = match command {
            CallCommand::Request { caller, called } => self.request(caller, called),
            CallCommand::Response {
                caller,
                called,
                accept,
            } => self.respond(caller, called, accept),
            CallCommand::Leave { uid } => self.leave(uid),
            CallCommand::RelayOffer { caller, signal } => self
                .active
                .get(&caller)
                .map(|called| vec![(vec![*called], ServerEvent::CallOfferFromInitiator(signal))])
                .unwrap_or_default(),
            CallCommand::RelayAnswer { called, signal } => self
                .caller_of(called)
                .map(|caller| vec![(vec![caller], ServerEvent::CallAnswerFromRecipient(signal))])
                .unwrap_or_default(),
            CallCommand::RelayReinitRequest { called } => self
                .caller_of(called)
                .map(|caller| vec![(vec![caller], ServerEvent::CallRequestedReinitialization {})])
                .unwrap_or_default(),
            CallCommand::Disconnect { uid } => self.disconnect(uid),
            CallCommand::Snapshot { reply } => {
                let _ = reply.send(CallSnapshot {
                    pending: self.pending.clone(),
                    active: self.active.clone(),
                });
                Vec::new()
            }
        };

        for (uids, event) in notices {
            self.users
                .send_event(uids.into_iter().collect::<HashSet<_>>(), &event)
                .await;
        }
    }

    fn request(&mut self, caller: UserId, called: UserId) -> Vec<Notice> {
        let mut notices = Vec::new();
        if let Some(previous) = self.pending.insert(caller, called) {
            if previous != called {
                debug!(
                    caller = %caller.short(),
                    previous = %previous.short(),
                    "Superseding pending call"
                );
                notices.push(rejection(caller, previous));
            }
        }
        notices.push((
            vec![caller, called],
            ServerEvent::CallUserAcknowledge { caller, called },
        ));
        notices
    }

    fn respond(&mut self, caller: UserId, called: UserId, accept: bool) -> Vec<Notice> {
        let was_pending = self.pending.get(&caller) == Some(&called);
        if was_pending {
            self.pending.remove(&caller);
        }

        let mut notices = Vec::new();
        if accept {
            if !was_pending {
                debug!(
                    caller = %caller.short(),
                    called = %called.short(),
                    "Refusing accept with no pending call"
                );
                return vec![rejection(caller, called)];
            }
            for party in [caller, called] {
                if let Some(peer) = self.end_active(party) {
                    notices.push((vec![peer], ServerEvent::CallLeft {}));
                }
            }
            self.active.insert(caller, called);
            info!(caller = %caller.short(), called = %called.short(), "Call established");
        }

        notices.push((
            vec![caller, called],
            ServerEvent::CallUserResponse {
                caller,
                called,
                accept,
            },
        ));
        notices
    }

    fn leave(&mut self, uid: UserId) -> Vec<Notice> {
        match self.end_active(uid) {
            Some(peer) => {
                info!(user = %uid.short(), "Left call");
                vec![(vec![peer], ServerEvent::CallLeft {})]
            }
            None => Vec::new(),
        }
    }

    fn disconnect(&mut self, uid: UserId) -> Vec<Notice> {
        let mut notices = Vec::new();

        if let Some(called) = self.pending.remove(&uid) {
            notices.push((vec![called], rejection(uid, called).1));
        }
        let callers: Vec<UserId> = self
            .pending
            .iter()
            .filter(|(_, called)| **called == uid)
            .map(|(caller, _)| *caller)
            .collect();
        for caller in callers {
            self.pending.remove(&caller);
            notices.push((vec![caller], rejection(caller, uid).1));
        }

        notices.extend(self.leave(uid));
        notices
    }

    /// Remove the active call `uid` takes part in and return the peer.
    fn end_active(&mut self, uid: UserId) -> Option<UserId> {
        if let Some(called) = self.active.remove(&uid) {
            return Some(called);
        }
        let caller = self.caller_of(uid)?;
        self.active.remove(&caller);
        Some(caller)
    }

    fn caller_of(&self, called: UserId) -> Option<UserId> {
        self.active
            .iter()
            .find(|(_, c)| **c == called)
            .map(|(caller, _)| *caller)
    }
}

/// Synthetic rejection of `caller`'s call to `called`, for both of them.
fn rejection(caller: UserId, called: UserId) -> Notice {
    (
        vec![caller, called],
        ServerEvent::CallUserResponse {
            caller,
            called,
            accept: false,
        },
    )
}
