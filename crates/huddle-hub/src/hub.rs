use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use huddle_shared::protocol::{CallSignal, Frame, ServerEvent};
use huddle_shared::types::{ConnId, MessageId, Topic, UserId};
use huddle_store::{AttachmentMetadata, AttachmentStore};

use crate::attachments::{self, AttachmentCommand, AttachmentDownload, AttachmentManager, ChunkAck};
use crate::calls::{self, CallCommand, CallManager, CallSnapshot};
use crate::config::HubConfig;
use crate::connections::{self, ConnectionCommand, ConnectionRegistry, Departure, UserSender};
use crate::dispatch::{Connection, OutboxReceiver};
use crate::error::{AttachmentError, CallError, HubError};
use crate::subscriptions::{self, SubscriptionCommand, SubscriptionRegistry};

/// Cloneable handle to a running hub.
///
/// Every method forwards to the owning actor's command channel and waits
/// for channel capacity, which is the hub's only form of backpressure.
/// Methods returning data wait for the actor's reply.
#[derive(Clone)]
pub struct Hub {
    connections: mpsc::Sender<ConnectionCommand>,
    subscriptions: mpsc::Sender<SubscriptionCommand>,
    attachments: mpsc::Sender<AttachmentCommand>,
    calls: mpsc::Sender<CallCommand>,
    next_conn: Arc<AtomicU64>,
    outbox_buffer: usize,
}

impl Hub {
    /// Spawn the hub's actors on the current tokio runtime.
    pub fn start<S>(config: HubConfig, store: S) -> Self
    where
        S: AttachmentStore + 'static,
    {
        let buffer = config.command_buffer.max(1);
        let (conn_tx, conn_rx) = mpsc::channel(buffer);
        let (sub_tx, sub_rx) = mpsc::channel(buffer);
        let (att_tx, att_rx) = mpsc::channel(buffer);
        let (call_tx, call_rx) = mpsc::channel(buffer);

        let users = UserSender::new(conn_tx.clone());

        tokio::spawn(ConnectionRegistry::default().run(conn_rx));
        tokio::spawn(SubscriptionRegistry::new(config.max_subscriptions).run(sub_rx));
        tokio::spawn(
            AttachmentManager::new(
                store,
                users.clone(),
                config.upload_sweep_interval,
                config.max_attachment_size,
            )
            .run(att_rx),
        );
        tokio::spawn(CallManager::new(users).run(call_rx));

        info!(
            max_subscriptions = config.max_subscriptions,
            sweep_secs = config.upload_sweep_interval.as_secs(),
            "Hub started"
        );

        Self {
            connections: conn_tx,
            subscriptions: sub_tx,
            attachments: att_tx,
            calls: call_tx,
            next_conn: Arc::new(AtomicU64::new(1)),
            outbox_buffer: config.outbox_buffer,
        }
    }

    // -- connections ---------------------------------------------------------

    /// Allocate a connection with a fresh id. The receiver must be handed to
    /// the connection's writer task.
    pub fn new_connection(&self) -> (Connection, OutboxReceiver) {
        let id = ConnId(self.next_conn.fetch_add(1, Ordering::Relaxed));
        Connection::new(id, self.outbox_buffer)
    }

    /// Allocate and register a connection in one step.
    pub async fn connect(
        &self,
        uid: Option<UserId>,
    ) -> Result<(Connection, OutboxReceiver), HubError> {
        let (conn, rx) = self.new_connection();
        self.register_connection(conn.clone(), uid).await?;
        Ok((conn, rx))
    }

    /// Register a live connection and announce the user online on
    /// `user=<uid>`. Anonymous connections announce nothing.
    pub async fn register_connection(
        &self,
        conn: Connection,
        uid: Option<UserId>,
    ) -> Result<(), HubError> {
        send(
            &self.connections,
            connections::ACTOR,
            ConnectionCommand::Register { conn, uid },
        )
        .await?;
        if let Some(uid) = uid {
            self.publish_event(&Topic::user(&uid), &ServerEvent::presence(&uid, true))
                .await?;
        }
        Ok(())
    }

    /// Tear a connection down across every registry, in order: connection
    /// registry, subscriptions (then the offline announcement), uploads,
    /// calls. Upload and call cleanup only run when this was the user's
    /// last connection.
    pub async fn unregister_connection(&self, conn_id: ConnId) -> Result<(), HubError> {
        let departure = request(&self.connections, connections::ACTOR, |reply| {
            ConnectionCommand::Unregister { conn_id, reply }
        })
        .await?;

        send(
            &self.subscriptions,
            subscriptions::ACTOR,
            SubscriptionCommand::RemoveConnection { conn_id },
        )
        .await?;

        let Some(Departure {
            uid: Some(uid),
            last_for_user: true,
        }) = departure
        else {
            return Ok(());
        };

        self.publish_event(&Topic::user(&uid), &ServerEvent::presence(&uid, false))
            .await?;
        send(
            &self.attachments,
            attachments::ACTOR,
            AttachmentCommand::UploaderDisconnected { uid },
        )
        .await?;
        send(&self.calls, calls::ACTOR, CallCommand::Disconnect { uid }).await?;
        debug!(user = %uid.short(), "User went offline");
        Ok(())
    }

    pub async fn is_online(&self, uid: UserId) -> Result<bool, HubError> {
        request(&self.connections, connections::ACTOR, |reply| {
            ConnectionCommand::IsOnline { uid, reply }
        })
        .await
    }

    pub async fn connection_count(&self) -> Result<usize, HubError> {
        request(&self.connections, connections::ACTOR, |reply| {
            ConnectionCommand::Count { reply }
        })
        .await
    }

    /// Queue a frame for every live connection of `uid`. Dropped if the
    /// user is offline.
    pub async fn send_to_user(&self, uid: UserId, frame: Frame) -> Result<(), HubError> {
        self.send_to_users(HashSet::from([uid]), frame).await
    }

    pub async fn send_to_users(&self, uids: HashSet<UserId>, frame: Frame) -> Result<(), HubError> {
        send(
            &self.connections,
            connections::ACTOR,
            ConnectionCommand::SendToUsers { uids, frame },
        )
        .await
    }

    /// Serialize `payload`, merge `TYPE: event_type` into it and send it to
    /// the given users.
    pub async fn send_typed<T: Serialize + ?Sized>(
        &self,
        uids: HashSet<UserId>,
        event_type: &str,
        payload: &T,
    ) -> Result<(), HubError> {
        let frame = Frame::typed(event_type, payload)?;
        self.send_to_users(uids, frame).await
    }

    // -- subscriptions -------------------------------------------------------

    /// Subscribe a connection to a topic. A connection already holding the
    /// maximum number of topics is left unchanged.
    pub async fn subscribe(
        &self,
        topic: Topic,
        uid: Option<UserId>,
        conn: &Connection,
    ) -> Result<(), HubError> {
        send(
            &self.subscriptions,
            subscriptions::ACTOR,
            SubscriptionCommand::Subscribe {
                topic,
                uid,
                conn: conn.clone(),
            },
        )
        .await
    }

    pub async fn unsubscribe(&self, topic: Topic, conn_id: ConnId) -> Result<(), HubError> {
        send(
            &self.subscriptions,
            subscriptions::ACTOR,
            SubscriptionCommand::Unsubscribe { topic, conn_id },
        )
        .await
    }

    pub async fn remove_user_from_topic(&self, topic: Topic, uid: UserId) -> Result<(), HubError> {
        send(
            &self.subscriptions,
            subscriptions::ACTOR,
            SubscriptionCommand::RemoveUserFromTopic { topic, uid },
        )
        .await
    }

    pub async fn destroy_topic(&self, topic: Topic) -> Result<(), HubError> {
        send(
            &self.subscriptions,
            subscriptions::ACTOR,
            SubscriptionCommand::DestroyTopic { topic },
        )
        .await
    }

    pub async fn publish(&self, topic: Topic, frame: Frame) -> Result<(), HubError> {
        self.publish_to_many_exclusive(vec![topic], frame, HashSet::new())
            .await
    }

    /// Publish to a topic, skipping every connection of the excluded users.
    pub async fn publish_exclusive(
        &self,
        topic: Topic,
        frame: Frame,
        exclude: HashSet<UserId>,
    ) -> Result<(), HubError> {
        self.publish_to_many_exclusive(vec![topic], frame, exclude)
            .await
    }

    /// Publish to several topics. A connection subscribed to more than one
    /// of them receives the frame once.
    pub async fn publish_to_many(&self, topics: Vec<Topic>, frame: Frame) -> Result<(), HubError> {
        self.publish_to_many_exclusive(topics, frame, HashSet::new())
            .await
    }

    pub async fn publish_to_many_exclusive(
        &self,
        topics: Vec<Topic>,
        frame: Frame,
        exclude: HashSet<UserId>,
    ) -> Result<(), HubError> {
        send(
            &self.subscriptions,
            subscriptions::ACTOR,
            SubscriptionCommand::Publish {
                topics,
                frame,
                exclude,
            },
        )
        .await
    }

    async fn publish_event(&self, topic: &Topic, event: &ServerEvent) -> Result<(), HubError> {
        self.publish(topic.clone(), Frame::event(event)?).await
    }

    /// Users with at least one connection subscribed to `topic`.
    pub async fn topic_members(&self, topic: Topic) -> Result<HashSet<UserId>, HubError> {
        request(&self.subscriptions, subscriptions::ACTOR, |reply| {
            SubscriptionCommand::Members { topic, reply }
        })
        .await
    }

    pub async fn subscription_count(&self, conn_id: ConnId) -> Result<usize, HubError> {
        request(&self.subscriptions, subscriptions::ACTOR, |reply| {
            SubscriptionCommand::SubscriptionCount { conn_id, reply }
        })
        .await
    }

    // -- attachments ---------------------------------------------------------

    pub async fn register_attachment(
        &self,
        meta: AttachmentMetadata,
    ) -> Result<AttachmentMetadata, HubError> {
        attachment_request(&self.attachments, |reply| AttachmentCommand::RegisterMetadata {
            meta,
            reply,
        })
        .await
    }

    pub async fn attachment_metadata(&self, id: MessageId) -> Result<AttachmentMetadata, HubError> {
        attachment_request(&self.attachments, |reply| AttachmentCommand::GetMetadata {
            id,
            reply,
        })
        .await
    }

    /// Store one chunk of `uploader`'s attachment for `msg_id` and report
    /// progress to `audience`.
    pub async fn upload_chunk(
        &self,
        uploader: UserId,
        msg_id: MessageId,
        data: Bytes,
        audience: HashSet<UserId>,
    ) -> Result<ChunkAck, HubError> {
        attachment_request(&self.attachments, |reply| AttachmentCommand::UploadChunk {
            uploader,
            msg_id,
            data,
            audience,
            reply,
        })
        .await
    }

    /// Delete an attachment's chunks and metadata, abandoning any upload in
    /// progress. Returns whether anything was removed.
    pub async fn delete_attachment(
        &self,
        msg_id: MessageId,
        uploader: Option<UserId>,
    ) -> Result<bool, HubError> {
        attachment_request(&self.attachments, |reply| AttachmentCommand::Delete {
            msg_id,
            uploader,
            reply,
        })
        .await
    }

    pub async fn download_attachment(
        &self,
        msg_id: MessageId,
    ) -> Result<AttachmentDownload, HubError> {
        attachment_request(&self.attachments, |reply| AttachmentCommand::Download {
            msg_id,
            reply,
        })
        .await
    }

    // -- calls ---------------------------------------------------------------

    pub async fn call_request(&self, caller: UserId, called: UserId) -> Result<(), HubError> {
        if caller == called {
            return Err(CallError::SelfCall.into());
        }
        send(&self.calls, calls::ACTOR, CallCommand::Request { caller, called }).await
    }

    /// Answer `caller`'s call to `called` on behalf of `responder`.
    pub async fn call_response(
        &self,
        responder: UserId,
        caller: UserId,
        called: UserId,
        accept: bool,
    ) -> Result<(), HubError> {
        if responder != caller && responder != called {
            return Err(CallError::NotAParty.into());
        }
        if accept && responder == caller {
            return Err(CallError::AcceptOnOwnBehalf.into());
        }
        send(
            &self.calls,
            calls::ACTOR,
            CallCommand::Response {
                caller,
                called,
                accept,
            },
        )
        .await
    }

    pub async fn leave_call(&self, uid: UserId) -> Result<(), HubError> {
        send(&self.calls, calls::ACTOR, CallCommand::Leave { uid }).await
    }

    pub async fn relay_offer(&self, caller: UserId, signal: CallSignal) -> Result<(), HubError> {
        send(&self.calls, calls::ACTOR, CallCommand::RelayOffer { caller, signal }).await
    }

    pub async fn relay_answer(&self, called: UserId, signal: CallSignal) -> Result<(), HubError> {
        send(&self.calls, calls::ACTOR, CallCommand::RelayAnswer { called, signal }).await
    }

    pub async fn relay_reinit_request(&self, called: UserId) -> Result<(), HubError> {
        send(&self.calls, calls::ACTOR, CallCommand::RelayReinitRequest { called }).await
    }

    pub async fn call_snapshot(&self) -> Result<CallSnapshot, HubError> {
        request(&self.calls, calls::ACTOR, |reply| CallCommand::Snapshot { reply }).await
    }
}

async fn send<C>(tx: &mpsc::Sender<C>, actor: &'static str, command: C) -> Result<(), HubError> {
    tx.send(command).await.map_err(|_| HubError::Closed(actor))
}

async fn request<C, T>(
    tx: &mpsc::Sender<C>,
    actor: &'static str,
    command: impl FnOnce(oneshot::Sender<T>) -> C,
) -> Result<T, HubError> {
    let (reply, rx) = oneshot::channel();
    send(tx, actor, command(reply)).await?;
    rx.await.map_err(|_| HubError::Closed(actor))
}

async fn attachment_request<T>(
    tx: &mpsc::Sender<AttachmentCommand>,
    command: impl FnOnce(oneshot::Sender<Result<T, AttachmentError>>) -> AttachmentCommand,
) -> Result<T, HubError> {
    Ok(request(tx, attachments::ACTOR, command).await??)
}
