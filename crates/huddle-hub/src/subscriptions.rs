//! Subscription registry actor: topic membership and fan-out.
//!
//! A topic exists while it has members. Each connection may hold at most
//! `max_per_connection` topics; subscribes beyond that are ignored.

use std::collections::{HashMap, HashSet};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use huddle_shared::protocol::Frame;
use huddle_shared::types::{ConnId, Topic, UserId};

use crate::dispatch::Connection;
use crate::supervisor::guarded;

pub(crate) const ACTOR: &str = "subscriptions";

pub(crate) enum SubscriptionCommand {
    Subscribe {
        topic: Topic,
        uid: Option<UserId>,
        conn: Connection,
    },
    Unsubscribe {
        topic: Topic,
        conn_id: ConnId,
    },
    /// Drop every subscription held by a connection.
    RemoveConnection {
        conn_id: ConnId,
    },
    /// Drop every subscription a user holds on one topic, across all of
    /// their connections.
    RemoveUserFromTopic {
        topic: Topic,
        uid: UserId,
    },
    DestroyTopic {
        topic: Topic,
    },
    Publish {
        topics: Vec<Topic>,
        frame: Frame,
        exclude: HashSet<UserId>,
    },
    Members {
        topic: Topic,
        reply: oneshot::Sender<HashSet<UserId>>,
    },
    SubscriptionCount {
        conn_id: ConnId,
        reply: oneshot::Sender<usize>,
    },
}

struct Member {
    conn: Connection,
    uid: Option<UserId>,
}

pub(crate) struct SubscriptionRegistry {
    topics: HashMap<Topic, HashMap<ConnId, Member>>,
    by_connection: HashMap<ConnId, HashSet<Topic>>,
    max_per_connection: usize,
}

impl SubscriptionRegistry {
    pub(crate) fn new(max_per_connection: usize) -> Self {
        Self {
            topics: HashMap::new(),
            by_connection: HashMap::new(),
            max_per_connection,
        }
    }

    pub(crate) async fn run(mut self, mut rx: mpsc::Receiver<SubscriptionCommand>) {
        while let Some(command) = rx.recv().await {
            guarded(ACTOR, self.handle(command)).await;
        }
        debug!("Subscription registry stopped");
    }

    async fn handle(&mut self, command: SubscriptionCommand) {
        match command {
            SubscriptionCommand::Subscribe { topic, uid, conn } => self.subscribe(topic, uid, conn),
            SubscriptionCommand::Unsubscribe { topic, conn_id } => {
                self.unsubscribe(&topic, conn_id);
            }
            SubscriptionCommand::RemoveConnection { conn_id } => self.remove_connection(conn_id),
            SubscriptionCommand::RemoveUserFromTopic { topic, uid } => {
                self.remove_user_from_topic(&topic, uid)
            }
            SubscriptionCommand::DestroyTopic { topic } => self.destroy_topic(&topic),
            SubscriptionCommand::Publish {
                topics,
                frame,
                exclude,
            } => {
                let recipients = self.recipients(&topics, &exclude);
                trace!(topics = topics.len(), recipients = recipients.len(), "Publishing");
                for conn in recipients {
                    conn.deliver(frame.clone());
                }
            }
            SubscriptionCommand::Members { topic, reply } => {
                let _ = reply.send(self.members(&topic));
            }
            SubscriptionCommand::SubscriptionCount { conn_id, reply } => {
                let _ = reply.send(self.subscription_count(conn_id));
            }
        }
    }

    fn subscribe(&mut self, topic: Topic, uid: Option<UserId>, conn: Connection) {
        let conn_id = conn.id();
        let held = self.by_connection.entry(conn_id).or_default();
        if held.contains(&topic) {
            return;
        }
        if held.len() >= self.max_per_connection {
            debug!(conn = %conn_id, %topic, "Subscription cap reached, ignoring subscribe");
            return;
        }
        held.insert(topic.clone());
        self.topics
            .entry(topic)
            .or_default()
            .insert(conn_id, Member { conn, uid });
    }

    fn unsubscribe(&mut self, topic: &Topic, conn_id: ConnId) -> bool {
        let Some(members) = self.topics.get_mut(topic) else {
            return false;
        };
        if members.remove(&conn_id).is_none() {
            return false;
        }
        if members.is_empty() {
            self.topics.remove(topic);
        }
        if let Some(held) = self.by_connection.get_mut(&conn_id) {
            held.remove(topic);
            if held.is_empty() {
                self.by_connection.remove(&conn_id);
            }
        }
        true
    }

    fn remove_connection(&mut self, conn_id: ConnId) {
        let Some(held) = self.by_connection.remove(&conn_id) else {
            return;
        };
        for topic in held {
            if let Some(members) = self.topics.get_mut(&topic) {
                members.remove(&conn_id);
                if members.is_empty() {
                    self.topics.remove(&topic);
                }
            }
        }
    }

    fn remove_user_from_topic(&mut self, topic: &Topic, uid: UserId) {
        let conn_ids: Vec<ConnId> = match self.topics.get(topic) {
            Some(members) => members
                .iter()
                .filter(|(_, member)| member.uid == Some(uid))
                .map(|(conn_id, _)| *conn_id)
                .collect(),
            None => return,
        };
        for conn_id in conn_ids {
            self.unsubscribe(topic, conn_id);
        }
    }

    fn destroy_topic(&mut self, topic: &Topic) {
        let Some(members) = self.topics.remove(topic) else {
            return;
        };
        for conn_id in members.into_keys() {
            if let Some(held) = self.by_connection.get_mut(&conn_id) {
                held.remove(topic);
                if held.is_empty() {
                    self.by_connection.remove(&conn_id);
                }
            }
        }
        debug!(%topic, "Topic destroyed");
    }

    /// Every non-excluded member of any of `topics`, each connection once.
    fn recipients(&self, topics: &[Topic], exclude: &HashSet<UserId>) -> Vec<Connection> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for members in topics.iter().filter_map(|t| self.topics.get(t)) {
            for (conn_id, member) in members {
                if member.uid.is_some_and(|uid| exclude.contains(&uid)) {
                    continue;
                }
                if seen.insert(*conn_id) {
                    out.push(member.conn.clone());
                }
            }
        }
        out
    }

    fn members(&self, topic: &Topic) -> HashSet<UserId> {
        self.topics
            .get(topic)
            .map(|members| members.values().filter_map(|m| m.uid).collect())
            .unwrap_or_default()
    }

    fn subscription_count(&self, conn_id: ConnId) -> usize {
        self.by_connection.get(&conn_id).map_or(0, HashSet::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::OutboxReceiver;

    fn conn(id: u64) -> (Connection, OutboxReceiver) {
        Connection::new(ConnId(id), 16)
    }

    fn publish(topics: Vec<Topic>, exclude: HashSet<UserId>) -> SubscriptionCommand {
        SubscriptionCommand::Publish {
            topics,
            frame: Frame::raw("{\"TYPE\":\"X\"}"),
            exclude,
        }
    }

    fn drain(rx: &mut OutboxReceiver) -> usize {
        let mut n = 0;
        while rx.try_recv().is_ok() {
            n += 1;
        }
        n
    }

    #[test]
    fn test_cap_is_enforced_silently() {
        let mut registry = SubscriptionRegistry::new(128);
        let (c, _rx) = conn(1);
        for i in 0..130 {
            registry.subscribe(Topic::new(format!("t{i}")), None, c.clone());
        }
        assert_eq!(registry.subscription_count(ConnId(1)), 128);
        assert!(registry.topics.get(&Topic::new("t129")).is_none());

        // Room frees up after an unsubscribe.
        assert!(registry.unsubscribe(&Topic::new("t0"), ConnId(1)));
        registry.subscribe(Topic::new("t129"), None, c.clone());
        assert_eq!(registry.subscription_count(ConnId(1)), 128);
        assert!(registry.topics.contains_key(&Topic::new("t129")));
    }

    #[test]
    fn test_resubscribe_does_not_count_twice() {
        let mut registry = SubscriptionRegistry::new(2);
        let (c, _rx) = conn(1);
        registry.subscribe(Topic::new("a"), None, c.clone());
        registry.subscribe(Topic::new("a"), None, c.clone());
        assert_eq!(registry.subscription_count(ConnId(1)), 1);
    }

    #[test]
    fn test_subscribe_unsubscribe_restores_members() {
        let mut registry = SubscriptionRegistry::new(8);
        let uid = UserId::new();
        let topic = Topic::new("room");
        let before = registry.members(&topic);

        let (c, _rx) = conn(1);
        registry.subscribe(topic.clone(), Some(uid), c);
        assert_eq!(registry.members(&topic), HashSet::from([uid]));

        registry.unsubscribe(&topic, ConnId(1));
        assert_eq!(registry.members(&topic), before);
        assert_eq!(registry.subscription_count(ConnId(1)), 0);
    }

    #[tokio::test]
    async fn test_publish_delivers_once_per_connection() {
        let mut registry = SubscriptionRegistry::new(8);
        let (a, mut rx_a) = conn(1);
        let (b, mut rx_b) = conn(2);
        let (c, mut rx_c) = conn(3);
        let t1 = Topic::new("t1");
        let t2 = Topic::new("t2");
        registry.subscribe(t1.clone(), Some(UserId::new()), a.clone());
        registry.subscribe(t2.clone(), Some(UserId::new()), a);
        registry.subscribe(t1.clone(), Some(UserId::new()), b);
        registry.subscribe(Topic::new("other"), None, c);

        registry.handle(publish(vec![t1.clone()], HashSet::new())).await;
        assert_eq!(drain(&mut rx_a), 1);
        assert_eq!(drain(&mut rx_b), 1);
        assert_eq!(drain(&mut rx_c), 0);

        registry.handle(publish(vec![t1, t2], HashSet::new())).await;
        assert_eq!(drain(&mut rx_a), 1);
        assert_eq!(drain(&mut rx_b), 1);
    }

    #[tokio::test]
    async fn test_publish_exclusive_skips_user_everywhere() {
        let mut registry = SubscriptionRegistry::new(8);
        let alice = UserId::new();
        let bob = UserId::new();
        let topic = Topic::new("room");
        let (a1, mut rx_a1) = conn(1);
        let (a2, mut rx_a2) = conn(2);
        let (b1, mut rx_b1) = conn(3);
        registry.subscribe(topic.clone(), Some(alice), a1);
        registry.subscribe(topic.clone(), Some(alice), a2);
        registry.subscribe(topic.clone(), Some(bob), b1);

        registry
            .handle(publish(vec![topic], HashSet::from([alice])))
            .await;
        assert_eq!(drain(&mut rx_a1), 0);
        assert_eq!(drain(&mut rx_a2), 0);
        assert_eq!(drain(&mut rx_b1), 1);
    }

    #[test]
    fn test_remove_connection_clears_all_topics() {
        let mut registry = SubscriptionRegistry::new(8);
        let (c, _rx) = conn(1);
        let (other, _rx_other) = conn(2);
        registry.subscribe(Topic::new("a"), None, c.clone());
        registry.subscribe(Topic::new("b"), None, c);
        registry.subscribe(Topic::new("b"), None, other);

        registry.remove_connection(ConnId(1));
        assert_eq!(registry.subscription_count(ConnId(1)), 0);
        assert!(!registry.topics.contains_key(&Topic::new("a")));
        assert_eq!(registry.topics[&Topic::new("b")].len(), 1);
    }

    #[test]
    fn test_remove_user_from_topic() {
        let mut registry = SubscriptionRegistry::new(8);
        let alice = UserId::new();
        let bob = UserId::new();
        let topic = Topic::new("channel:1");
        let (a1, _r1) = conn(1);
        let (a2, _r2) = conn(2);
        let (b1, _r3) = conn(3);
        registry.subscribe(topic.clone(), Some(alice), a1.clone());
        registry.subscribe(topic.clone(), Some(alice), a2);
        registry.subscribe(topic.clone(), Some(bob), b1);
        registry.subscribe(Topic::new("elsewhere"), Some(alice), a1);

        registry.remove_user_from_topic(&topic, alice);
        assert_eq!(registry.members(&topic), HashSet::from([bob]));
        assert_eq!(registry.subscription_count(ConnId(1)), 1);
        assert_eq!(registry.subscription_count(ConnId(2)), 0);
    }

    #[test]
    fn test_destroy_topic_releases_slots() {
        let mut registry = SubscriptionRegistry::new(1);
        let (c, _rx) = conn(1);
        registry.subscribe(Topic::new("a"), None, c.clone());
        registry.destroy_topic(&Topic::new("a"));
        assert_eq!(registry.subscription_count(ConnId(1)), 0);
        registry.subscribe(Topic::new("b"), None, c);
        assert_eq!(registry.subscription_count(ConnId(1)), 1);
    }

    #[test]
    fn test_anonymous_members_not_listed() {
        let mut registry = SubscriptionRegistry::new(8);
        let topic = Topic::new("user=x");
        let (c, _rx) = conn(1);
        registry.subscribe(topic.clone(), None, c);
        assert!(registry.members(&topic).is_empty());
        assert_eq!(registry.topics[&topic].len(), 1);
    }
}
