//! In-process transport.
//!
//! A [`MemoryHub`] plays the role of the messaging server: one append-only
//! log and one broadcast channel per room. Each client talks to it through
//! its own [`MemoryTransport`] handle, which can be switched offline to
//! simulate lost connectivity. While a handle is offline its calls fail with
//! `Unavailable` and live messages addressed to it are lost, exactly like a
//! dropped connection; they remain in the room history. A subscriber that
//! lost messages, offline or by falling more than `capacity` messages
//! behind, gets a `Gap` before its next delivered message.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, RwLock};

use super::{HistoryPage, SubscriptionEvent, Transport, TransportError, TransportSubscription};
use crate::message::{ChannelId, MessageBody, MessageId, TransportMessage};

#[derive(Debug, Clone, Default)]
pub struct HubStats {
    pub messages_published: u64,
    pub history_pages_served: u64,
    pub rooms: usize,
}

struct AtomicHubStats {
    messages_published: AtomicU64,
    history_pages_served: AtomicU64,
}

/// A message plus the clients that were offline when it was appended.
#[derive(Clone)]
struct Delivery {
    msg: TransportMessage,
    offline: Arc<HashSet<u64>>,
}

struct Room {
    log: RwLock<Vec<TransportMessage>>,
    sender: broadcast::Sender<Delivery>,
}

impl Room {
    fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            log: RwLock::new(Vec::new()),
            sender,
        }
    }
}

/// Shared message server for any number of in-process clients.
pub struct MemoryHub {
    rooms: RwLock<HashMap<ChannelId, Arc<Room>>>,
    /// Messages buffered per subscriber
    capacity: usize,
    next_id: AtomicU64,
    next_client: AtomicU64,
    offline: RwLock<HashSet<u64>>,
    stats: AtomicHubStats,
}

impl MemoryHub {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            rooms: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            next_id: AtomicU64::new(1),
            next_client: AtomicU64::new(1),
            offline: RwLock::new(HashSet::new()),
            stats: AtomicHubStats {
                messages_published: AtomicU64::new(0),
                history_pages_served: AtomicU64::new(0),
            },
        })
    }

    /// A client handle; starts online.
    pub fn client(self: &Arc<Self>, name: impl Into<String>) -> Arc<MemoryTransport> {
        Arc::new(MemoryTransport {
            hub: self.clone(),
            id: self.next_client.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
        })
    }

    async fn room(&self, channel: &ChannelId) -> Arc<Room> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(channel) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(channel) {
            return room.clone();
        }
        let room = Arc::new(Room::new(self.capacity));
        rooms.insert(channel.clone(), room.clone());
        room
    }

    async fn append(
        &self,
        channel: &ChannelId,
        msg_type: &str,
        body: MessageBody,
        sender: Option<&str>,
    ) -> MessageId {
        let room = self.room(channel).await;
        let id = MessageId::new(format!("${}", self.next_id.fetch_add(1, Ordering::Relaxed)));
        let mut msg = TransportMessage::new(id.clone(), msg_type, body);
        if let Some(sender) = sender {
            msg = msg.with_sender(sender);
        }

        // Log order and fan-out order must agree, so send under the lock.
        let mut log = room.log.write().await;
        log.push(msg.clone());
        let delivery = Delivery {
            msg,
            offline: Arc::new(self.offline.read().await.clone()),
        };
        let receivers = room.sender.send(delivery).unwrap_or(0);
        drop(log);

        self.stats.messages_published.fetch_add(1, Ordering::Relaxed);
        log::debug!("{channel}: appended {id} ({msg_type}) to {receivers} subscribers");
        id
    }

    /// Write an arbitrary message into a room, bypassing any client.
    pub async fn inject(&self, channel: &ChannelId, msg_type: &str, body: MessageBody) -> MessageId {
        self.append(channel, msg_type, body, None).await
    }

    /// Full room history, oldest first.
    pub async fn history(&self, channel: &ChannelId) -> Vec<TransportMessage> {
        self.room(channel).await.log.read().await.clone()
    }

    pub async fn message_count(&self, channel: &ChannelId) -> usize {
        self.room(channel).await.log.read().await.len()
    }

    pub async fn stats(&self) -> HubStats {
        HubStats {
            messages_published: self.stats.messages_published.load(Ordering::Relaxed),
            history_pages_served: self.stats.history_pages_served.load(Ordering::Relaxed),
            rooms: self.rooms.read().await.len(),
        }
    }
}

/// One client's connection to a [`MemoryHub`].
pub struct MemoryTransport {
    hub: Arc<MemoryHub>,
    id: u64,
    name: String,
}

impl MemoryTransport {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Simulate losing or regaining connectivity.
    pub async fn set_available(&self, available: bool) {
        let mut offline = self.hub.offline.write().await;
        if available {
            offline.remove(&self.id);
        } else {
            offline.insert(self.id);
        }
    }

    pub async fn is_available(&self) -> bool {
        !self.hub.offline.read().await.contains(&self.id)
    }

    async fn check(&self) -> Result<(), TransportError> {
        if self.is_available().await {
            Ok(())
        } else {
            Err(TransportError::Unavailable(format!("{} is offline", self.name)))
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn fetch_history(
        &self,
        channel: &ChannelId,
        before: Option<&MessageId>,
        limit: usize,
    ) -> Result<HistoryPage, TransportError> {
        self.check().await?;
        let room = self.hub.room(channel).await;
        let log = room.log.read().await;

        let end = match before {
            Some(cursor) => log
                .iter()
                .position(|m| &m.id == cursor)
                .ok_or_else(|| TransportError::InvalidCursor(cursor.clone()))?,
            None => log.len(),
        };
        let start = end.saturating_sub(limit.max(1));
        let messages = log[start..end].to_vec();
        let prev_cursor = if start > 0 {
            messages.first().map(|m| m.id.clone())
        } else {
            None
        };

        self.hub.stats.history_pages_served.fetch_add(1, Ordering::Relaxed);
        Ok(HistoryPage {
            messages,
            prev_cursor,
        })
    }

    async fn subscribe(&self, channel: &ChannelId) -> Result<TransportSubscription, TransportError> {
        self.check().await?;
        let room = self.hub.room(channel).await;
        let mut rx = room.sender.subscribe();
        let (tx, out) = mpsc::channel(self.hub.capacity);
        let client = self.id;
        let name = self.name.clone();

        tokio::spawn(async move {
            let mut missed = false;
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    msg = rx.recv() => match msg {
                        Ok(delivery) => {
                            if delivery.offline.contains(&client) {
                                missed = true;
                                continue;
                            }
                            if missed {
                                if tx.send(SubscriptionEvent::Gap).await.is_err() {
                                    break;
                                }
                                missed = false;
                            }
                            if tx.send(SubscriptionEvent::Message(delivery.msg)).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("{name}: subscription lagged, {n} messages lost");
                            missed = true;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        });

        Ok(TransportSubscription::new(out))
    }

    async fn publish(
        &self,
        channel: &ChannelId,
        msg_type: &str,
        body: MessageBody,
    ) -> Result<MessageId, TransportError> {
        self.check().await?;
        Ok(self.hub.append(channel, msg_type, body, Some(&self.name)).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> MessageBody {
        MessageBody::Text(s.to_string())
    }

    async fn next_id(sub: &mut TransportSubscription) -> MessageId {
        match sub.recv().await {
            Some(SubscriptionEvent::Message(msg)) => msg.id,
            other => panic!("Expected a message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_publish_and_history_order() {
        let hub = MemoryHub::new(16);
        let alice = hub.client("alice");
        let channel = ChannelId::from("room");

        let first = alice.publish(&channel, "t", text("1")).await.unwrap();
        let second = alice.publish(&channel, "t", text("2")).await.unwrap();
        assert_ne!(first, second);

        let page = alice.fetch_history(&channel, None, 10).await.unwrap();
        assert!(page.is_start());
        let ids: Vec<_> = page.messages.iter().map(|m| m.id.clone()).collect();
        assert_eq!(ids, vec![first, second]);
        assert_eq!(page.messages[0].sender.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_paging_backward() {
        let hub = MemoryHub::new(16);
        let client = hub.client("c");
        let channel = ChannelId::from("room");
        for i in 0..5 {
            client.publish(&channel, "t", text(&i.to_string())).await.unwrap();
        }

        let newest = client.fetch_history(&channel, None, 2).await.unwrap();
        assert_eq!(newest.messages.len(), 2);
        assert_eq!(newest.messages[1].body, text("4"));
        let cursor = newest.prev_cursor.clone().unwrap();

        let middle = client.fetch_history(&channel, Some(&cursor), 2).await.unwrap();
        assert_eq!(middle.messages[0].body, text("1"));
        let cursor = middle.prev_cursor.clone().unwrap();

        let oldest = client.fetch_history(&channel, Some(&cursor), 2).await.unwrap();
        assert_eq!(oldest.messages.len(), 1);
        assert_eq!(oldest.messages[0].body, text("0"));
        assert!(oldest.is_start());
    }

    #[tokio::test]
    async fn test_unknown_cursor() {
        let hub = MemoryHub::new(16);
        let client = hub.client("c");
        let err = client
            .fetch_history(&ChannelId::from("room"), Some(&MessageId::from("$999")), 5)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::InvalidCursor(_)));
    }

    #[tokio::test]
    async fn test_subscription_fan_out() {
        let hub = MemoryHub::new(16);
        let alice = hub.client("alice");
        let bob = hub.client("bob");
        let channel = ChannelId::from("room");

        let mut sub_a = alice.subscribe(&channel).await.unwrap();
        let mut sub_b = bob.subscribe(&channel).await.unwrap();

        let id = alice.publish(&channel, "t", text("hi")).await.unwrap();
        assert_eq!(next_id(&mut sub_a).await, id);
        assert_eq!(next_id(&mut sub_b).await, id);
    }

    #[tokio::test]
    async fn test_offline_client() {
        let hub = MemoryHub::new(16);
        let alice = hub.client("alice");
        let bob = hub.client("bob");
        let channel = ChannelId::from("room");
        let mut sub_b = bob.subscribe(&channel).await.unwrap();

        bob.set_available(false).await;
        assert!(matches!(
            bob.publish(&channel, "t", text("x")).await,
            Err(TransportError::Unavailable(_))
        ));
        assert!(bob.fetch_history(&channel, None, 5).await.is_err());
        assert!(bob.subscribe(&channel).await.is_err());

        // Missed while offline, still in history
        let missed = alice.publish(&channel, "t", text("missed")).await.unwrap();
        bob.set_available(true).await;
        let seen = alice.publish(&channel, "t", text("seen")).await.unwrap();

        assert_eq!(sub_b.recv().await, Some(SubscriptionEvent::Gap));
        assert_eq!(next_id(&mut sub_b).await, seen);
        let page = bob.fetch_history(&channel, None, 5).await.unwrap();
        assert_eq!(page.messages[0].id, missed);
    }

    #[tokio::test]
    async fn test_slow_subscriber_sees_gap() {
        let hub = MemoryHub::new(1);
        let alice = hub.client("alice");
        let bob = hub.client("bob");
        let channel = ChannelId::from("room");
        let mut sub_b = bob.subscribe(&channel).await.unwrap();

        // Bob's forwarder cannot run until this task yields
        alice.publish(&channel, "t", text("1")).await.unwrap();
        alice.publish(&channel, "t", text("2")).await.unwrap();
        let third = alice.publish(&channel, "t", text("3")).await.unwrap();

        assert_eq!(sub_b.recv().await, Some(SubscriptionEvent::Gap));
        assert_eq!(next_id(&mut sub_b).await, third);
        assert_eq!(hub.message_count(&channel).await, 3);
    }

    #[tokio::test]
    async fn test_no_gap_when_keeping_up() {
        let hub = MemoryHub::new(4);
        let alice = hub.client("alice");
        let channel = ChannelId::from("room");
        let mut sub = alice.subscribe(&channel).await.unwrap();

        for i in 0..3 {
            let id = alice.publish(&channel, "t", text(&i.to_string())).await.unwrap();
            assert_eq!(next_id(&mut sub).await, id);
        }
    }

    #[tokio::test]
    async fn test_inject_and_stats() {
        let hub = MemoryHub::new(16);
        let channel = ChannelId::from("room");
        let id = hub.inject(&channel, "t", MessageBody::Binary(vec![0xFF])).await;

        let history = hub.history(&channel).await;
        assert_eq!(history[0].id, id);
        assert_eq!(history[0].sender, None);
        assert_eq!(hub.message_count(&channel).await, 1);

        let stats = hub.stats().await;
        assert_eq!(stats.messages_published, 1);
        assert_eq!(stats.rooms, 1);
    }
}
