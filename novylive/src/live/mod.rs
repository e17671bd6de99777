//! Connection hub: live fan-out to browser clients and in-process
//! subscribers.
//!
//! Each connection owns a bounded outbound queue drained by its socket
//! writer task. The hub never blocks on a slow client; a connection whose
//! queue is full at delivery time is torn down instead (shed, not slowed).
//! A heartbeat task pings open connections and closes any that have been
//! silent past the configured timeout.
//!
//! All hub bookkeeping lives behind a single mutex. Sends happen after the
//! lock is released, on senders cloned out while it was held.

pub mod protocol;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::config::LiveSection;
use crate::context::now_millis;
use crate::store::Broadcaster;

use protocol::{ALL_CHANNEL, ClientMsg, ServerMsg, state_channel};

/// Frame queued onto a connection's outbound queue; the socket writer task
/// turns these into transport messages.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    Text(String),
    Ping,
}

/// Per-connection lifecycle. `Connecting -> Open` on handshake completion;
/// any error, heartbeat timeout, queue overflow, or unsubscribe-all tears
/// the connection down in a single step. No closing state is ever stored:
/// a torn-down connection is simply forgotten, and
/// [`ConnectionHub::connection_state`] reports `None` for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
}

struct ConnectionEntry {
    tx: mpsc::Sender<OutboundFrame>,
    state: ConnectionState,
    last_seen: Instant,
    channels: HashSet<String>,
}

struct LocalEntry {
    token: u64,
    tx: mpsc::Sender<Value>,
}

#[derive(Default)]
struct HubState {
    connections: HashMap<String, ConnectionEntry>,
    channels: BTreeMap<String, HashSet<String>>,
    locals: HashMap<String, Vec<LocalEntry>>,
    next_local_token: u64,
}

struct HubInner {
    state: Mutex<HubState>,
    send_queue_capacity: usize,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

/// Publish/subscribe hub for live connections.
///
/// Cloning yields another handle onto the same hub. Must be created inside
/// a Tokio runtime (the heartbeat task is spawned at construction).
#[derive(Clone)]
pub struct ConnectionHub {
    inner: Arc<HubInner>,
}

impl ConnectionHub {
    pub fn new(config: &LiveSection) -> Self {
        let inner = Arc::new(HubInner {
            state: Mutex::new(HubState::default()),
            send_queue_capacity: config.send_queue_capacity,
            heartbeat: Mutex::new(None),
        });
        let ticker = Self::spawn_heartbeat(
            &inner,
            config.heartbeat_interval(),
            config.heartbeat_timeout(),
        );
        *inner.heartbeat.lock().unwrap() = Some(ticker);
        Self { inner }
    }

    /// Admits a new connection in the `Connecting` state and hands back its
    /// outbound queue for the socket writer task to drain.
    pub fn register_connection(&self) -> (String, mpsc::Receiver<OutboundFrame>) {
        let id = Uuid::new_v4().simple().to_string();
        let (tx, rx) = mpsc::channel(self.inner.send_queue_capacity);
        {
            let mut state = self.inner.state.lock().unwrap();
            state.connections.insert(
                id.clone(),
                ConnectionEntry {
                    tx,
                    state: ConnectionState::Connecting,
                    last_seen: Instant::now(),
                    channels: HashSet::new(),
                },
            );
        }
        log::info!("live connection {id} registered");
        (id, rx)
    }

    /// Marks the handshake complete.
    pub fn mark_open(&self, id: &str) {
        let mut state = self.inner.state.lock().unwrap();
        if let Some(entry) = state.connections.get_mut(id) {
            entry.state = ConnectionState::Open;
            entry.last_seen = Instant::now();
        }
    }

    /// Records inbound traffic so the heartbeat knows the client is alive.
    pub fn mark_seen(&self, id: &str) {
        let mut state = self.inner.state.lock().unwrap();
        if let Some(entry) = state.connections.get_mut(id) {
            entry.last_seen = Instant::now();
        }
    }

    /// Adds the connection to a channel. Idempotent; unknown connections
    /// are ignored.
    pub fn subscribe(&self, connection_id: &str, channel: &str) {
        let mut state = self.inner.state.lock().unwrap();
        if let Some(entry) = state.connections.get_mut(connection_id) {
            entry.channels.insert(channel.to_string());
            state
                .channels
                .entry(channel.to_string())
                .or_default()
                .insert(connection_id.to_string());
        } else {
            log::debug!("subscribe for unknown connection {connection_id}");
        }
    }

    /// Removes the connection from a channel. Idempotent.
    pub fn unsubscribe(&self, connection_id: &str, channel: &str) {
        let mut state = self.inner.state.lock().unwrap();
        if let Some(entry) = state.connections.get_mut(connection_id) {
            entry.channels.remove(channel);
        }
        let emptied = match state.channels.get_mut(channel) {
            Some(members) => {
                members.remove(connection_id);
                members.is_empty()
            }
            None => false,
        };
        if emptied {
            state.channels.remove(channel);
        }
    }

    /// Read-loop exit path.
    pub fn disconnect(&self, id: &str) {
        close_connection(&self.inner, id, "client disconnected");
    }

    /// Publishes `data` to every subscriber of `channel`, remote and local.
    /// The payload is serialized once; slow consumers are shed.
    pub fn broadcast(&self, channel: &str, data: Value) {
        let msg = ServerMsg::Broadcast {
            channel: channel.to_string(),
            data: data.clone(),
            timestamp: now_millis(),
        };
        self.deliver(channel, &msg, &data);
    }

    /// Publish-to-all mode: every connection receives the frame regardless
    /// of subscriptions, labelled with the `"*"` channel.
    pub fn broadcast_all(&self, data: Value) {
        let msg = ServerMsg::Broadcast {
            channel: ALL_CHANNEL.to_string(),
            data: data.clone(),
            timestamp: now_millis(),
        };
        let text = match serde_json::to_string(&msg) {
            Ok(text) => text,
            Err(err) => {
                log::error!("failed to serialize broadcast frame: {err}");
                return;
            }
        };
        let targets: Vec<(String, mpsc::Sender<OutboundFrame>)> = {
            let state = self.inner.state.lock().unwrap();
            state
                .connections
                .iter()
                .map(|(id, entry)| (id.clone(), entry.tx.clone()))
                .collect()
        };
        self.fan_out(targets, &text);
        self.deliver_local(ALL_CHANNEL, &data);
    }

    /// Queues a frame for one connection. Returns `false` if the connection
    /// is unknown or had to be torn down.
    pub fn send_to(&self, id: &str, msg: &ServerMsg) -> bool {
        let text = match serde_json::to_string(msg) {
            Ok(text) => text,
            Err(err) => {
                log::error!("failed to serialize frame for {id}: {err}");
                return false;
            }
        };
        let tx = {
            let state = self.inner.state.lock().unwrap();
            state.connections.get(id).map(|entry| entry.tx.clone())
        };
        match tx {
            Some(tx) => match tx.try_send(OutboundFrame::Text(text)) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    close_connection(&self.inner, id, "send queue full");
                    false
                }
                Err(TrySendError::Closed(_)) => {
                    close_connection(&self.inner, id, "send queue closed");
                    false
                }
            },
            None => false,
        }
    }

    /// Applies one parsed client message.
    pub fn handle_client_msg(&self, connection_id: &str, msg: ClientMsg) {
        match msg {
            ClientMsg::Subscribe {
                channel,
                notifier_id,
            } => match channel.or_else(|| notifier_id.map(|id| state_channel(&id))) {
                Some(channel) => self.subscribe(connection_id, &channel),
                None => {
                    log::debug!("subscribe from {connection_id} named no channel, ignored");
                }
            },
            ClientMsg::Unsubscribe {
                channel,
                notifier_id,
            } => match channel.or_else(|| notifier_id.map(|id| state_channel(&id))) {
                Some(channel) => self.unsubscribe(connection_id, &channel),
                None => close_connection(&self.inner, connection_id, "unsubscribe-all"),
            },
            ClientMsg::Ping => {
                self.send_to(
                    connection_id,
                    &ServerMsg::Pong {
                        timestamp: now_millis(),
                    },
                );
            }
        }
    }

    /// In-process subscription to a channel, no socket involved. The
    /// returned handle unsubscribes itself on drop. A subscriber that lets
    /// its queue fill up is dropped, like a slow remote consumer.
    pub fn subscribe_local(&self, channel: &str, capacity: usize) -> LocalSubscription {
        let (tx, rx) = mpsc::channel(capacity);
        let token = {
            let mut state = self.inner.state.lock().unwrap();
            state.next_local_token += 1;
            let token = state.next_local_token;
            state
                .locals
                .entry(channel.to_string())
                .or_default()
                .push(LocalEntry { token, tx });
            token
        };
        LocalSubscription {
            channel: channel.to_string(),
            token,
            rx,
            hub: Arc::downgrade(&self.inner),
        }
    }

    pub fn connection_count(&self) -> usize {
        self.inner.state.lock().unwrap().connections.len()
    }

    pub fn channel_subscriber_count(&self, channel: &str) -> usize {
        self.inner
            .state
            .lock()
            .unwrap()
            .channels
            .get(channel)
            .map_or(0, HashSet::len)
    }

    pub fn local_subscriber_count(&self, channel: &str) -> usize {
        self.inner
            .state
            .lock()
            .unwrap()
            .locals
            .get(channel)
            .map_or(0, Vec::len)
    }

    pub fn connection_state(&self, id: &str) -> Option<ConnectionState> {
        self.inner
            .state
            .lock()
            .unwrap()
            .connections
            .get(id)
            .map(|entry| entry.state)
    }

    fn deliver(&self, channel: &str, msg: &ServerMsg, local_payload: &Value) {
        match serde_json::to_string(msg) {
            Ok(text) => {
                let targets: Vec<(String, mpsc::Sender<OutboundFrame>)> = {
                    let state = self.inner.state.lock().unwrap();
                    match state.channels.get(channel) {
                        Some(members) => members
                            .iter()
                            .filter_map(|id| {
                                state
                                    .connections
                                    .get(id)
                                    .map(|entry| (id.clone(), entry.tx.clone()))
                            })
                            .collect(),
                        None => Vec::new(),
                    }
                };
                self.fan_out(targets, &text);
            }
            Err(err) => log::error!("failed to serialize frame for {channel}: {err}"),
        }
        self.deliver_local(channel, local_payload);
    }

    fn fan_out(&self, targets: Vec<(String, mpsc::Sender<OutboundFrame>)>, text: &str) {
        let mut dead: Vec<(String, &str)> = Vec::new();
        for (id, tx) in targets {
            match tx.try_send(OutboundFrame::Text(text.to_string())) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => dead.push((id, "send queue full")),
                Err(TrySendError::Closed(_)) => dead.push((id, "send queue closed")),
            }
        }
        for (id, reason) in dead {
            close_connection(&self.inner, &id, reason);
        }
    }

    fn deliver_local(&self, channel: &str, payload: &Value) {
        let targets: Vec<(u64, mpsc::Sender<Value>)> = {
            let state = self.inner.state.lock().unwrap();
            state
                .locals
                .get(channel)
                .map(|entries| {
                    entries
                        .iter()
                        .map(|entry| (entry.token, entry.tx.clone()))
                        .collect()
                })
                .unwrap_or_default()
        };
        let mut dead: Vec<u64> = Vec::new();
        for (token, tx) in targets {
            if tx.try_send(payload.clone()).is_err() {
                dead.push(token);
            }
        }
        if !dead.is_empty() {
            let mut state = self.inner.state.lock().unwrap();
            if let Some(entries) = state.locals.get_mut(channel) {
                entries.retain(|entry| !dead.contains(&entry.token));
                if entries.is_empty() {
                    state.locals.remove(channel);
                }
            }
            log::warn!(
                "dropped {} saturated local subscription(s) on {channel}",
                dead.len()
            );
        }
    }

    fn spawn_heartbeat(
        inner: &Arc<HubInner>,
        interval: Duration,
        timeout: Duration,
    ) -> JoinHandle<()> {
        let weak = Arc::downgrade(inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately; swallow it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let now = Instant::now();
                let mut stale: Vec<String> = Vec::new();
                let mut targets: Vec<(String, mpsc::Sender<OutboundFrame>)> = Vec::new();
                {
                    let state = inner.state.lock().unwrap();
                    for (id, entry) in &state.connections {
                        if now.duration_since(entry.last_seen) > timeout {
                            stale.push(id.clone());
                        } else if entry.state == ConnectionState::Open {
                            targets.push((id.clone(), entry.tx.clone()));
                        }
                    }
                }
                for id in stale {
                    close_connection(&inner, &id, "heartbeat timeout");
                }
                for (id, tx) in targets {
                    if tx.try_send(OutboundFrame::Ping).is_err() {
                        close_connection(&inner, &id, "send queue full");
                    }
                }
            }
        })
    }
}

/// Tears the connection down: removal and membership cleanup happen in one
/// step under the lock, logging after. Safe to call for IDs the hub has
/// already forgotten.
fn close_connection(inner: &HubInner, id: &str, reason: &str) {
    let removed = {
        let mut state = inner.state.lock().unwrap();
        match state.connections.remove(id) {
            Some(entry) => {
                for channel in &entry.channels {
                    let emptied = match state.channels.get_mut(channel) {
                        Some(members) => {
                            members.remove(id);
                            members.is_empty()
                        }
                        None => false,
                    };
                    if emptied {
                        state.channels.remove(channel);
                    }
                }
                true
            }
            None => false,
        }
    };
    if removed {
        log::info!("live connection {id} closed: {reason}");
    }
}

impl Broadcaster for ConnectionHub {
    fn broadcast(&self, channel: &str, data: Value) {
        ConnectionHub::broadcast(self, channel, data);
    }

    fn value_changed(&self, id: &str, value: Value) {
        let msg = ServerMsg::ValueChange {
            id: id.to_string(),
            value: value.clone(),
            timestamp: now_millis(),
        };
        self.deliver(&state_channel(id), &msg, &value);
    }
}

impl Drop for HubInner {
    fn drop(&mut self) {
        if let Some(ticker) = self.heartbeat.lock().unwrap().take() {
            ticker.abort();
        }
    }
}

/// In-process channel subscription handed out by
/// [`ConnectionHub::subscribe_local`]. Dropping it detaches from the hub.
pub struct LocalSubscription {
    channel: String,
    token: u64,
    rx: mpsc::Receiver<Value>,
    hub: Weak<HubInner>,
}

impl LocalSubscription {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Next published payload, or `None` once the subscription was dropped
    /// by the hub (saturation) and the queue has drained.
    pub async fn recv(&mut self) -> Option<Value> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Value> {
        self.rx.try_recv().ok()
    }
}

impl Drop for LocalSubscription {
    fn drop(&mut self) {
        if let Some(inner) = self.hub.upgrade() {
            let mut state = inner.state.lock().unwrap();
            if let Some(entries) = state.locals.get_mut(&self.channel) {
                entries.retain(|entry| entry.token != self.token);
                if entries.is_empty() {
                    state.locals.remove(&self.channel);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio::time::sleep;

    use super::*;

    fn test_hub(send_queue_capacity: usize) -> ConnectionHub {
        ConnectionHub::new(&LiveSection {
            send_queue_capacity,
            heartbeat_interval_secs: 3600,
            heartbeat_timeout_secs: 7200,
        })
    }

    fn parse_text(frame: OutboundFrame) -> Value {
        match frame {
            OutboundFrame::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn subscribe_is_idempotent() {
        let hub = test_hub(8);
        let (id, _rx) = hub.register_connection();
        hub.mark_open(&id);
        hub.subscribe(&id, "news");
        hub.subscribe(&id, "news");
        assert_eq!(hub.channel_subscriber_count("news"), 1);

        hub.unsubscribe(&id, "news");
        hub.unsubscribe(&id, "news");
        assert_eq!(hub.channel_subscriber_count("news"), 0);
    }

    #[tokio::test]
    async fn broadcast_reaches_only_subscribers() {
        let hub = test_hub(8);
        let (subscriber, mut sub_rx) = hub.register_connection();
        let (bystander, mut other_rx) = hub.register_connection();
        hub.mark_open(&subscriber);
        hub.mark_open(&bystander);
        hub.subscribe(&subscriber, "news");

        hub.broadcast("news", json!({ "headline": "hi" }));

        let frame = parse_text(sub_rx.recv().await.unwrap());
        assert_eq!(frame["type"], "broadcast");
        assert_eq!(frame["channel"], "news");
        assert_eq!(frame["data"], json!({ "headline": "hi" }));
        assert!(frame["timestamp"].as_u64().unwrap() > 0);
        assert!(other_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_all_ignores_subscriptions() {
        let hub = test_hub(8);
        let (_a, mut rx_a) = hub.register_connection();
        let (_b, mut rx_b) = hub.register_connection();

        hub.broadcast_all(json!("ping-all"));

        assert_eq!(parse_text(rx_a.recv().await.unwrap())["channel"], "*");
        assert_eq!(parse_text(rx_b.recv().await.unwrap())["channel"], "*");
    }

    #[tokio::test]
    async fn slow_consumer_is_shed_and_later_broadcasts_survive() {
        let hub = test_hub(1);
        let (id, mut rx) = hub.register_connection();
        hub.mark_open(&id);
        hub.subscribe(&id, "firehose");

        // Queue capacity is 1 and nothing drains it.
        hub.broadcast("firehose", json!(1));
        hub.broadcast("firehose", json!(2));

        assert_eq!(hub.connection_count(), 0);
        assert_eq!(hub.channel_subscriber_count("firehose"), 0);
        hub.broadcast("firehose", json!(3));

        // The queued frame is still readable, then the queue reports closed.
        assert_eq!(parse_text(rx.recv().await.unwrap())["data"], json!(1));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn value_change_reaches_state_channel_subscribers() {
        let hub = test_hub(8);
        let (id, mut rx) = hub.register_connection();
        hub.mark_open(&id);
        hub.handle_client_msg(
            &id,
            ClientMsg::Subscribe {
                channel: None,
                notifier_id: Some("counter".into()),
            },
        );
        assert_eq!(hub.channel_subscriber_count("state:counter"), 1);

        hub.value_changed("counter", json!(5));
        let frame = parse_text(rx.recv().await.unwrap());
        assert_eq!(frame["type"], "value_change");
        assert_eq!(frame["id"], "counter");
        assert_eq!(frame["value"], json!(5));
    }

    #[tokio::test]
    async fn client_ping_is_answered_with_pong() {
        let hub = test_hub(8);
        let (id, mut rx) = hub.register_connection();
        hub.mark_open(&id);

        hub.handle_client_msg(&id, ClientMsg::Ping);
        let frame = parse_text(rx.recv().await.unwrap());
        assert_eq!(frame["type"], "pong");
    }

    #[tokio::test]
    async fn unsubscribe_all_closes_the_connection() {
        let hub = test_hub(8);
        let (id, _rx) = hub.register_connection();
        hub.mark_open(&id);
        hub.subscribe(&id, "news");

        hub.handle_client_msg(
            &id,
            ClientMsg::Unsubscribe {
                channel: None,
                notifier_id: None,
            },
        );
        assert_eq!(hub.connection_count(), 0);
        assert_eq!(hub.channel_subscriber_count("news"), 0);
    }

    #[tokio::test]
    async fn connection_states_progress_from_connecting_to_open() {
        let hub = test_hub(8);
        let (id, _rx) = hub.register_connection();
        assert_eq!(hub.connection_state(&id), Some(ConnectionState::Connecting));
        hub.mark_open(&id);
        assert_eq!(hub.connection_state(&id), Some(ConnectionState::Open));
        hub.disconnect(&id);
        assert_eq!(hub.connection_state(&id), None);

        // Hub-initiated teardown ends the same way: no lingering state.
        let (shed, _shed_rx) = hub.register_connection();
        hub.mark_open(&shed);
        hub.handle_client_msg(
            &shed,
            ClientMsg::Unsubscribe {
                channel: None,
                notifier_id: None,
            },
        );
        assert_eq!(hub.connection_state(&shed), None);
    }

    #[tokio::test]
    async fn local_subscription_receives_and_detaches_on_drop() {
        let hub = test_hub(8);
        let mut sub = hub.subscribe_local("state:counter", 4);
        assert_eq!(hub.local_subscriber_count("state:counter"), 1);

        hub.value_changed("counter", json!(7));
        assert_eq!(sub.recv().await, Some(json!(7)));

        drop(sub);
        assert_eq!(hub.local_subscriber_count("state:counter"), 0);
    }

    #[tokio::test]
    async fn saturated_local_subscription_is_dropped() {
        let hub = test_hub(8);
        let mut sub = hub.subscribe_local("events", 1);

        hub.broadcast("events", json!(1));
        hub.broadcast("events", json!(2));
        assert_eq!(hub.local_subscriber_count("events"), 0);

        assert_eq!(sub.recv().await, Some(json!(1)));
        assert_eq!(sub.recv().await, None);
    }

    #[tokio::test]
    async fn heartbeat_pings_then_reaps_silent_connections() {
        let hub = ConnectionHub::new(&LiveSection {
            send_queue_capacity: 8,
            heartbeat_interval_secs: 1,
            heartbeat_timeout_secs: 2,
        });
        let (id, mut rx) = hub.register_connection();
        hub.mark_open(&id);

        // First tick at ~1s: the connection is fresh, so it gets a ping.
        sleep(Duration::from_millis(1200)).await;
        assert_eq!(rx.recv().await, Some(OutboundFrame::Ping));

        // No inbound traffic for over 2s: reaped by a later tick.
        sleep(Duration::from_millis(2300)).await;
        assert_eq!(hub.connection_count(), 0);
    }
}
