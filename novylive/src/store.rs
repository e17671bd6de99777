//! Process-wide keyed state with live propagation.
//!
//! The [`StateStore`] holds two separate maps: untyped `data` slots
//! (last-write-wins JSON values) and registered *notifiers* (typed
//! [`ObservableValue`]s exposed under their IDs for state queries over HTTP).
//! A [`Broadcaster`] implementation, normally the connection hub, is injected
//! at construction so the store never depends on the transport directly.
//!
//! Locking discipline: every map has its own mutex, and callbacks are always
//! invoked after the lock is released (copy-then-release-then-notify).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::mpsc;

use crate::context::epoch_millis;
use crate::dataflow::ObservableValue;
use crate::error::RuntimeError;
use crate::live::protocol::state_channel;

/// Outbound fan-out capability. Implemented by the connection hub; tests
/// substitute a recording double.
pub trait Broadcaster: Send + Sync {
    /// Publishes `data` to every subscriber of `channel`.
    fn broadcast(&self, channel: &str, data: Value);

    /// Publishes a notifier value change on the notifier's state channel.
    fn value_changed(&self, id: &str, value: Value);
}

/// Uniform, type-erased view of a registered [`ObservableValue`], used to
/// answer state queries and updates without knowing the element type.
pub trait StateNotifier: Send + Sync {
    fn notifier_id(&self) -> String;

    fn snapshot(&self) -> Result<NotifierSnapshot, RuntimeError>;

    /// Decodes and applies a new value with the notifier's usual change
    /// detection. Returns whether the value actually changed.
    fn apply_json(&self, raw: Value) -> Result<bool, RuntimeError>;
}

/// Wire shape returned by state queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifierSnapshot {
    pub id: String,
    pub value: Value,
    /// The value re-serialized as a JSON string, for clients that want to
    /// embed it verbatim.
    pub json: String,
    /// Milliseconds since the Unix epoch of the last change.
    pub last_updated: u64,
    #[serde(rename = "type")]
    pub type_tag: String,
}

impl<T> StateNotifier for ObservableValue<T>
where
    T: Clone + PartialEq + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    fn notifier_id(&self) -> String {
        self.id().to_string()
    }

    fn snapshot(&self) -> Result<NotifierSnapshot, RuntimeError> {
        let value = self.to_json()?;
        Ok(NotifierSnapshot {
            id: self.id().to_string(),
            json: serde_json::to_string(&value)?,
            last_updated: epoch_millis(self.last_updated()),
            type_tag: std::any::type_name::<T>().to_string(),
            value,
        })
    }

    fn apply_json(&self, raw: Value) -> Result<bool, RuntimeError> {
        self.set_from_json(raw)
    }
}

/// Token for detaching a watcher registered with
/// [`StateStore::add_watcher`] or [`StateStore::watch`].
#[derive(Debug, Clone)]
pub struct WatcherHandle {
    key: String,
    token: u64,
}

/// Keyed global state shared by widgets, callbacks, and live clients.
///
/// Cloning is cheap; all clones address the same maps.
///
/// Note the deliberate asymmetry: [`set`](Self::set) always fires watchers
/// and broadcasts, even when the value is unchanged, while a registered
/// notifier only propagates on an actual change. Coarse keyed state is
/// treated as always fresh.
#[derive(Clone)]
pub struct StateStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    data: Mutex<HashMap<String, Value>>,
    notifiers: Mutex<HashMap<String, Arc<dyn StateNotifier>>>,
    watchers: Mutex<HashMap<String, Vec<(u64, Arc<dyn Fn(Value) + Send + Sync>)>>>,
    broadcaster: Option<Arc<dyn Broadcaster>>,
    next_watcher_token: AtomicU64,
}

impl StateStore {
    /// A store with no live fan-out; watchers and notifier registration
    /// still work locally.
    pub fn new() -> Self {
        Self::build(None)
    }

    pub fn with_broadcaster(broadcaster: Arc<dyn Broadcaster>) -> Self {
        Self::build(Some(broadcaster))
    }

    fn build(broadcaster: Option<Arc<dyn Broadcaster>>) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                data: Mutex::new(HashMap::new()),
                notifiers: Mutex::new(HashMap::new()),
                watchers: Mutex::new(HashMap::new()),
                broadcaster,
                next_watcher_token: AtomicU64::new(1),
            }),
        }
    }

    /// Writes a keyed slot, last-write-wins. Watchers for the key run on
    /// their own tasks and `{key, value}` is published on `"state:" + key`.
    /// Both happen on every call, changed value or not.
    pub fn set(&self, key: impl Into<String>, value: Value) {
        let key = key.into();
        {
            let mut data = self.inner.data.lock().unwrap();
            data.insert(key.clone(), value.clone());
        }
        let watchers: Vec<Arc<dyn Fn(Value) + Send + Sync>> = {
            let map = self.inner.watchers.lock().unwrap();
            map.get(&key)
                .map(|entries| entries.iter().map(|(_, f)| Arc::clone(f)).collect())
                .unwrap_or_default()
        };
        for watcher in watchers {
            let value = value.clone();
            tokio::spawn(async move {
                watcher(value);
            });
        }
        if let Some(broadcaster) = &self.inner.broadcaster {
            broadcaster.broadcast(&state_channel(&key), json!({ "key": key, "value": value }));
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.data.lock().unwrap().get(key).cloned()
    }

    /// Registers an observable under its ID so it can be queried and
    /// updated over HTTP and fanned out to live subscribers. Registering
    /// the same ID again silently replaces the previous entry.
    pub fn register_notifier<T>(&self, notifier: &ObservableValue<T>)
    where
        T: Clone + PartialEq + Send + Sync + Serialize + DeserializeOwned + 'static,
    {
        let id = notifier.id().to_string();
        if let Some(broadcaster) = &self.inner.broadcaster {
            let broadcaster = Arc::clone(broadcaster);
            notifier.install_sink(Arc::new(move |id: &str, value: &T| {
                match serde_json::to_value(value) {
                    Ok(json) => broadcaster.value_changed(id, json),
                    Err(err) => log::error!("failed to serialize notifier {id}: {err}"),
                }
            }));
        }
        let previous = {
            let mut notifiers = self.inner.notifiers.lock().unwrap();
            notifiers.insert(id.clone(), Arc::new(notifier.clone()) as Arc<dyn StateNotifier>)
        };
        if previous.is_some() {
            log::debug!("notifier {id} re-registered, previous entry replaced");
        }
    }

    /// Snapshot of a registered notifier, or
    /// [`RuntimeError::UnknownNotifier`].
    pub fn notifier_state(&self, id: &str) -> Result<NotifierSnapshot, RuntimeError> {
        self.lookup_notifier(id)?.snapshot()
    }

    /// Applies a JSON value to a registered notifier and returns the
    /// post-update snapshot.
    pub fn set_notifier_value(
        &self,
        id: &str,
        raw: Value,
    ) -> Result<NotifierSnapshot, RuntimeError> {
        let notifier = self.lookup_notifier(id)?;
        notifier.apply_json(raw)?;
        notifier.snapshot()
    }

    fn lookup_notifier(&self, id: &str) -> Result<Arc<dyn StateNotifier>, RuntimeError> {
        let notifiers = self.inner.notifiers.lock().unwrap();
        notifiers
            .get(id)
            .cloned()
            .ok_or_else(|| RuntimeError::UnknownNotifier(id.to_string()))
    }

    /// Low-level hook: `watcher` runs (on its own task, best effort, no
    /// back-pressure) every time `key` is written.
    pub fn add_watcher(
        &self,
        key: impl Into<String>,
        watcher: impl Fn(Value) + Send + Sync + 'static,
    ) -> WatcherHandle {
        let key = key.into();
        let token = self.inner.next_watcher_token.fetch_add(1, Ordering::Relaxed);
        let mut watchers = self.inner.watchers.lock().unwrap();
        watchers
            .entry(key.clone())
            .or_default()
            .push((token, Arc::new(watcher)));
        WatcherHandle { key, token }
    }

    pub fn remove_watcher(&self, handle: WatcherHandle) {
        let mut watchers = self.inner.watchers.lock().unwrap();
        if let Some(entries) = watchers.get_mut(&handle.key) {
            entries.retain(|(token, _)| *token != handle.token);
            if entries.is_empty() {
                watchers.remove(&handle.key);
            }
        }
    }

    /// Channel-backed convenience over [`add_watcher`](Self::add_watcher):
    /// every write to `key` is delivered to the returned receiver.
    pub fn watch(&self, key: impl Into<String>) -> (WatcherHandle, mpsc::UnboundedReceiver<Value>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = self.add_watcher(key, move |value| {
            let _ = tx.send(value);
        });
        (handle, rx)
    }

    pub fn notifier_count(&self) -> usize {
        self.inner.notifiers.lock().unwrap().len()
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}
