use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::SystemTime;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use uuid::Uuid;

use crate::error::RuntimeError;

/// Store-propagation hook, installed when the observable is registered with
/// a [`StateStore`](crate::store::StateStore). Called with `(id, new_value)`
/// after a successful change.
pub(crate) type Sink<T> = Arc<dyn Fn(&str, &T) + Send + Sync>;

/// A single mutable value with change listeners.
///
/// Writes go through [`set`](Self::set) or [`update`](Self::update), which
/// compare the new value against the current one and do nothing when they
/// are equal. On an actual change, every registered listener receives a
/// clone of the new value on its own Tokio task, and the attached store
/// (if any) is notified so live clients can be told.
///
/// Cloning an `ObservableValue` is cheap and yields another handle onto the
/// same shared cell.
pub struct ObservableValue<T> {
    inner: Arc<Inner<T>>,
}

/// Token returned by [`ObservableValue::add_listener`], used to remove that
/// one listener later. Handles stay valid (and inert) after
/// [`clear_listeners`](ObservableValue::clear_listeners); slots are never
/// reused, so a stale handle can not detach somebody else's listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerHandle(usize);

struct Inner<T> {
    id: String,
    cell: RwLock<Cell<T>>,
    // Arena of listener slots; removal blanks a slot instead of shifting.
    listeners: Mutex<Vec<Option<Arc<dyn Fn(T) + Send + Sync>>>>,
    sink: Mutex<Option<Sink<T>>>,
}

struct Cell<T> {
    value: T,
    updated_at: SystemTime,
}

impl<T> Inner<T> {
    // A panic in caller-supplied code (an `update` closure, or `PartialEq`
    // during change detection) can poison the cell lock. Such a panic always
    // fires before anything is written to the cell, so the value is never
    // torn; strip the poison instead of propagating it to every later reader.
    fn read_cell(&self) -> RwLockReadGuard<'_, Cell<T>> {
        self.cell.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_cell(&self) -> RwLockWriteGuard<'_, Cell<T>> {
        self.cell.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> Clone for ObservableValue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for ObservableValue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObservableValue")
            .field("id", &self.inner.id)
            .finish_non_exhaustive()
    }
}

impl<T> ObservableValue<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// Creates an observable with a generated process-unique ID.
    pub fn new(initial: T) -> Self {
        Self::with_id(format!("observable-{}", Uuid::new_v4().simple()), initial)
    }

    /// Creates an observable with a caller-chosen ID. IDs must be unique
    /// within a store; registration under an already-used ID replaces the
    /// previous entry.
    pub fn with_id(id: impl Into<String>, initial: T) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: id.into(),
                cell: RwLock::new(Cell {
                    value: initial,
                    updated_at: SystemTime::now(),
                }),
                listeners: Mutex::new(Vec::new()),
                sink: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Current value, cloned out from under a shared lock.
    pub fn value(&self) -> T {
        self.inner.read_cell().value.clone()
    }

    pub fn last_updated(&self) -> SystemTime {
        self.inner.read_cell().updated_at
    }

    /// Replaces the value. Returns `true` if the value actually changed.
    ///
    /// Equal values (`PartialEq`) are a complete no-op: no listener runs and
    /// the store is not notified. On change, listeners are dispatched after
    /// the write lock is released, each on its own task, so a listener may
    /// freely touch this observable again.
    pub fn set(&self, new_value: T) -> bool {
        {
            let mut cell = self.inner.write_cell();
            if cell.value == new_value {
                return false;
            }
            cell.value = new_value.clone();
            cell.updated_at = SystemTime::now();
        }
        self.notify(new_value);
        true
    }

    /// Read-modify-write with the same change-detection as [`set`](Self::set).
    /// The closure runs under the exclusive lock, so the transformation is
    /// atomic with respect to concurrent `set`/`update` calls. A panic in the
    /// closure propagates to the caller and leaves the value unchanged.
    pub fn update(&self, f: impl FnOnce(&T) -> T) -> bool {
        let next = {
            let mut cell = self.inner.write_cell();
            let next = f(&cell.value);
            if cell.value == next {
                return false;
            }
            cell.value = next.clone();
            cell.updated_at = SystemTime::now();
            next
        };
        self.notify(next);
        true
    }

    /// Registers a change listener and returns a handle for later removal.
    pub fn add_listener(&self, listener: impl Fn(T) + Send + Sync + 'static) -> ListenerHandle {
        let mut slots = self.inner.listeners.lock().unwrap();
        let slot = slots.len();
        slots.push(Some(Arc::new(listener)));
        ListenerHandle(slot)
    }

    /// Detaches the listener behind `handle`. Unknown or already-removed
    /// handles are ignored.
    pub fn remove_listener(&self, handle: ListenerHandle) {
        let mut slots = self.inner.listeners.lock().unwrap();
        if let Some(slot) = slots.get_mut(handle.0) {
            *slot = None;
        }
    }

    /// Drops every listener. Outstanding handles become inert.
    pub fn clear_listeners(&self) {
        let mut slots = self.inner.listeners.lock().unwrap();
        for slot in slots.iter_mut() {
            *slot = None;
        }
    }

    /// Number of currently attached listeners.
    pub fn listener_count(&self) -> usize {
        self.inner
            .listeners
            .lock()
            .unwrap()
            .iter()
            .filter(|slot| slot.is_some())
            .count()
    }

    /// Clears listeners and detaches from the store. Called when the owning
    /// widget or page goes away; nothing happens automatically on drop while
    /// other handles are alive.
    pub fn cleanup(&self) {
        self.clear_listeners();
        *self.inner.sink.lock().unwrap() = None;
    }

    pub(crate) fn install_sink(&self, sink: Sink<T>) {
        *self.inner.sink.lock().unwrap() = Some(sink);
    }

    fn notify(&self, value: T) {
        let listeners: Vec<Arc<dyn Fn(T) + Send + Sync>> = {
            let slots = self.inner.listeners.lock().unwrap();
            slots.iter().flatten().cloned().collect()
        };
        // Dispatched in registration order, but each listener runs on its
        // own task, so no cross-listener ordering is guaranteed.
        for listener in listeners {
            let value = value.clone();
            tokio::spawn(async move {
                listener(value);
            });
        }
        let sink = self.inner.sink.lock().unwrap().clone();
        if let Some(sink) = sink {
            sink(&self.inner.id, &value);
        }
    }
}

impl<T> ObservableValue<T>
where
    T: Clone + PartialEq + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    /// Serializes the current value.
    pub fn to_json(&self) -> Result<Value, RuntimeError> {
        Ok(serde_json::to_value(self.value())?)
    }

    /// Decodes `raw` and applies it exactly like [`set`](Self::set),
    /// including change detection.
    pub fn set_from_json(&self, raw: Value) -> Result<bool, RuntimeError> {
        let decoded: T = serde_json::from_value(raw)?;
        Ok(self.set(decoded))
    }
}

#[cfg(test)]
mod tests {
    use std::panic::AssertUnwindSafe;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use serde_json::json;
    use tokio::time::sleep;

    use super::*;

    #[tokio::test]
    async fn equal_set_fires_listeners_exactly_once() {
        let value = ObservableValue::with_id("count", 0u32);
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        value.add_listener(move |_| {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        assert!(value.set(5));
        sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        assert!(!value.set(5));
        sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(value.value(), 5);
    }

    #[tokio::test]
    async fn listener_can_read_the_observable_back() {
        let value = ObservableValue::new(String::from("a"));
        let seen = Arc::new(Mutex::new(None));
        let reader = value.clone();
        let seen_clone = seen.clone();
        value.add_listener(move |_| {
            *seen_clone.lock().unwrap() = Some(reader.value());
        });

        value.set(String::from("b"));
        sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.lock().unwrap().clone(), Some(String::from("b")));
    }

    #[test]
    fn update_is_change_detected() {
        let value = ObservableValue::new(10i64);
        assert!(!value.update(|v| *v));
        assert!(value.update(|v| v + 1));
        assert_eq!(value.value(), 11);
    }

    #[test]
    fn value_stays_usable_after_a_panicking_update() {
        let value = ObservableValue::new(3u32);
        let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
            value.update(|_| panic!("modifier exploded"))
        }));
        assert!(result.is_err());

        assert_eq!(value.value(), 3);
        assert!(value.set(4));
        assert_eq!(value.value(), 4);
    }

    #[tokio::test]
    async fn removed_listener_no_longer_fires() {
        let value = ObservableValue::new(0u32);
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let first_clone = first.clone();
        let second_clone = second.clone();
        let handle = value.add_listener(move |_| {
            first_clone.fetch_add(1, Ordering::SeqCst);
        });
        value.add_listener(move |_| {
            second_clone.fetch_add(1, Ordering::SeqCst);
        });

        value.remove_listener(handle);
        value.set(1);
        sleep(Duration::from_millis(50)).await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
        assert_eq!(value.listener_count(), 1);
    }

    #[tokio::test]
    async fn stale_handle_cannot_remove_a_newer_listener() {
        let value = ObservableValue::new(0u32);
        let fired = Arc::new(AtomicUsize::new(0));
        let stale = value.add_listener(|_| {});
        value.clear_listeners();

        let fired_clone = fired.clone();
        value.add_listener(move |_| {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });
        value.remove_listener(stale);

        value.set(1);
        sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn json_set_behaves_like_set() {
        let value = ObservableValue::new(3u32);
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        value.add_listener(move |_| {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        assert!(!value.set_from_json(json!(3)).unwrap());
        assert!(value.set_from_json(json!(9)).unwrap());
        sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(value.to_json().unwrap(), json!(9));
    }

    #[test]
    fn malformed_json_is_rejected_without_mutation() {
        let value = ObservableValue::new(3u32);
        let err = value.set_from_json(json!("not a number")).unwrap_err();
        assert!(matches!(err, RuntimeError::Json(_)));
        assert_eq!(value.value(), 3);
    }

    #[test]
    fn clones_share_the_same_cell() {
        let value = ObservableValue::new(1u32);
        let alias = value.clone();
        alias.set(2);
        assert_eq!(value.value(), 2);
        assert_eq!(value.id(), alias.id());
    }

    #[test]
    fn cleanup_clears_listeners() {
        let value = ObservableValue::new(0u32);
        value.add_listener(|_| {});
        value.add_listener(|_| {});
        assert_eq!(value.listener_count(), 2);
        value.cleanup();
        assert_eq!(value.listener_count(), 0);
    }
}
