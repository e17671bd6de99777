//! Debounced batching of state mutations.
//!
//! Rapid-fire mutations (a callback calling `set` many times) would
//! otherwise each trigger their own rebuild broadcast. The scheduler queues
//! them as [`PendingUpdate`]s and drains the whole accumulation once the
//! arrival stream has been quiet for the debounce window. A drained batch
//! runs every thunk in arrival order, then publishes exactly one rebuild
//! notification carrying the union of the affected widget IDs.
//!
//! A full queue never drops work: the overflowing update runs inline on the
//! caller's task instead, with its own rebuild notification.

use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde_json::json;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::{Duration, timeout};

use crate::config::UpdateSection;
use crate::context::RequestContext;
use crate::error::panic_message;
use crate::live::protocol::REBUILD_CHANNEL;
use crate::store::Broadcaster;

/// One queued mutation: the thunk to run, the widgets it invalidates, and
/// the request context it originated from. The context is handed back to
/// the thunk at execution time; nothing ambient is involved.
pub struct PendingUpdate {
    thunk: Box<dyn FnOnce(&RequestContext) + Send>,
    affected: BTreeSet<String>,
    queued_at: Instant,
    context: RequestContext,
}

impl PendingUpdate {
    pub fn new(
        context: RequestContext,
        affected: impl IntoIterator<Item = impl Into<String>>,
        thunk: impl FnOnce(&RequestContext) + Send + 'static,
    ) -> Self {
        Self {
            thunk: Box::new(thunk),
            affected: affected.into_iter().map(Into::into).collect(),
            queued_at: Instant::now(),
            context,
        }
    }

    pub fn affected_widgets(&self) -> &BTreeSet<String> {
        &self.affected
    }

    pub fn context(&self) -> &RequestContext {
        &self.context
    }
}

#[derive(Clone)]
pub struct UpdateScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    tx: mpsc::Sender<PendingUpdate>,
    broadcaster: Arc<dyn Broadcaster>,
    drain: Mutex<Option<JoinHandle<()>>>,
}

impl UpdateScheduler {
    /// Spawns the drain loop; must be called inside a Tokio runtime.
    pub fn new(config: &UpdateSection, broadcaster: Arc<dyn Broadcaster>) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let drain = tokio::spawn(drain_loop(rx, Arc::clone(&broadcaster), config.debounce()));
        Self {
            inner: Arc::new(SchedulerInner {
                tx,
                broadcaster,
                drain: Mutex::new(Some(drain)),
            }),
        }
    }

    /// Hands an update to the drain loop. Never blocks and never discards:
    /// when the queue is saturated the update runs right here on the
    /// caller's task, with its own rebuild notification.
    pub fn queue_update(&self, update: PendingUpdate) {
        match self.inner.tx.try_send(update) {
            Ok(()) => {}
            Err(TrySendError::Full(update)) => {
                log::warn!(
                    "update queue full, running update from request {} inline",
                    update.context().id()
                );
                drain_batch(self.inner.broadcaster.as_ref(), vec![update]);
            }
            Err(TrySendError::Closed(update)) => {
                log::warn!(
                    "update queue closed, running update from request {} inline",
                    update.context().id()
                );
                drain_batch(self.inner.broadcaster.as_ref(), vec![update]);
            }
        }
    }
}

impl Drop for SchedulerInner {
    fn drop(&mut self) {
        if let Some(drain) = self.drain.lock().unwrap().take() {
            drain.abort();
        }
    }
}

/// Collects updates until the debounce window passes without an arrival,
/// then drains the accumulated batch. The window restarts on every arrival.
async fn drain_loop(
    mut rx: mpsc::Receiver<PendingUpdate>,
    broadcaster: Arc<dyn Broadcaster>,
    debounce: Duration,
) {
    while let Some(first) = rx.recv().await {
        let mut batch = vec![first];
        loop {
            match timeout(debounce, rx.recv()).await {
                Ok(Some(update)) => batch.push(update),
                Ok(None) | Err(_) => break,
            }
        }
        drain_batch(broadcaster.as_ref(), batch);
    }
}

/// Runs every thunk in arrival order, then broadcasts one rebuild
/// notification for the unioned widget set. A panicking thunk is logged
/// and the rest of the batch still runs.
fn drain_batch(broadcaster: &dyn Broadcaster, batch: Vec<PendingUpdate>) {
    let mut widgets: BTreeSet<String> = BTreeSet::new();
    for update in &batch {
        widgets.extend(update.affected.iter().cloned());
    }
    let size = batch.len();
    let waited = batch
        .first()
        .map(|update| update.queued_at.elapsed())
        .unwrap_or_default();

    for update in batch {
        let PendingUpdate {
            thunk,
            affected,
            context,
            ..
        } = update;
        if let Err(payload) = std::panic::catch_unwind(AssertUnwindSafe(|| thunk(&context))) {
            log::error!(
                "update from request {} panicked (widgets {:?}): {}",
                context.id(),
                affected,
                panic_message(payload)
            );
        }
    }

    log::debug!(
        "drained {size} update(s) queued for {waited:?}, rebuilding {} widget(s)",
        widgets.len()
    );
    broadcaster.broadcast(REBUILD_CHANNEL, json!({ "widget_ids": widgets }));
}

#[cfg(test)]
mod tests {
    use serde_json::Value;
    use tokio::time::sleep;

    use super::*;

    #[derive(Default)]
    struct RecordingBroadcaster {
        broadcasts: Mutex<Vec<(String, Value)>>,
    }

    impl Broadcaster for RecordingBroadcaster {
        fn broadcast(&self, channel: &str, data: Value) {
            self.broadcasts
                .lock()
                .unwrap()
                .push((channel.to_string(), data));
        }

        fn value_changed(&self, _id: &str, _value: Value) {}
    }

    fn logging_update(
        log: &Arc<Mutex<Vec<&'static str>>>,
        name: &'static str,
        widget: &str,
    ) -> PendingUpdate {
        let log = Arc::clone(log);
        PendingUpdate::new(RequestContext::new(), [widget], move |_| {
            log.lock().unwrap().push(name);
        })
    }

    #[tokio::test]
    async fn batch_runs_in_arrival_order_with_one_broadcast() {
        let recorder = Arc::new(RecordingBroadcaster::default());
        let scheduler = UpdateScheduler::new(
            &UpdateSection {
                debounce_ms: 50,
                queue_capacity: 16,
            },
            recorder.clone(),
        );
        let log = Arc::new(Mutex::new(Vec::new()));

        scheduler.queue_update(logging_update(&log, "M1", "w-a"));
        scheduler.queue_update(logging_update(&log, "M2", "w-b"));
        scheduler.queue_update(logging_update(&log, "M3", "w-a"));

        sleep(Duration::from_millis(300)).await;
        assert_eq!(*log.lock().unwrap(), vec!["M1", "M2", "M3"]);

        let broadcasts = recorder.broadcasts.lock().unwrap();
        assert_eq!(broadcasts.len(), 1);
        assert_eq!(broadcasts[0].0, REBUILD_CHANNEL);
        assert_eq!(broadcasts[0].1, json!({ "widget_ids": ["w-a", "w-b"] }));
    }

    #[tokio::test]
    async fn quiet_gaps_split_batches() {
        let recorder = Arc::new(RecordingBroadcaster::default());
        let scheduler = UpdateScheduler::new(
            &UpdateSection {
                debounce_ms: 50,
                queue_capacity: 16,
            },
            recorder.clone(),
        );
        let log = Arc::new(Mutex::new(Vec::new()));

        scheduler.queue_update(logging_update(&log, "first", "w-a"));
        sleep(Duration::from_millis(300)).await;
        scheduler.queue_update(logging_update(&log, "second", "w-b"));
        sleep(Duration::from_millis(300)).await;

        assert_eq!(recorder.broadcasts.lock().unwrap().len(), 2);
    }

    // Runs on the single-threaded test runtime: the drain task cannot make
    // progress between the queue_update calls, so the third update finds
    // the queue full and must execute inline.
    #[tokio::test]
    async fn saturated_queue_falls_back_to_inline_execution() {
        let recorder = Arc::new(RecordingBroadcaster::default());
        let scheduler = UpdateScheduler::new(
            &UpdateSection {
                debounce_ms: 50,
                queue_capacity: 1,
            },
            recorder.clone(),
        );
        let log = Arc::new(Mutex::new(Vec::new()));

        scheduler.queue_update(logging_update(&log, "queued", "w-a"));
        scheduler.queue_update(logging_update(&log, "inline-1", "w-b"));
        scheduler.queue_update(logging_update(&log, "inline-2", "w-c"));

        // The overflow updates already ran, before any await point.
        assert_eq!(*log.lock().unwrap(), vec!["inline-1", "inline-2"]);
        assert_eq!(recorder.broadcasts.lock().unwrap().len(), 2);

        sleep(Duration::from_millis(300)).await;
        assert_eq!(
            *log.lock().unwrap(),
            vec!["inline-1", "inline-2", "queued"]
        );
        let broadcasts = recorder.broadcasts.lock().unwrap();
        assert_eq!(broadcasts.len(), 3);
        assert_eq!(broadcasts[2].1, json!({ "widget_ids": ["w-a"] }));
    }

    #[tokio::test]
    async fn panicking_update_does_not_abort_the_batch() {
        let recorder = Arc::new(RecordingBroadcaster::default());
        let scheduler = UpdateScheduler::new(
            &UpdateSection {
                debounce_ms: 50,
                queue_capacity: 16,
            },
            recorder.clone(),
        );
        let log = Arc::new(Mutex::new(Vec::new()));

        scheduler.queue_update(PendingUpdate::new(
            RequestContext::new(),
            ["w-bad"],
            |_| panic!("boom"),
        ));
        scheduler.queue_update(logging_update(&log, "survivor", "w-good"));

        sleep(Duration::from_millis(300)).await;
        assert_eq!(*log.lock().unwrap(), vec!["survivor"]);

        let broadcasts = recorder.broadcasts.lock().unwrap();
        assert_eq!(broadcasts.len(), 1);
        assert_eq!(
            broadcasts[0].1,
            json!({ "widget_ids": ["w-bad", "w-good"] })
        );
    }

    #[tokio::test]
    async fn thunks_receive_their_own_request_context() {
        let recorder = Arc::new(RecordingBroadcaster::default());
        let scheduler = UpdateScheduler::new(&UpdateSection::default(), recorder.clone());

        let context = RequestContext::new();
        let expected = context.id().to_string();
        let seen = Arc::new(Mutex::new(None));
        let seen_clone = Arc::clone(&seen);
        scheduler.queue_update(PendingUpdate::new(context, ["w"], move |ctx| {
            *seen_clone.lock().unwrap() = Some(ctx.id().to_string());
        }));

        sleep(Duration::from_millis(300)).await;
        assert_eq!(seen.lock().unwrap().clone(), Some(expected));
    }
}
