//! Server-side event callbacks reachable over HTTP.
//!
//! Widgets register handlers here during render; each registration gets a
//! random ID that the presentation layer embeds in its markup, and the
//! matching endpoint `/api/callbacks/{id}` dispatches invocations back to
//! the handler. Handlers are a small closed set of typed shapes
//! ([`EventHandler`]), so parameter binding is explicit coercion from
//! conventional keys rather than runtime type inspection.
//!
//! Records from a superseded render become orphans; a periodic sweep
//! removes anything unused past the configured TTL.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::config::CallbackSection;
use crate::context::RequestContext;
use crate::error::{RuntimeError, panic_message};
use crate::store::StateStore;

/// What the client-side event was.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    Press,
    Change,
    Submit,
    Custom(String),
}

impl EventKind {
    pub fn as_str(&self) -> &str {
        match self {
            EventKind::Press => "press",
            EventKind::Change => "change",
            EventKind::Submit => "submit",
            EventKind::Custom(name) => name,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a handler may touch, passed explicitly at invocation time:
/// the shared store and the context of the request that triggered the
/// event.
pub struct EventContext {
    store: StateStore,
    request: RequestContext,
}

impl EventContext {
    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn request(&self) -> &RequestContext {
        &self.request
    }
}

/// The closed set of handler shapes. The shape chosen at registration
/// decides how invocation parameters are coerced; unmatched parameters
/// fall back to the shape's zero value rather than failing the call.
#[derive(Clone)]
pub enum EventHandler {
    NoArg(Arc<dyn Fn(&EventContext) + Send + Sync>),
    Text(Arc<dyn Fn(&EventContext, String) + Send + Sync>),
    Toggle(Arc<dyn Fn(&EventContext, bool) + Send + Sync>),
    Index(Arc<dyn Fn(&EventContext, i64) + Send + Sync>),
    Json(Arc<dyn Fn(&EventContext, Value) + Send + Sync>),
}

impl EventHandler {
    pub fn no_arg(f: impl Fn(&EventContext) + Send + Sync + 'static) -> Self {
        EventHandler::NoArg(Arc::new(f))
    }

    pub fn text(f: impl Fn(&EventContext, String) + Send + Sync + 'static) -> Self {
        EventHandler::Text(Arc::new(f))
    }

    pub fn toggle(f: impl Fn(&EventContext, bool) + Send + Sync + 'static) -> Self {
        EventHandler::Toggle(Arc::new(f))
    }

    pub fn index(f: impl Fn(&EventContext, i64) + Send + Sync + 'static) -> Self {
        EventHandler::Index(Arc::new(f))
    }

    pub fn json(f: impl Fn(&EventContext, Value) + Send + Sync + 'static) -> Self {
        EventHandler::Json(Arc::new(f))
    }

    pub fn shape(&self) -> &'static str {
        match self {
            EventHandler::NoArg(_) => "no_arg",
            EventHandler::Text(_) => "text",
            EventHandler::Toggle(_) => "toggle",
            EventHandler::Index(_) => "index",
            EventHandler::Json(_) => "json",
        }
    }
}

/// Invocation parameters, decoded from a JSON or form body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventParams(BTreeMap<String, Value>);

impl EventParams {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Accepts a JSON object (or null, treated as empty). Anything else is
    /// a malformed payload.
    pub fn from_json_object(raw: Value) -> Result<Self, RuntimeError> {
        match raw {
            Value::Object(map) => Ok(Self(map.into_iter().collect())),
            Value::Null => Ok(Self::empty()),
            other => Err(RuntimeError::MalformedPayload(format!(
                "expected a JSON object, got {other}"
            ))),
        }
    }

    /// Form fields arrive stringly typed; the literals `"true"`/`"false"`
    /// are special-cased into booleans.
    pub fn from_form_fields(fields: impl IntoIterator<Item = (String, String)>) -> Self {
        Self(
            fields
                .into_iter()
                .map(|(key, value)| {
                    let value = match value.as_str() {
                        "true" => Value::Bool(true),
                        "false" => Value::Bool(false),
                        _ => Value::String(value),
                    };
                    (key, value)
                })
                .collect(),
        )
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Text coercion: `"value"` then `"text"`; numbers and booleans are
    /// stringified; otherwise the empty string.
    pub fn text_arg(&self) -> String {
        for key in ["value", "text"] {
            match self.0.get(key) {
                Some(Value::String(text)) => return text.clone(),
                Some(Value::Number(n)) => return n.to_string(),
                Some(Value::Bool(b)) => return b.to_string(),
                _ => {}
            }
        }
        String::new()
    }

    /// Boolean coercion: `"checked"` then `"value"`; accepts real booleans
    /// and the string literals; otherwise `false`.
    pub fn bool_arg(&self) -> bool {
        for key in ["checked", "value"] {
            match self.0.get(key) {
                Some(Value::Bool(b)) => return *b,
                Some(Value::String(text)) => match text.as_str() {
                    "true" => return true,
                    "false" => return false,
                    _ => {}
                },
                _ => {}
            }
        }
        false
    }

    /// Integer coercion: `"index"` then `"value"`; parses numeric strings;
    /// otherwise `0`.
    pub fn index_arg(&self) -> i64 {
        for key in ["index", "value"] {
            match self.0.get(key) {
                Some(Value::Number(n)) => {
                    if let Some(i) = n.as_i64() {
                        return i;
                    }
                }
                Some(Value::String(text)) => {
                    if let Ok(i) = text.parse() {
                        return i;
                    }
                }
                _ => {}
            }
        }
        0
    }

    /// The whole parameter map as a JSON object.
    pub fn into_value(self) -> Value {
        Value::Object(self.0.into_iter().collect())
    }
}

struct CallbackRecord {
    widget_id: String,
    widget_type: String,
    event_kind: EventKind,
    handler: EventHandler,
    registered_by: RequestContext,
    created_at: SystemTime,
    last_used: SystemTime,
}

/// Read-only snapshot of one registration.
#[derive(Debug, Clone)]
pub struct CallbackInfo {
    pub id: String,
    pub widget_id: String,
    pub widget_type: String,
    pub event_kind: String,
    pub handler_shape: &'static str,
    pub registered_by: String,
    pub created_at: SystemTime,
    pub last_used: SystemTime,
}

#[derive(Clone)]
pub struct CallbackRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    store: StateStore,
    records: Mutex<HashMap<String, CallbackRecord>>,
    ttl: Duration,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl CallbackRegistry {
    /// Spawns the sweep ticker; must be called inside a Tokio runtime.
    pub fn new(config: &CallbackSection, store: StateStore) -> Self {
        let inner = Arc::new(RegistryInner {
            store,
            records: Mutex::new(HashMap::new()),
            ttl: config.ttl(),
            reaper: Mutex::new(None),
        });
        let ticker = Self::spawn_reaper(&inner, config.sweep_interval());
        *inner.reaper.lock().unwrap() = Some(ticker);
        Self { inner }
    }

    /// Stores a handler under a fresh random ID and returns the ID for the
    /// renderer to embed. The matching endpoint path is
    /// [`endpoint_path`](Self::endpoint_path).
    pub fn register(
        &self,
        widget_id: impl Into<String>,
        widget_type: impl Into<String>,
        event_kind: EventKind,
        handler: EventHandler,
        registered_by: &RequestContext,
    ) -> String {
        let id = Uuid::new_v4().simple().to_string();
        let now = SystemTime::now();
        let record = CallbackRecord {
            widget_id: widget_id.into(),
            widget_type: widget_type.into(),
            event_kind,
            handler,
            registered_by: registered_by.clone(),
            created_at: now,
            last_used: now,
        };
        log::debug!(
            "registered {} callback {id} for widget {} ({})",
            record.event_kind,
            record.widget_id,
            record.handler.shape()
        );
        self.inner.records.lock().unwrap().insert(id.clone(), record);
        id
    }

    /// URL path the client posts to for a given callback ID.
    pub fn endpoint_path(callback_id: &str) -> String {
        format!("/api/callbacks/{callback_id}")
    }

    /// Looks the callback up, refreshes its `last_used`, and dispatches the
    /// handler with coerced parameters. A panic inside the handler is
    /// recovered and reported as [`RuntimeError::HandlerPanicked`].
    pub fn invoke(
        &self,
        callback_id: &str,
        params: EventParams,
        request: &RequestContext,
    ) -> Result<(), RuntimeError> {
        let (handler, widget_id, event_kind) = {
            let mut records = self.inner.records.lock().unwrap();
            let record = records
                .get_mut(callback_id)
                .ok_or_else(|| RuntimeError::UnknownCallback(callback_id.to_string()))?;
            record.last_used = SystemTime::now();
            (
                record.handler.clone(),
                record.widget_id.clone(),
                record.event_kind.clone(),
            )
        };

        let ctx = EventContext {
            store: self.inner.store.clone(),
            request: request.clone(),
        };
        match std::panic::catch_unwind(AssertUnwindSafe(|| dispatch(&handler, &ctx, params))) {
            Ok(()) => {
                log::debug!(
                    "callback {callback_id} ({event_kind} on {widget_id}) handled for request {}",
                    request.id()
                );
                Ok(())
            }
            Err(payload) => {
                let message = panic_message(payload);
                log::error!(
                    "callback {callback_id} ({event_kind} on {widget_id}) panicked: {message}"
                );
                Err(RuntimeError::HandlerPanicked {
                    callback_id: callback_id.to_string(),
                    widget_id,
                    event_kind: event_kind.as_str().to_string(),
                    message,
                })
            }
        }
    }

    /// Removes every record unused for longer than the TTL. Returns how
    /// many were reaped.
    pub fn sweep_expired(&self) -> usize {
        sweep_records(&self.inner)
    }

    pub fn callbacks_for_widget(&self, widget_id: &str) -> Vec<CallbackInfo> {
        self.snapshot(|record| record.widget_id == widget_id)
    }

    pub fn callbacks_of_type(&self, widget_type: &str) -> Vec<CallbackInfo> {
        self.snapshot(|record| record.widget_type == widget_type)
    }

    pub fn counts_by_type(&self) -> BTreeMap<String, usize> {
        let records = self.inner.records.lock().unwrap();
        let mut counts = BTreeMap::new();
        for record in records.values() {
            *counts.entry(record.widget_type.clone()).or_insert(0) += 1;
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.inner.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.records.lock().unwrap().is_empty()
    }

    fn snapshot(&self, keep: impl Fn(&CallbackRecord) -> bool) -> Vec<CallbackInfo> {
        let records = self.inner.records.lock().unwrap();
        records
            .iter()
            .filter(|(_, record)| keep(record))
            .map(|(id, record)| CallbackInfo {
                id: id.clone(),
                widget_id: record.widget_id.clone(),
                widget_type: record.widget_type.clone(),
                event_kind: record.event_kind.as_str().to_string(),
                handler_shape: record.handler.shape(),
                registered_by: record.registered_by.id().to_string(),
                created_at: record.created_at,
                last_used: record.last_used,
            })
            .collect()
    }

    fn spawn_reaper(inner: &Arc<RegistryInner>, interval: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                sweep_records(&inner);
            }
        })
    }

    #[cfg(test)]
    fn backdate(&self, callback_id: &str, age: Duration) {
        let mut records = self.inner.records.lock().unwrap();
        if let Some(record) = records.get_mut(callback_id) {
            record.last_used = SystemTime::now() - age;
        }
    }
}

impl Drop for RegistryInner {
    fn drop(&mut self) {
        if let Some(ticker) = self.reaper.lock().unwrap().take() {
            ticker.abort();
        }
    }
}

fn sweep_records(inner: &RegistryInner) -> usize {
    let cutoff = SystemTime::now() - inner.ttl;
    let reaped = {
        let mut records = inner.records.lock().unwrap();
        let before = records.len();
        records.retain(|_, record| record.last_used >= cutoff);
        before - records.len()
    };
    if reaped > 0 {
        log::info!("reaped {reaped} expired callback(s)");
    }
    reaped
}

fn dispatch(handler: &EventHandler, ctx: &EventContext, params: EventParams) {
    match handler {
        EventHandler::NoArg(f) => f(ctx),
        EventHandler::Text(f) => f(ctx, params.text_arg()),
        EventHandler::Toggle(f) => f(ctx, params.bool_arg()),
        EventHandler::Index(f) => f(ctx, params.index_arg()),
        EventHandler::Json(f) => f(ctx, params.into_value()),
    }
}
