//! Server-held reactive UI state with live fan-out.
//!
//! The runtime keeps all widget state on the server. Five pieces work
//! together:
//!
//! - [`ObservableValue`]: a typed value with change listeners; equal writes
//!   are no-ops.
//! - [`StateStore`]: keyed global state plus a registry of observables,
//!   queryable and updatable over HTTP.
//! - [`ConnectionHub`]: fan-out to live clients over a socket, with
//!   heartbeat and slow-consumer shedding.
//! - [`UpdateScheduler`]: debounced batching of mutations into one rebuild
//!   notification per burst.
//! - [`CallbackRegistry`]: typed event handlers reachable through generated
//!   HTTP endpoints, swept when idle.
//!
//! Everything is wired explicitly through [`Runtime`]; there are no
//! process-global singletons.
//!
//! # Quick Start
//!
//! ```no_run
//! use novylive::{
//!     EventHandler, EventKind, ObservableValue, RenderContext, Runtime, RuntimeConfig, Widget,
//! };
//!
//! struct CounterPanel;
//!
//! impl Widget for CounterPanel {
//!     fn render(&self, ctx: &RenderContext) -> String {
//!         let count = ctx
//!             .store()
//!             .notifier_state("counter")
//!             .map(|state| state.json)
//!             .unwrap_or_default();
//!         let press = ctx.callbacks().register(
//!             "counter-panel",
//!             "button",
//!             EventKind::Press,
//!             EventHandler::no_arg(|event| {
//!                 event.store().set("last_press", serde_json::json!(true));
//!             }),
//!             ctx.request(),
//!         );
//!         format!("<button data-endpoint=\"/api/callbacks/{press}\">{count}</button>")
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = Runtime::new(RuntimeConfig::default());
//!     let counter = ObservableValue::with_id("counter", 0u32);
//!     runtime.store().register_notifier(&counter);
//!     let app = novylive::router(runtime);
//!     novylive::serve("127.0.0.1:8080", app).await
//! }
//! ```

pub mod callbacks;
pub mod config;
pub mod context;
pub mod dataflow;
pub mod error;
pub mod live;
pub mod runtime;
pub mod scheduler;
pub mod server;
pub mod store;
pub mod widget;

pub use callbacks::{
    CallbackInfo, CallbackRegistry, EventContext, EventHandler, EventKind, EventParams,
};
pub use config::RuntimeConfig;
pub use context::RequestContext;
pub use dataflow::{ListenerHandle, ObservableValue};
pub use error::RuntimeError;
pub use live::protocol::{ClientMsg, REBUILD_CHANNEL, ServerMsg, state_channel};
pub use live::{ConnectionHub, ConnectionState, LocalSubscription, OutboundFrame};
pub use runtime::Runtime;
pub use scheduler::{PendingUpdate, UpdateScheduler};
pub use server::{router, serve};
pub use store::{Broadcaster, NotifierSnapshot, StateNotifier, StateStore, WatcherHandle};
pub use widget::{RenderContext, Widget};
