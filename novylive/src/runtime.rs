//! The assembled runtime: one of everything, wired together explicitly.
//!
//! No component reaches for a global. The hub is the store's and the
//! scheduler's broadcaster, the registry shares the store, and everything
//! is handed down from here. Tests that want isolation just build a second
//! `Runtime`.

use std::sync::Arc;

use crate::callbacks::CallbackRegistry;
use crate::config::RuntimeConfig;
use crate::context::RequestContext;
use crate::live::ConnectionHub;
use crate::scheduler::UpdateScheduler;
use crate::store::{Broadcaster, StateStore};
use crate::widget::{RenderContext, Widget};

/// Shared handle to the whole component bundle. Cloning is cheap; all
/// clones address the same components. Must be created inside a Tokio
/// runtime (background tasks are spawned at construction).
#[derive(Clone)]
pub struct Runtime {
    config: Arc<RuntimeConfig>,
    store: StateStore,
    hub: ConnectionHub,
    scheduler: UpdateScheduler,
    callbacks: CallbackRegistry,
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Self {
        let config = Arc::new(config);
        let hub = ConnectionHub::new(&config.live);
        let broadcaster: Arc<dyn Broadcaster> = Arc::new(hub.clone());
        let store = StateStore::with_broadcaster(Arc::clone(&broadcaster));
        let scheduler = UpdateScheduler::new(&config.update, broadcaster);
        let callbacks = CallbackRegistry::new(&config.callbacks, store.clone());
        Self {
            config,
            store,
            hub,
            scheduler,
            callbacks,
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn hub(&self) -> &ConnectionHub {
        &self.hub
    }

    pub fn scheduler(&self) -> &UpdateScheduler {
        &self.scheduler
    }

    pub fn callbacks(&self) -> &CallbackRegistry {
        &self.callbacks
    }

    pub fn render_context(&self, request: RequestContext) -> RenderContext {
        RenderContext::new(self.store.clone(), self.callbacks.clone(), request)
    }

    /// Renders one widget for the given request.
    pub fn render(&self, widget: &dyn Widget, request: RequestContext) -> String {
        widget.render(&self.render_context(request))
    }
}
