//! Render contract between the runtime and the widget layer.
//!
//! The runtime never looks inside a widget. It hands over a
//! [`RenderContext`] and receives HTML back; anything else the widget
//! needs (state reads, callback registration) goes through that context.

use crate::callbacks::CallbackRegistry;
use crate::context::RequestContext;
use crate::store::StateStore;

/// A renderable component.
pub trait Widget: Send + Sync {
    fn render(&self, ctx: &RenderContext) -> String;
}

/// What a widget may touch while rendering: the shared store, the callback
/// registry (for wiring event endpoints into the markup), and the context
/// of the request being rendered.
pub struct RenderContext {
    store: StateStore,
    callbacks: CallbackRegistry,
    request: RequestContext,
}

impl RenderContext {
    pub(crate) fn new(
        store: StateStore,
        callbacks: CallbackRegistry,
        request: RequestContext,
    ) -> Self {
        Self {
            store,
            callbacks,
            request,
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn callbacks(&self) -> &CallbackRegistry {
        &self.callbacks
    }

    pub fn request(&self) -> &RequestContext {
        &self.request
    }
}
