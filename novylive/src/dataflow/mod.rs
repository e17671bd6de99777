//! Reactive primitives for server-held UI state.
//!
//! # Core Principles
//!
//! 1. **Change detection by value.** An [`ObservableValue`] only reacts when
//!    the new value actually differs (`PartialEq`) from the current one.
//!    Writing an equal value is a no-op: no listeners run, nothing is sent.
//! 2. **Clones are views, not copies.** Cloning an observable yields another
//!    handle onto the same shared cell; a write through any handle is seen
//!    by all of them.
//! 3. **Listeners never run under the value lock.** Notification happens
//!    after the write completes, so a listener can freely read (or write)
//!    the observable it is attached to without deadlocking.
//!
//! # Example
//!
//! ```ignore
//! let count = ObservableValue::with_id("count", 0u32);
//! let handle = count.add_listener(|v| log::info!("count is now {v}"));
//! count.set(1);     // listener fires
//! count.set(1);     // equal value: listener does not fire
//! count.remove_listener(handle);
//! ```

mod observable;

pub use observable::{ListenerHandle, ObservableValue};
