//! loopwatch daemon: watches project artifact directories and fans out
//! classified, debounced change events to WebSocket subscribers.
//!
//! Pipeline: [`watcher`] → [`debounce`] → [`bus`] → [`router`] →
//! [`registry`], with [`heartbeat`] pruning dead connections and
//! [`ws_server`] owning the transport.

pub mod bus;
pub mod daemon;
pub mod debounce;
pub mod error;
pub mod handler;
pub mod heartbeat;
pub mod registry;
pub mod router;
pub mod watcher;
pub mod ws_server;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a std mutex, recovering the data if a previous holder panicked.
/// Critical sections in this crate never await, so the data stays
/// consistent even then.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
