//! Per-path debouncing of raw filesystem events.
//!
//! Each project watch owns one [`Debouncer`]. It keeps an arena of pending
//! timers keyed by normalised path; every raw event for a path aborts that
//! path's timer and starts a fresh one sized by the path's [`FileType`].
//! When a timer survives its whole window, exactly one [`ChangeEvent`] is
//! published carrying the kind of the last raw event.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use loopwatch_core::{ChangeEvent, ChangeKind, DebounceConfig, classify, normalize_path, relative_path};
use tokio::task::AbortHandle;

use crate::bus::{ChangeBus, WatchNotification};
use crate::lock;

/// One undebounced filesystem notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub path: PathBuf,
    pub kind: ChangeKind,
}

impl RawEvent {
    pub fn new(path: impl Into<PathBuf>, kind: ChangeKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }
}

#[derive(Default)]
struct PendingTimers {
    next_generation: u64,
    /// Set by `cancel_all`; no new timers are started afterwards.
    closed: bool,
    timers: HashMap<PathBuf, PendingTimer>,
}

struct PendingTimer {
    generation: u64,
    handle: AbortHandle,
}

pub struct Debouncer {
    project_id: String,
    root: PathBuf,
    windows: DebounceConfig,
    bus: ChangeBus,
    pending: Arc<Mutex<PendingTimers>>,
}

impl Debouncer {
    pub fn new(
        project_id: impl Into<String>,
        root: impl Into<PathBuf>,
        windows: DebounceConfig,
        bus: ChangeBus,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            root: root.into(),
            windows,
            bus,
            pending: Arc::new(Mutex::new(PendingTimers::default())),
        }
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// Feed one raw event. Must be called from within a tokio runtime.
    ///
    /// Returns `false` once the debouncer has been cancelled.
    pub fn push(&self, raw: RawEvent) -> bool {
        let key = normalize_path(&raw.path);
        let file_type = classify(&self.root, &key);
        let window = self.windows.window_for(file_type);
        let path = relative_path(&self.root, &key)
            .unwrap_or_else(|| key.to_string_lossy().into_owned());

        let event = ChangeEvent {
            project_id: self.project_id.clone(),
            file_type,
            path,
            kind: raw.kind,
        };

        let mut pending = lock(&self.pending);
        if pending.closed {
            return false;
        }

        if let Some(previous) = pending.timers.remove(&key) {
            previous.handle.abort();
        }

        pending.next_generation += 1;
        let generation = pending.next_generation;

        let timers = Arc::clone(&self.pending);
        let bus = self.bus.clone();
        let timer_key = key.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            fire(&timers, &timer_key, generation, event, &bus);
        });

        tracing::trace!(
            project_id = %self.project_id,
            path = %key.display(),
            %file_type,
            window_ms = window.as_millis() as u64,
            "debounce: timer armed"
        );

        pending.timers.insert(
            key,
            PendingTimer {
                generation,
                handle: task.abort_handle(),
            },
        );
        true
    }

    /// Abort every pending timer and refuse further events. Idempotent.
    /// Returns how many timers were cancelled.
    pub fn cancel_all(&self) -> usize {
        let mut pending = lock(&self.pending);
        pending.closed = true;
        let cancelled = pending.timers.len();
        for (_, timer) in pending.timers.drain() {
            timer.handle.abort();
        }
        cancelled
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.pending).timers.len()
    }

    pub fn is_pending(&self, path: &Path) -> bool {
        lock(&self.pending).timers.contains_key(&normalize_path(path))
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

/// Timer expiry. The generation check covers a timer that finished sleeping
/// just as a newer event replaced it: only the current generation may emit.
fn fire(
    pending: &Mutex<PendingTimers>,
    key: &Path,
    generation: u64,
    event: ChangeEvent,
    bus: &ChangeBus,
) {
    let mut pending = lock(pending);
    match pending.timers.get(key) {
        Some(timer) if timer.generation == generation => {
            pending.timers.remove(key);
        }
        _ => return,
    }

    tracing::debug!(
        project_id = %event.project_id,
        path = %event.path,
        file_type = %event.file_type,
        kind = %event.kind,
        "debounce: emitting change"
    );
    bus.publish(WatchNotification::Change(event));
}
