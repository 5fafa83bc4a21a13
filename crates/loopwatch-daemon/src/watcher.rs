//! Directory watching, one native watch per project root.
//!
//! Only the artifact directory is watched recursively; the project root is
//! watched one level deep so the artifact directory can be picked up when it
//! is created later or noticed when the root goes away. Raw notifications are
//! bridged from notify's callback thread into a tokio channel, filtered to the
//! tracked artifact patterns, and fed into the project's [`Debouncer`]. Files
//! already present when a watch starts produce no events; only later changes
//! do.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use loopwatch_core::classify::{ARTIFACT_DIR, is_tracked};
use loopwatch_core::{ChangeKind, DebounceConfig, ProjectDirectory};
use notify::event::{MetadataKind, ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::bus::{ChangeBus, WatchNotification};
use crate::debounce::{Debouncer, RawEvent};
use crate::error::WatchError;
use crate::lock;

/// Capacity of the bridge between notify's thread and the pump task.
const RAW_CHANNEL_CAPACITY: usize = 256;

/// Public view of one active watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchInfo {
    pub project_id: String,
    pub root: PathBuf,
}

struct ProjectWatch {
    root: PathBuf,
    debouncer: Arc<Debouncer>,
    pump: JoinHandle<()>,
    /// Dropping the native watcher stops OS notifications. Shared with the
    /// pump, which attaches the artifact directory when it appears.
    _watcher: Arc<Mutex<RecommendedWatcher>>,
}

pub struct DirectoryWatcher {
    bus: ChangeBus,
    windows: DebounceConfig,
    watches: Mutex<HashMap<String, ProjectWatch>>,
}

impl DirectoryWatcher {
    pub fn new(bus: ChangeBus, windows: DebounceConfig) -> Self {
        Self {
            bus,
            windows,
            watches: Mutex::new(HashMap::new()),
        }
    }

    /// Start watching `root` for `project_id`.
    ///
    /// Returns `true` if the project is (now) watched, including when it was
    /// already watched. Returns `false` and registers nothing if the watch
    /// could not be set up.
    pub fn watch(&self, project_id: &str, root: &Path) -> bool {
        match self.try_watch(project_id, root) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(
                    project_id = %project_id,
                    root = %root.display(),
                    error = %e,
                    "watch: setup failed"
                );
                false
            }
        }
    }

    /// Like [`watch`](Self::watch) but reports why setup failed.
    /// Must be called from within a tokio runtime.
    pub fn try_watch(&self, project_id: &str, root: &Path) -> Result<(), WatchError> {
        let mut watches = lock(&self.watches);
        if watches.contains_key(project_id) {
            tracing::debug!(project_id = %project_id, "watch: already watching");
            return Ok(());
        }

        if !root.is_dir() {
            return Err(WatchError::RootMissing(root.to_path_buf()));
        }
        let root = std::fs::canonicalize(root).map_err(|source| WatchError::Resolve {
            path: root.to_path_buf(),
            source,
        })?;

        let (tx, rx) = mpsc::channel::<notify::Result<Event>>(RAW_CHANNEL_CAPACITY);
        let mut watcher = notify::recommended_watcher(move |res| {
            // Receiver gone means the watch is being torn down.
            let _ = tx.blocking_send(res);
        })?;
        watcher.watch(&root, RecursiveMode::NonRecursive)?;
        let artifact_dir = root.join(ARTIFACT_DIR);
        let attached = artifact_dir.is_dir();
        if attached {
            watcher.watch(&artifact_dir, RecursiveMode::Recursive)?;
        }
        let watcher = Arc::new(Mutex::new(watcher));

        let debouncer = Arc::new(Debouncer::new(
            project_id,
            root.clone(),
            self.windows,
            self.bus.clone(),
        ));
        let pump = tokio::spawn(pump_events(
            PumpContext {
                project_id: project_id.to_string(),
                root: root.clone(),
                watcher: Arc::clone(&watcher),
                debouncer: Arc::clone(&debouncer),
                bus: self.bus.clone(),
            },
            rx,
            attached,
        ));

        watches.insert(
            project_id.to_string(),
            ProjectWatch {
                root: root.clone(),
                debouncer,
                pump,
                _watcher: watcher,
            },
        );
        drop(watches);

        tracing::info!(project_id = %project_id, root = %root.display(), "watch: started");
        self.bus.publish(WatchNotification::Ready {
            project_id: project_id.to_string(),
        });
        Ok(())
    }

    /// Look the root up in `projects` and watch it.
    pub fn watch_project(&self, projects: &dyn ProjectDirectory, project_id: &str) -> bool {
        match projects.root_path(project_id) {
            Some(root) => self.watch(project_id, &root),
            None => {
                tracing::warn!(project_id = %project_id, "watch: unknown project");
                false
            }
        }
    }

    /// Stop watching. Every pending debounce timer for the project is
    /// cancelled before this returns. Returns `false` if not watching.
    pub fn unwatch(&self, project_id: &str) -> bool {
        let Some(watch) = lock(&self.watches).remove(project_id) else {
            return false;
        };

        let cancelled = watch.debouncer.cancel_all();
        watch.pump.abort();
        tracing::info!(
            project_id = %project_id,
            root = %watch.root.display(),
            cancelled_timers = cancelled,
            "watch: stopped"
        );
        true
    }

    pub fn unwatch_all(&self) -> usize {
        let ids: Vec<String> = lock(&self.watches).keys().cloned().collect();
        ids.iter().filter(|id| self.unwatch(id)).count()
    }

    pub fn is_watching(&self, project_id: &str) -> bool {
        lock(&self.watches).contains_key(project_id)
    }

    /// Active watches, ordered by project id.
    pub fn list(&self) -> Vec<WatchInfo> {
        let watches = lock(&self.watches);
        let mut out: Vec<WatchInfo> = watches
            .iter()
            .map(|(id, w)| WatchInfo {
                project_id: id.clone(),
                root: w.root.clone(),
            })
            .collect();
        out.sort_by(|a, b| a.project_id.cmp(&b.project_id));
        out
    }

    /// Pending debounce timers for a project, if watched.
    pub fn pending_timers(&self, project_id: &str) -> Option<usize> {
        lock(&self.watches)
            .get(project_id)
            .map(|w| w.debouncer.pending_count())
    }
}

impl Drop for DirectoryWatcher {
    fn drop(&mut self) {
        for (_, watch) in lock(&self.watches).drain() {
            watch.debouncer.cancel_all();
            watch.pump.abort();
        }
    }
}

struct PumpContext {
    project_id: String,
    root: PathBuf,
    watcher: Arc<Mutex<RecommendedWatcher>>,
    debouncer: Arc<Debouncer>,
    bus: ChangeBus,
}

impl PumpContext {
    fn publish_error(&self, message: String) {
        self.bus.publish(WatchNotification::Error {
            project_id: self.project_id.clone(),
            message,
        });
    }

    /// Watch the artifact directory recursively and replay the files it
    /// already holds as additions: they appeared after the watch started.
    ///
    /// Runs off the pump task. Registering a watch waits on notify's event
    /// thread, which may itself be waiting for the pump to drain the channel.
    fn attach_artifact_dir(self: &Arc<Self>) {
        let ctx = Arc::clone(self);
        tokio::spawn(async move {
            let dir = ctx.root.join(ARTIFACT_DIR);
            let watcher = Arc::clone(&ctx.watcher);
            let attached = tokio::task::spawn_blocking(move || -> notify::Result<Vec<PathBuf>> {
                lock(&watcher).watch(&dir, RecursiveMode::Recursive)?;
                let mut files = Vec::new();
                collect_files(&dir, &mut files);
                Ok(files)
            })
            .await;

            match attached {
                Ok(Ok(files)) => {
                    tracing::debug!(project_id = %ctx.project_id, files = files.len(), "watch: artifact dir attached");
                    for path in files {
                        if is_tracked(&ctx.root, &path) {
                            ctx.debouncer.push(RawEvent::new(path, ChangeKind::Add));
                        }
                    }
                }
                Ok(Err(e)) => {
                    tracing::warn!(project_id = %ctx.project_id, error = %e, "watch: cannot attach artifact dir");
                    ctx.publish_error(format!("cannot watch {ARTIFACT_DIR}: {e}"));
                }
                Err(e) => {
                    tracing::warn!(project_id = %ctx.project_id, error = %e, "watch: artifact dir attach task failed");
                }
            }
        });
    }
}

async fn pump_events(
    ctx: PumpContext,
    mut rx: mpsc::Receiver<notify::Result<Event>>,
    mut artifact_attached: bool,
) {
    let ctx = Arc::new(ctx);
    let artifact_dir = ctx.root.join(ARTIFACT_DIR);
    let mut root_missing_reported = false;

    while let Some(result) = rx.recv().await {
        let event = match result {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(project_id = %ctx.project_id, error = %e, "watch: runtime error");
                ctx.publish_error(e.to_string());
                continue;
            }
        };

        // Reported once; the native watch on the root dies with it.
        if !root_missing_reported
            && matches!(event.kind, EventKind::Remove(_))
            && (root_removed(&event, &ctx.root) || !ctx.root.is_dir())
        {
            root_missing_reported = true;
            tracing::warn!(project_id = %ctx.project_id, root = %ctx.root.display(), "watch: project root removed");
            ctx.publish_error(format!("project root removed: {}", ctx.root.display()));
        }

        if event.paths.iter().any(|p| p == &artifact_dir) {
            let present = artifact_dir.is_dir();
            if present && !artifact_attached {
                ctx.attach_artifact_dir();
            }
            artifact_attached = present;
        }

        for raw in raw_events(&event) {
            if is_tracked(&ctx.root, &raw.path) {
                ctx.debouncer.push(raw);
            }
        }
    }
    tracing::debug!(project_id = %ctx.project_id, "watch: event stream closed");
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        match entry.file_type() {
            Ok(ft) if ft.is_dir() => collect_files(&path, out),
            Ok(_) => out.push(path),
            Err(_) => {}
        }
    }
}

fn root_removed(event: &Event, root: &Path) -> bool {
    matches!(event.kind, EventKind::Remove(_)) && event.paths.iter().any(|p| p == root)
}

/// Translate one notify event into add/change/unlink raw events.
fn raw_events(event: &Event) -> Vec<RawEvent> {
    let all = |kind: ChangeKind| -> Vec<RawEvent> {
        event
            .paths
            .iter()
            .map(|p| RawEvent::new(p.clone(), kind))
            .collect()
    };

    match &event.kind {
        EventKind::Create(_) => all(ChangeKind::Add),
        EventKind::Remove(_) => all(ChangeKind::Unlink),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => all(ChangeKind::Unlink),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => all(ChangeKind::Add),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            let mut out = Vec::with_capacity(2);
            if let Some(from) = event.paths.first() {
                out.push(RawEvent::new(from.clone(), ChangeKind::Unlink));
            }
            if let Some(to) = event.paths.get(1) {
                out.push(RawEvent::new(to.clone(), ChangeKind::Add));
            }
            out
        }
        // Rename with unknown direction: ask the filesystem which side we saw.
        EventKind::Modify(ModifyKind::Name(_)) => event
            .paths
            .iter()
            .map(|p| {
                let kind = if p.exists() { ChangeKind::Add } else { ChangeKind::Unlink };
                RawEvent::new(p.clone(), kind)
            })
            .collect(),
        EventKind::Modify(ModifyKind::Metadata(MetadataKind::AccessTime)) => Vec::new(),
        EventKind::Modify(_) => all(ChangeKind::Change),
        EventKind::Access(_) | EventKind::Any | EventKind::Other => Vec::new(),
    }
}
