use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::catalog::Movie;
use crate::config::MoverConfig;
use crate::error::OperationError;

/// Status of a queue item. `pending` and the terminal states are shared by
/// every operation; the active states in between belong to whichever
/// handler the queue runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    // copy operation
    Copying,
    Verifying,
    UpdatingCatalog,
    // convert operation
    Validating,
    Converting,
    Merging,
    Replacing,
    // terminal
    Completed,
    Failed,
}

impl ItemStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ItemStatus::Completed | ItemStatus::Failed)
    }

    /// An item caught mid-operation: neither waiting nor finished.
    pub fn is_active(&self) -> bool {
        !matches!(self, ItemStatus::Pending) && !self.is_terminal()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Copying => "copying",
            ItemStatus::Verifying => "verifying",
            ItemStatus::UpdatingCatalog => "updating_catalog",
            ItemStatus::Validating => "validating",
            ItemStatus::Converting => "converting",
            ItemStatus::Merging => "merging",
            ItemStatus::Replacing => "replacing",
            ItemStatus::Completed => "completed",
            ItemStatus::Failed => "failed",
        }
    }
}

/// One unit of work owned by a queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: String,
    /// Snapshot of the catalog record at enqueue time
    pub movie: Movie,
    pub status: ItemStatus,
    /// Human-readable progress text, mutated while the item runs
    pub progress: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Terminal outcome retained in the bounded history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub movie_title: String,
    pub movie_id: i64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub finished_at: DateTime<Utc>,
}

/// One pluggable operation executed by a queue worker.
///
/// Handlers are stateless aside from injected configuration and a catalog
/// client; status and progress flow back through the handle.
#[async_trait]
pub trait OperationHandler: Send + Sync {
    /// Short operation name used in logs
    fn name(&self) -> &'static str;

    async fn execute(&self, movie: &Movie, progress: &ProgressHandle) -> Result<(), OperationError>;
}

/// Handle a running handler uses to publish status transitions and progress
/// text for the item it is executing. Every update is persisted before it is
/// considered committed. Cloneable so callbacks handed to blocking tasks can
/// own one.
#[derive(Clone)]
pub struct ProgressHandle {
    shared: Arc<Shared>,
}

impl ProgressHandle {
    pub fn set_status(&self, status: ItemStatus) {
        let mut state = self.shared.state.lock().unwrap();
        if let Some(active) = state.active.as_mut() {
            active.status = status;
            active.updated_at = Utc::now();
        }
        self.shared.persist_queue(&state);
    }

    pub fn set_progress(&self, progress: impl Into<String>) {
        let mut state = self.shared.state.lock().unwrap();
        if let Some(active) = state.active.as_mut() {
            active.progress = progress.into();
            active.updated_at = Utc::now();
        }
        self.shared.persist_queue(&state);
    }
}

struct QueueState {
    pending: Vec<QueueItem>,
    active: Option<QueueItem>,
    history: Vec<HistoryEntry>,
}

struct Shared {
    name: String,
    queue_file: PathBuf,
    history_file: PathBuf,
    retention: usize,
    idle_poll_secs: u64,
    state: Mutex<QueueState>,
    worker_started: AtomicBool,
}

impl Shared {
    /// Persist the active list; failures are logged, not fatal to the worker.
    fn persist_queue(&self, state: &QueueState) {
        if let Err(e) = self.try_persist_queue(state) {
            error!("Queue {}: failed to persist queue file: {}", self.name, e);
        }
    }

    fn try_persist_queue(&self, state: &QueueState) -> Result<(), OperationError> {
        let mut items: Vec<&QueueItem> = Vec::with_capacity(state.pending.len() + 1);
        if let Some(active) = &state.active {
            items.push(active);
        }
        items.extend(state.pending.iter());
        write_json_atomic(&self.queue_file, &items)
    }

    fn persist_history(&self, state: &QueueState) {
        if let Err(e) = write_json_atomic(&self.history_file, &state.history) {
            error!("Queue {}: failed to persist history file: {}", self.name, e);
        }
    }
}

/// Atomic write: temp file in the same directory, then rename over the
/// target, so a crash never leaves a half-written state file.
fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), OperationError> {
    let data = serde_json::to_string_pretty(value)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, data)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Option<T>, OperationError> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path)?;
    let value = serde_json::from_str(&content)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    Ok(Some(value))
}

/// Generic persisted FIFO queue with a single background worker.
///
/// The worker holds at most one item active at a time; two independently
/// configured queues (copy, convert) may run concurrently with each other
/// but never with themselves.
pub struct OperationQueue {
    shared: Arc<Shared>,
    handler: Arc<dyn OperationHandler>,
}

impl OperationQueue {
    /// Load persisted state for the named queue and wire it to a handler.
    ///
    /// Items found on disk in a non-terminal active state were interrupted
    /// by a crash or restart: they are surfaced as failed history entries,
    /// never silently resumed.
    pub fn new(
        name: &str,
        config: &MoverConfig,
        handler: Arc<dyn OperationHandler>,
    ) -> Result<Self, OperationError> {
        let queue_file = config.queue_file(name);
        let history_file = config.history_file(name);
        if let Some(parent) = queue_file.parent() {
            fs::create_dir_all(parent)?;
        }

        let loaded: Vec<QueueItem> = read_json(&queue_file)?.unwrap_or_default();
        let mut history: Vec<HistoryEntry> = read_json(&history_file)?.unwrap_or_default();

        let mut pending = Vec::new();
        let mut recovered = 0usize;
        for item in loaded {
            if item.status == ItemStatus::Pending {
                pending.push(item);
            } else if item.status.is_active() {
                warn!(
                    "Queue {}: item for '{}' was {} at shutdown, marking failed for manual re-queue",
                    name,
                    item.movie.title,
                    item.status.as_str()
                );
                history.insert(
                    0,
                    HistoryEntry {
                        movie_title: item.movie.title.clone(),
                        movie_id: item.movie.id,
                        success: false,
                        error: Some(format!(
                            "interrupted by restart while {}",
                            item.status.as_str()
                        )),
                        finished_at: Utc::now(),
                    },
                );
                recovered += 1;
            } else {
                debug!(
                    "Queue {}: dropping persisted terminal item for '{}'",
                    name, item.movie.title
                );
            }
        }
        history.truncate(config.history_retention);

        let shared = Arc::new(Shared {
            name: name.to_string(),
            queue_file,
            history_file,
            retention: config.history_retention,
            idle_poll_secs: config.idle_poll_secs.max(1),
            state: Mutex::new(QueueState {
                pending,
                active: None,
                history,
            }),
            worker_started: AtomicBool::new(false),
        });

        {
            let state = shared.state.lock().unwrap();
            shared.try_persist_queue(&state)?;
            if recovered > 0 {
                write_json_atomic(&shared.history_file, &state.history)?;
                info!("Queue {}: {} interrupted item(s) moved to history", name, recovered);
            }
        }

        Ok(OperationQueue { shared, handler })
    }

    /// Append a pending item for the movie and persist the queue. Does not
    /// block on processing. A movie already pending or active is rejected.
    pub fn enqueue(&self, movie: Movie) -> Result<QueueItem, OperationError> {
        let mut state = self.shared.state.lock().unwrap();

        let already_queued = state.pending.iter().any(|i| i.movie.id == movie.id)
            || state
                .active
                .as_ref()
                .map(|a| a.movie.id == movie.id)
                .unwrap_or(false);
        if already_queued {
            return Err(OperationError::Validation(format!(
                "movie '{}' is already queued",
                movie.title
            )));
        }

        let now = Utc::now();
        let item = QueueItem {
            id: Uuid::new_v4().to_string(),
            movie,
            status: ItemStatus::Pending,
            progress: "Waiting in queue...".to_string(),
            error: None,
            created_at: now,
            updated_at: now,
        };
        state.pending.push(item.clone());
        self.shared.try_persist_queue(&state)?;
        info!(
            "Queue {}: enqueued '{}' as item {}",
            self.shared.name, item.movie.title, item.id
        );
        Ok(item)
    }

    /// Remove a pending item. Returns false (a no-op, not an error) when the
    /// item is unknown or already being processed.
    pub fn remove(&self, item_id: &str) -> bool {
        let mut state = self.shared.state.lock().unwrap();
        match state.pending.iter().position(|i| i.id == item_id) {
            Some(pos) => {
                let item = state.pending.remove(pos);
                self.shared.persist_queue(&state);
                info!(
                    "Queue {}: removed pending item {} ('{}')",
                    self.shared.name, item.id, item.movie.title
                );
                true
            }
            None => false,
        }
    }

    /// Emergency escape hatch: drop every pending item. An in-flight item is
    /// left to finish its current attempt; it ends up in history but is
    /// never re-persisted into the emptied list. History is untouched.
    pub fn clear_all(&self) -> usize {
        let mut state = self.shared.state.lock().unwrap();
        let count = state.pending.len();
        state.pending.clear();
        self.shared.persist_queue(&state);
        warn!(
            "Queue {}: forcefully cleared, removed {} pending item(s)",
            self.shared.name, count
        );
        count
    }

    /// Point-in-time view: the active item (if any) followed by pending items
    pub fn snapshot(&self) -> Vec<QueueItem> {
        let state = self.shared.state.lock().unwrap();
        let mut items = Vec::with_capacity(state.pending.len() + 1);
        if let Some(active) = &state.active {
            items.push(active.clone());
        }
        items.extend(state.pending.iter().cloned());
        items
    }

    /// Terminal outcomes, most recent first, bounded by the retention count
    pub fn history(&self) -> Vec<HistoryEntry> {
        self.shared.state.lock().unwrap().history.clone()
    }

    /// Start the single background worker. Idempotent.
    pub fn start_worker(&self) {
        if self.shared.worker_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let shared = Arc::clone(&self.shared);
        let handler = Arc::clone(&self.handler);
        tokio::spawn(async move {
            worker_loop(shared, handler).await;
        });
    }
}

async fn worker_loop(shared: Arc<Shared>, handler: Arc<dyn OperationHandler>) {
    info!("Queue {}: processor started ({})", shared.name, handler.name());

    loop {
        // Take the head pending item into the active slot. The lock is never
        // held across an await.
        let item = {
            let mut state = shared.state.lock().unwrap();
            if state.active.is_none() && !state.pending.is_empty() {
                let mut item = state.pending.remove(0);
                item.updated_at = Utc::now();
                state.active = Some(item.clone());
                shared.persist_queue(&state);
                Some(item)
            } else {
                None
            }
        };

        let Some(item) = item else {
            tokio::time::sleep(Duration::from_secs(shared.idle_poll_secs)).await;
            continue;
        };

        info!(
            "Queue {}: processing '{}' (item {})",
            shared.name, item.movie.title, item.id
        );

        let progress = ProgressHandle {
            shared: Arc::clone(&shared),
        };
        let result = handler.execute(&item.movie, &progress).await;

        let mut state = shared.state.lock().unwrap();
        let mut finished = state.active.take().unwrap_or(item);
        finished.updated_at = Utc::now();

        match result {
            Ok(()) => {
                info!(
                    "Queue {}: completed '{}' successfully",
                    shared.name, finished.movie.title
                );
                finished.status = ItemStatus::Completed;
                finished.progress = "Completed successfully".to_string();
                state.history.insert(
                    0,
                    HistoryEntry {
                        movie_title: finished.movie.title.clone(),
                        movie_id: finished.movie.id,
                        success: true,
                        error: None,
                        finished_at: finished.updated_at,
                    },
                );
            }
            Err(e) => {
                error!(
                    "Queue {}: operation failed for '{}': {}",
                    shared.name, finished.movie.title, e
                );
                finished.status = ItemStatus::Failed;
                finished.progress = format!("Error: {}", e);
                finished.error = Some(e.to_string());
                state.history.insert(
                    0,
                    HistoryEntry {
                        movie_title: finished.movie.title.clone(),
                        movie_id: finished.movie.id,
                        success: false,
                        error: finished.error.clone(),
                        finished_at: finished.updated_at,
                    },
                );
            }
        }

        state.history.truncate(shared.retention);
        shared.persist_queue(&state);
        shared.persist_history(&state);
        debug!(
            "Queue {}: {} item(s) remaining",
            shared.name,
            state.pending.len()
        );
        // Loop immediately: the next pending item (if any) starts right away.
    }
}
