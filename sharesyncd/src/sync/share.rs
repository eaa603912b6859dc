//! The share context: every piece of state the orchestrator owns, and the
//! inbox dispatch that applies worker and collaborator messages to it.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use sharesync_core::{ServerEvent, ShareTransport};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::config::ShareConfig;
use super::error::SyncError;
use super::events::{AllowedOps, ShareObserver};
use super::local::{self, LocalEntry, LocalError, LocalTree, MARKER_PREFIX};
use super::messages::{Message, ScanResult};
use super::ops::ServerOp;
use super::paths::{is_within, local_path};
use super::reconcile::StatusView;
use super::store::StateStore;
use super::transfer::Transfers;
use super::tree::{ROOT_INODE, ServerTree};

#[derive(Debug, Default)]
pub struct Health {
    pub active: bool,
    /// The event poller has delivered everything the server had.
    pub caught_up: bool,
    pub permanent_failure: Option<String>,
    pub allowed: AllowedOps,
    /// A filesystem watcher is delivering events for the share root.
    pub watching: bool,
}

#[derive(Debug, Default)]
pub struct ScanState {
    pub scanned: bool,
    pub in_flight: bool,
    pub failures: u32,
    pub retry_at: Option<Instant>,
    pub last_scan_at: Option<Instant>,
    /// Paths reported by the watcher since the last partial scan.
    pub stale_paths: BTreeSet<String>,
    pub last_fs_event_at: Option<Instant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingMarker {
    pub id: u64,
    pub deadline: Instant,
    pub observed: bool,
}

#[derive(Debug)]
pub struct ServerOpQueue {
    pub pending: VecDeque<ServerOp>,
    pub next_op_id: u64,
    pub last_event_id: Option<u64>,
    /// Operations are applied in bursts once this passes.
    pub ready_at: Option<Instant>,
    pub blocked_until: Option<Instant>,
    pub marker: Option<PendingMarker>,
    pub next_marker_id: u64,
}

impl Default for ServerOpQueue {
    fn default() -> Self {
        Self {
            pending: VecDeque::new(),
            next_op_id: 1,
            last_event_id: None,
            ready_at: None,
            blocked_until: None,
            marker: None,
            next_marker_id: 1,
        }
    }
}

#[derive(Debug, Default)]
pub struct LocalUpdateState {
    /// Files whose comparison status must be recomputed.
    pub dirty: BTreeSet<u64>,
    pub retry_at: BTreeMap<u64, Instant>,
}

#[derive(Debug, Default)]
pub struct UiState {
    pub view_stale: bool,
    pub notify_pending: bool,
    pub last_refresh: Option<Instant>,
}

#[derive(Debug, Default)]
pub struct PipelineState {
    pub running: bool,
    /// Set for the duration of one pass; stages skip their delays.
    pub sync: bool,
    /// Requested full synchronization, consumed at the next Entry stage.
    pub full_sync: bool,
    /// Another pass is due at this instant.
    pub wake: Option<Instant>,
}

#[derive(Debug, Default)]
pub struct Gate {
    pub depth: u32,
    pub label_edit: bool,
}

pub struct Share {
    pub(crate) config: ShareConfig,
    pub(crate) transport: Arc<dyn ShareTransport>,
    pub(crate) store: StateStore,
    pub(crate) observer: Arc<dyn ShareObserver>,
    pub(crate) inbox: mpsc::Sender<Message>,
    pub(crate) tree: ServerTree,
    pub(crate) local: LocalTree,
    pub(crate) view: StatusView,
    pub(crate) health: Health,
    pub(crate) scan: ScanState,
    pub(crate) server_ops: ServerOpQueue,
    pub(crate) local_update: LocalUpdateState,
    pub(crate) ui: UiState,
    pub(crate) pipeline: PipelineState,
    pub(crate) gate: Gate,
    pub(crate) transfers: Transfers,
}

impl Share {
    pub fn new(
        config: ShareConfig,
        transport: Arc<dyn ShareTransport>,
        store: StateStore,
        observer: Arc<dyn ShareObserver>,
        inbox: mpsc::Sender<Message>,
    ) -> Self {
        Self {
            config,
            transport,
            store,
            observer,
            inbox,
            tree: ServerTree::new(),
            local: LocalTree::new(),
            view: StatusView::default(),
            health: Health::default(),
            scan: ScanState::default(),
            server_ops: ServerOpQueue::default(),
            local_update: LocalUpdateState::default(),
            ui: UiState::default(),
            pipeline: PipelineState::default(),
            gate: Gate::default(),
            transfers: Transfers::default(),
        }
    }

    pub fn config(&self) -> &ShareConfig {
        &self.config
    }

    pub fn tree(&self) -> &ServerTree {
        &self.tree
    }

    pub fn status_view(&self) -> &StatusView {
        &self.view
    }

    pub fn allowed_operations(&self) -> AllowedOps {
        self.health.allowed
    }

    pub fn is_active(&self) -> bool {
        self.health.active
    }

    pub fn set_watching(&mut self, watching: bool) {
        self.health.watching = watching;
    }

    /// Prepares private directories and the state store, then lets the
    /// pipeline start.
    pub async fn activate(&mut self) -> Result<(), SyncError> {
        self.store.init().await?;
        let staging = self.config.staging_dir();
        match tokio::fs::remove_dir_all(&staging).await {
            Ok(()) => debug!(path = %staging.display(), "dropped leftover staged uploads"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(LocalError::io(&staging, err).into()),
        }
        tokio::fs::create_dir_all(&staging)
            .await
            .map_err(|err| LocalError::io(&staging, err))?;
        tokio::fs::create_dir_all(&self.config.share_root)
            .await
            .map_err(|err| LocalError::io(&self.config.share_root, err))?;
        if let Some(expanded) = self.store.load_expanded(ROOT_INODE).await? {
            self.tree.set_expanded(ROOT_INODE, expanded);
        }
        self.health.active = true;
        self.pipeline.full_sync = true;
        info!(root = %self.config.share_root.display(), "share activated");
        Ok(())
    }

    /// Stops every batch worker; the share stays inert afterwards.
    pub fn deactivate(&mut self) {
        self.transfers.cancel_all();
        self.health.active = false;
        info!("share deactivated");
    }

    /// Applies one inbox message. Never runs the pipeline itself.
    pub async fn handle(&mut self, message: Message) {
        match message {
            Message::ScanCompleted(ScanResult::Full(result)) => self.on_full_scan(result),
            Message::ScanCompleted(ScanResult::Partial(result)) => self.on_partial_scan(result),
            Message::FsChanged { path } => self.mark_stale(path),
            Message::FsRenamed { from, to } => {
                self.mark_stale(from);
                self.mark_stale(to);
            }
            Message::MarkerObserved { marker_id } => self.on_marker_observed(marker_id).await,
            Message::WatcherFailed { reason } => {
                warn!("filesystem watcher failed, falling back to a full scan: {reason}");
                self.health.watching = false;
                self.scan.scanned = false;
                self.pipeline.full_sync = true;
            }
            Message::ServerEvents { events, caught_up } => {
                self.enqueue_server_events(events, caught_up)
            }
            Message::TicketReply { purpose, result } => {
                self.on_ticket_reply(purpose, result).await
            }
            Message::Download(event) => self.on_download_event(event).await,
            Message::Upload(event) => self.on_upload_event(event).await,
            Message::Metadata(event) => self.on_metadata_event(event).await,
            Message::Run { full_sync } => {
                if full_sync {
                    self.pipeline.full_sync = true;
                }
            }
        }
    }

    pub(crate) fn start_full_scan(&mut self) {
        let now = Instant::now();
        self.scan.in_flight = true;
        self.scan.last_scan_at = Some(now);
        self.scan.stale_paths.clear();
        debug!(root = %self.config.share_root.display(), "full scan started");
        let root = self.config.share_root.clone();
        let inbox = self.inbox.clone();
        tokio::spawn(async move {
            let result = tokio::task::spawn_blocking(move || local::scan(&root))
                .await
                .unwrap_or_else(|err| Err(LocalError::Worker(err.to_string())));
            let _ = inbox
                .send(Message::ScanCompleted(ScanResult::Full(result)))
                .await;
        });
    }

    pub(crate) fn start_partial_scan(&mut self, paths: Vec<String>) {
        self.scan.in_flight = true;
        self.scan.last_scan_at = Some(Instant::now());
        debug!(paths = paths.len(), "partial scan started");
        let root = self.config.share_root.clone();
        let inbox = self.inbox.clone();
        tokio::spawn(async move {
            let result = tokio::task::spawn_blocking(move || {
                paths
                    .into_iter()
                    .map(|path| {
                        let entries = local::scan_subtree(&root, &path)?;
                        Ok((path, entries))
                    })
                    .collect::<Result<Vec<(String, Vec<LocalEntry>)>, LocalError>>()
            })
            .await
            .unwrap_or_else(|err| Err(LocalError::Worker(err.to_string())));
            let _ = inbox
                .send(Message::ScanCompleted(ScanResult::Partial(result)))
                .await;
        });
    }

    fn on_full_scan(&mut self, result: Result<LocalTree, LocalError>) {
        self.scan.in_flight = false;
        match result {
            Ok(tree) => {
                info!(entries = tree.len(), "full scan finished");
                self.local = tree;
                self.scan.scanned = true;
                self.scan.failures = 0;
                self.scan.retry_at = None;
                let files: Vec<u64> = self.tree.files().map(|(inode, _)| inode).collect();
                self.local_update.dirty.extend(files);
                self.ui.view_stale = true;
            }
            Err(err) => {
                self.scan.failures += 1;
                let retry_at = Instant::now() + self.config.tuning.scan_retry_delay;
                self.scan.retry_at = Some(retry_at);
                warn!(failures = self.scan.failures, "full scan failed: {err}");
            }
        }
    }

    fn on_partial_scan(&mut self, result: Result<Vec<(String, Vec<LocalEntry>)>, LocalError>) {
        self.scan.in_flight = false;
        match result {
            Ok(subtrees) => {
                for (path, entries) in subtrees {
                    debug!(path = %path, entries = entries.len(), "partial scan applied");
                    self.local.replace_subtree(&path, entries);
                    self.mark_subtree_dirty(&path);
                }
                self.ui.view_stale = true;
            }
            Err(err) => {
                warn!("partial scan failed, scheduling a full scan: {err}");
                self.scan.scanned = false;
            }
        }
    }

    /// Schedules a file comparison for every server file at or below `path`.
    pub(crate) fn mark_subtree_dirty(&mut self, path: &str) {
        let dirty: Vec<u64> = self
            .tree
            .walk()
            .into_iter()
            .filter(|(candidate, inode)| is_within(path, candidate) && self.tree.file(*inode).is_some())
            .map(|(_, inode)| inode)
            .collect();
        self.local_update.dirty.extend(dirty);
    }

    /// Records a path the watcher reported; a partial scan will pick it up.
    pub(crate) fn mark_stale(&mut self, path: String) {
        if path.rsplit('/').next().is_some_and(local::is_marker) {
            return;
        }
        self.scan.last_fs_event_at = Some(Instant::now());
        // Drop paths already covered by a stale ancestor.
        if self
            .scan
            .stale_paths
            .iter()
            .any(|stale| is_within(stale, &path))
        {
            return;
        }
        self.scan.stale_paths.retain(|stale| !is_within(&path, stale));
        self.scan.stale_paths.insert(path);
    }

    pub(crate) async fn place_marker(&mut self) {
        let id = self.server_ops.next_marker_id;
        self.server_ops.next_marker_id += 1;
        let name = format!("{MARKER_PREFIX}{id}");
        let path = local_path(&self.config.share_root, &name);
        if let Err(err) = tokio::fs::write(&path, b"").await {
            warn!(path = %path.display(), "could not place watcher marker: {err}");
            return;
        }
        debug!(marker_id = id, "watcher marker placed");
        self.server_ops.marker = Some(PendingMarker {
            id,
            deadline: Instant::now() + self.config.tuning.marker_timeout,
            observed: false,
        });
    }

    async fn on_marker_observed(&mut self, marker_id: u64) {
        if let Some(marker) = self.server_ops.marker.as_mut()
            && marker.id == marker_id
        {
            marker.observed = true;
        }
        let name = format!("{MARKER_PREFIX}{marker_id}");
        let path = local_path(&self.config.share_root, &name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(path = %path.display(), "could not remove watcher marker: {err}"),
        }
    }

    fn enqueue_server_events(&mut self, events: Vec<ServerEvent>, caught_up: bool) {
        let mut queued = 0usize;
        for event in events {
            if self
                .server_ops
                .last_event_id
                .is_some_and(|last| event.event_id <= last)
            {
                continue;
            }
            self.server_ops.last_event_id = Some(event.event_id);
            let op_id = self.server_ops.next_op_id;
            self.server_ops.next_op_id += 1;
            self.server_ops
                .pending
                .push_back(ServerOp::from_event(op_id, event));
            queued += 1;
        }
        if queued > 0 {
            debug!(queued, caught_up, "server operations queued");
            self.server_ops.ready_at = Some(Instant::now() + self.config.tuning.server_op_delay);
        }
        if caught_up && !self.health.caught_up {
            info!("caught up with the server event log");
        }
        self.health.caught_up = caught_up;
    }

    /// Marks the share permanently failed. Nothing is applied afterwards.
    pub(crate) fn fail_permanently(&mut self, reason: String) {
        warn!("share failed permanently: {reason}");
        self.server_ops.pending.clear();
        self.transfers.cancel_all();
        self.observer.share_failed(&reason);
        self.health.permanent_failure = Some(reason);
    }
}

#[cfg(test)]
#[path = "share_tests.rs"]
mod tests;
