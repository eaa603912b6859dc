//! The stage loop. One pass walks Entry through Exit; a stage either lets
//! the pass continue or stalls it, optionally leaving a wake-up deadline.

use std::collections::BTreeSet;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use super::error::SyncError;
use super::events::AllowedOps;
use super::local::{self, LocalError};
use super::ops::{FsOutcome, OpKind, ServerOp};
use super::paths::{join, local_path};
use super::reconcile::reconcile;
use super::share::Share;
use super::store::FileCacheRecord;
use super::transfer::ManagerState;
use super::tree::{LocalCache, LocalStatus};

/// Passes allowed in one run before the loop yields to the caller.
const MAX_PASSES: u32 = 64;
const OVERRUN_BACKOFF: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Entry,
    InitialScan,
    ServerOp,
    PartialScan,
    Transfer,
    LocalUpdate,
    Ui,
    Exit,
}

impl Stage {
    const CYCLE: [Stage; 8] = [
        Stage::Entry,
        Stage::InitialScan,
        Stage::ServerOp,
        Stage::PartialScan,
        Stage::Transfer,
        Stage::LocalUpdate,
        Stage::Ui,
        Stage::Exit,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StageAction {
    Pass,
    Stall,
}

impl Share {
    /// Keeps the earliest requested wake-up of the current pass.
    pub(crate) fn wake_at(&mut self, at: Instant) {
        self.pipeline.wake = Some(match self.pipeline.wake {
            Some(current) => current.min(at),
            None => at,
        });
    }

    /// Runs passes until one stalls or finishes with nothing due. Returns
    /// when the next pass should start, if ever.
    pub async fn run_pipeline(&mut self) -> Option<Instant> {
        if self.pipeline.running {
            return self.pipeline.wake;
        }
        self.pipeline.running = true;
        let mut passes = 0;
        let next = loop {
            self.pipeline.wake = None;
            let stalled_at = self.run_pass().await;
            passes += 1;
            let now = Instant::now();
            let due = self.pipeline.wake.is_some_and(|wake| wake <= now);
            if !due {
                trace!(?stalled_at, wake = ?self.pipeline.wake, "pipeline idle");
                break self.pipeline.wake;
            }
            if passes >= MAX_PASSES {
                warn!(passes, "pipeline keeps rescheduling itself, yielding");
                break Some(now + OVERRUN_BACKOFF);
            }
        };
        self.pipeline.running = false;
        next
    }

    async fn run_pass(&mut self) -> Option<Stage> {
        let now = Instant::now();
        let mut stalled_at = None;
        for stage in Stage::CYCLE {
            let action = match stage {
                Stage::Entry => self.entry_stage(),
                Stage::InitialScan => self.initial_scan_stage(now),
                Stage::ServerOp => self.server_op_stage(now).await,
                Stage::PartialScan => self.partial_scan_stage(now),
                Stage::Transfer => {
                    self.transfer_stage(now).await;
                    StageAction::Pass
                }
                Stage::LocalUpdate => self.local_update_stage(now).await,
                Stage::Ui => self.ui_stage(now),
                Stage::Exit => StageAction::Pass,
            };
            if action == StageAction::Stall {
                stalled_at = Some(stage);
                break;
            }
        }
        self.pipeline.sync = false;
        stalled_at
    }

    fn entry_stage(&mut self) -> StageAction {
        if self.gate.depth > 0 {
            return StageAction::Stall;
        }
        if std::mem::take(&mut self.pipeline.full_sync) {
            self.pipeline.sync = true;
        }
        self.update_allowed();
        StageAction::Pass
    }

    fn compute_allowed(&self) -> AllowedOps {
        if !self.health.active || !self.scan.scanned || self.health.permanent_failure.is_some() {
            return AllowedOps::None;
        }
        let metadata_busy = matches!(
            self.transfers.metadata.session.state,
            ManagerState::Batch { .. } | ManagerState::WaitForServerEcho { .. }
        );
        if metadata_busy || self.ui.view_stale || self.view.type_conflict {
            AllowedOps::DownloadOnly
        } else {
            AllowedOps::All
        }
    }

    /// Recomputes the allowed-operations level; true when it changed.
    pub(crate) fn update_allowed(&mut self) -> bool {
        let allowed = self.compute_allowed();
        if allowed == self.health.allowed {
            return false;
        }
        debug!(from = ?self.health.allowed, to = ?allowed, "allowed operations changed");
        self.health.allowed = allowed;
        self.observer.allowed_operations_changed(allowed);
        self.ui.notify_pending = true;
        true
    }

    fn initial_scan_stage(&mut self, now: Instant) -> StageAction {
        if self.scan.scanned || !self.health.active || !self.health.caught_up {
            return StageAction::Pass;
        }
        if self.scan.in_flight {
            return StageAction::Stall;
        }
        if let Some(retry_at) = self.scan.retry_at
            && now < retry_at
            && !self.pipeline.sync
        {
            self.wake_at(retry_at);
            return StageAction::Stall;
        }
        self.start_full_scan();
        StageAction::Stall
    }

    async fn server_op_stage(&mut self, now: Instant) -> StageAction {
        if let Some(marker) = self.server_ops.marker {
            if !marker.observed && now < marker.deadline {
                self.wake_at(marker.deadline);
                return StageAction::Stall;
            }
            if !marker.observed {
                debug!(marker_id = marker.id, "watcher marker timed out");
            }
            self.server_ops.marker = None;
        }
        if self.server_ops.pending.is_empty() || self.health.permanent_failure.is_some() {
            return StageAction::Pass;
        }
        if let Some(until) = self.server_ops.blocked_until {
            if now < until && !self.pipeline.sync {
                self.wake_at(until);
                return StageAction::Pass;
            }
            self.server_ops.blocked_until = None;
        }
        if !self.pipeline.sync
            && let Some(ready_at) = self.server_ops.ready_at
            && now < ready_at
        {
            self.wake_at(ready_at);
            return StageAction::Pass;
        }

        let root = self.config.share_root.clone();
        while let Some(op) = self.server_ops.pending.pop_front() {
            if let Err(err) = op.validate(&self.tree) {
                self.fail_permanently(format!(
                    "server operation {} ({}) does not fit the tree: {err}",
                    op.header.op_id,
                    op.name()
                ));
                break;
            }
            let outcome = match op.apply_to_filesystem_once(&root, &self.tree, &self.store).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    warn!(op_id = op.header.op_id, "could not record applied operation: {err}");
                    self.block_server_op(op, now);
                    return StageAction::Pass;
                }
            };
            if let FsOutcome::Blocked(action) = &outcome {
                warn!(op_id = op.header.op_id, path = action.path(), "server operation blocked locally");
                self.observer.action_required(action);
                self.block_server_op(op, now);
                return StageAction::Pass;
            }

            let affected = self.paths_affected_by(&op);
            let removed = match &op.kind {
                OpKind::Delete { inode } => self.tree.subtree(*inode),
                _ => Vec::new(),
            };
            trace!(op_id = op.header.op_id, op = op.name(), "applying server operation");
            op.apply_to_tree(&mut self.tree);
            self.after_op_applied(&op, &removed).await;
            for path in affected {
                self.mark_stale(path);
            }

            if outcome.touched() && self.health.watching {
                self.place_marker().await;
                if let Some(marker) = self.server_ops.marker {
                    self.wake_at(marker.deadline);
                    return StageAction::Stall;
                }
            }
        }
        StageAction::Pass
    }

    fn block_server_op(&mut self, op: ServerOp, now: Instant) {
        self.server_ops.pending.push_front(op);
        let until = now + self.config.tuning.blocked_op_retry_delay;
        self.server_ops.blocked_until = Some(until);
        self.wake_at(until);
    }

    /// Local paths whose on-disk state may change with `op`, computed
    /// against the tree before it is applied.
    fn paths_affected_by(&self, op: &ServerOp) -> Vec<String> {
        match &op.kind {
            OpKind::Create {
                parent_inode,
                name,
                is_dir: true,
                ..
            } => self
                .tree
                .path_of(*parent_inode)
                .map(|parent| vec![join(&parent, name)])
                .unwrap_or_default(),
            OpKind::Delete { inode } => self.tree.path_of(*inode).into_iter().collect(),
            OpKind::Move {
                inode,
                new_parent_inode,
                new_name,
            } => {
                let mut paths: Vec<String> = self.tree.path_of(*inode).into_iter().collect();
                if let Some(parent) = self.tree.path_of(*new_parent_inode) {
                    paths.push(join(&parent, new_name));
                }
                paths
            }
            OpKind::Create { .. } | OpKind::Update { .. } | OpKind::Phase2Commit { .. } => {
                Vec::new()
            }
        }
    }

    async fn after_op_applied(&mut self, op: &ServerOp, removed: &[u64]) {
        match &op.kind {
            OpKind::Create { inode, is_dir, .. } => {
                if *is_dir {
                    match self.store.load_expanded(*inode).await {
                        Ok(Some(expanded)) => {
                            self.tree.set_expanded(*inode, expanded);
                        }
                        Ok(None) => {}
                        Err(err) => warn!(inode, "could not restore directory state: {err}"),
                    }
                } else {
                    match self.store.load_file_cache(*inode).await {
                        Ok(Some(record)) => {
                            if let Some(file) = self.tree.file_mut(*inode) {
                                record.restore_into(file);
                            }
                        }
                        Ok(None) => {}
                        Err(err) => warn!(inode, "could not restore file cache: {err}"),
                    }
                    self.local_update.dirty.insert(*inode);
                }
            }
            OpKind::Delete { .. } => {
                for inode in removed {
                    self.local_update.dirty.remove(inode);
                    self.local_update.retry_at.remove(inode);
                    if let Err(err) = self.store.delete_file_cache(*inode).await {
                        warn!(inode, "could not drop file cache: {err}");
                    }
                    if let Err(err) = self.store.delete_dir_state(*inode).await {
                        warn!(inode, "could not drop directory state: {err}");
                    }
                }
            }
            OpKind::Phase2Commit { files } => {
                self.local_update
                    .dirty
                    .extend(files.iter().map(|entry| entry.inode));
                self.upload_echo(op).await;
            }
            OpKind::Update { .. } | OpKind::Move { .. } => {}
        }
        self.metadata_echo(op);
        self.ui.view_stale = true;
    }

    fn partial_scan_stage(&mut self, now: Instant) -> StageAction {
        if self.scan.stale_paths.is_empty() || !self.scan.scanned || self.scan.in_flight {
            return StageAction::Pass;
        }
        if !self.pipeline.sync {
            let tuning = self.config.tuning;
            let quiet_until = self
                .scan
                .last_fs_event_at
                .map(|at| at + tuning.partial_scan_quiet);
            let spaced_until = self
                .scan
                .last_scan_at
                .map(|at| at + tuning.min_scan_interval);
            if let Some(due) = quiet_until.max(spaced_until)
                && now < due
            {
                self.wake_at(due);
                return StageAction::Pass;
            }
        }
        let paths: Vec<String> = std::mem::take(&mut self.scan.stale_paths)
            .into_iter()
            .collect();
        self.start_partial_scan(paths);
        StageAction::Pass
    }

    async fn local_update_stage(&mut self, now: Instant) -> StageAction {
        if !self.scan.scanned || self.local_update.dirty.is_empty() {
            return StageAction::Pass;
        }
        let dirty = std::mem::take(&mut self.local_update.dirty);
        let mut deferred = BTreeSet::new();
        for inode in dirty {
            if let Some(&retry_at) = self.local_update.retry_at.get(&inode) {
                if now < retry_at && !self.pipeline.sync {
                    deferred.insert(inode);
                    self.wake_at(retry_at);
                    continue;
                }
                self.local_update.retry_at.remove(&inode);
            }
            match self.refresh_local_status(inode).await {
                Ok(true) => self.ui.view_stale = true,
                Ok(false) => {}
                Err(err) => {
                    warn!(inode, "could not compare local file: {err}");
                    if let Some(file) = self.tree.file_mut(inode) {
                        file.transient_status = LocalStatus::Error;
                    }
                    let retry_at = now + self.config.tuning.local_retry_delay;
                    self.local_update.retry_at.insert(inode, retry_at);
                    deferred.insert(inode);
                    self.wake_at(retry_at);
                    self.ui.view_stale = true;
                }
            }
        }
        self.local_update.dirty.extend(deferred);
        StageAction::Pass
    }

    /// Recomputes one file's local comparison status; true when it changed.
    async fn refresh_local_status(&mut self, inode: u64) -> Result<bool, SyncError> {
        let Some(path) = self.tree.path_of(inode) else {
            return Ok(false);
        };
        let Some(file) = self.tree.file(inode) else {
            return Ok(false);
        };
        let previous = file.comparison_status();
        let download_version = file.download_version.clone();
        let current_version = file.current_version.clone();
        let cached = file.local_cache.clone();

        let entry = self.local.get(&path).filter(|entry| !entry.is_dir).cloned();
        let Some(entry) = entry else {
            let Some(file) = self.tree.file_mut(inode) else {
                return Ok(false);
            };
            file.transient_status = LocalStatus::Absent;
            return Ok(previous != LocalStatus::Absent);
        };

        let reusable = cached.filter(|cache| {
            cache.size == entry.size
                && cache.mtime == entry.mtime
                && cache.local_id == entry.local_id
                && !self.config.always_rehash(&path)
        });
        let hash = match reusable {
            Some(cache) => cache.hash,
            None => {
                let target = local_path(&self.config.share_root, &path);
                tokio::task::spawn_blocking(move || local::hash_file(&target))
                    .await
                    .map_err(|err| LocalError::Worker(err.to_string()))??
            }
        };

        // A local copy matching the server content counts as downloaded.
        let adopted = match &current_version {
            Some(current)
                if current.hash == hash
                    && download_version
                        .as_ref()
                        .is_none_or(|downloaded| downloaded.hash != hash) =>
            {
                Some(current.clone())
            }
            _ => None,
        };
        let Some(file) = self.tree.file_mut(inode) else {
            return Ok(false);
        };
        let adopted_any = adopted.is_some();
        if let Some(version) = adopted {
            debug!(inode, path = %path, "local copy matches the server version");
            file.download_version = Some(version);
        }
        let status = local::compare(file.download_version.as_ref(), &hash);
        file.transient_status = status;
        file.local_cache = Some(LocalCache {
            size: entry.size,
            mtime: entry.mtime,
            local_id: entry.local_id,
            hash,
        });
        let record = FileCacheRecord::from_file(file);
        self.store.save_file_cache(inode, &record).await?;
        Ok(status != previous || adopted_any)
    }

    fn ui_stage(&mut self, now: Instant) -> StageAction {
        if self.ui.view_stale {
            let due = self
                .ui
                .last_refresh
                .map(|at| at + self.config.tuning.ui_refresh_interval)
                .filter(|due| *due > now);
            match due {
                Some(due) if !self.pipeline.sync => self.wake_at(due),
                _ => self.refresh_view(now),
            }
        }
        if self.update_allowed() {
            self.wake_at(now);
        }
        if std::mem::take(&mut self.ui.notify_pending) {
            self.observer.status_view_changed(&self.view);
        }
        StageAction::Pass
    }

    /// Rebuilds the status view from the server and local trees.
    pub(crate) fn refresh_view(&mut self, now: Instant) {
        let view = reconcile(&self.tree, &self.local);
        let before = self.local_update.dirty.len();
        self.local_update.dirty.extend(view.recheck.iter().copied());
        if self.local_update.dirty.len() != before && self.scan.scanned {
            self.wake_at(now);
        }
        if view != self.view {
            if view.type_conflict && !self.view.type_conflict {
                info!("type conflict in the share, uploads are suspended");
            }
            self.view = view;
            self.ui.notify_pending = true;
            // The transfer stage of this pass ran on the old view.
            self.wake_at(now);
        }
        self.ui.view_stale = false;
        self.ui.last_refresh = Some(now);
    }
}
