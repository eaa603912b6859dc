use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use sharesync_core::frame::{PHASE2_TARGET_PAYLOAD, Phase2Batcher};
use sharesync_core::{Phase1Op, Phase2Message, Ticket, TicketPurpose};
use tokio::io::AsyncReadExt;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{
    Session, Tracking, TransferRecord, TransferStatus, WorkerContext, WorkerLink,
    check_phase1_reply,
};
use crate::sync::error::{ErrorKind, SyncError};
use crate::sync::events::{Direction, TransferProgress};
use crate::sync::local::{self, LocalError};
use crate::sync::messages::{Message, OrderId, UploadEvent, WorkerControl};
use crate::sync::ops::{OpKind, ServerOp};
use crate::sync::paths::{local_path, split_parent};
use crate::sync::share::Share;
use crate::sync::tree::LocalStatus;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadTarget {
    Create,
    Update { inode: u64, base_commit_id: u64 },
}

#[derive(Debug, Clone)]
pub struct UploadItem {
    pub record: TransferRecord,
    pub target: UploadTarget,
    pub staged: PathBuf,
    pub hash: String,
    /// Server inode, known up front for updates and from phase 1 for creates.
    pub inode: Option<u64>,
}

#[derive(Debug)]
pub struct UploadManager {
    pub session: Session,
    pub items: BTreeMap<OrderId, UploadItem>,
    /// Commit id of the batch in flight, from its phase-1 reply.
    pub commit_id: Option<u64>,
}

impl Default for UploadManager {
    fn default() -> Self {
        Self {
            session: Session::new(TicketPurpose::Upload),
            items: BTreeMap::new(),
            commit_id: None,
        }
    }
}

#[derive(Debug, Clone)]
struct PlannedUpload {
    order_id: OrderId,
    op: Phase1Op,
    staged: PathBuf,
    hash: String,
    known_inode: Option<u64>,
}

enum WorkerStop {
    Cancelled,
    Failed(String),
}

async fn release_staging(path: &Path) {
    if let Err(err) = tokio::fs::remove_file(path).await
        && err.kind() != std::io::ErrorKind::NotFound
    {
        warn!(path = %path.display(), "could not release staged upload: {err}");
    }
}

impl Share {
    /// Snapshots a local file into the staging area and queues it for upload.
    pub(crate) async fn enqueue_upload(&mut self, path: &str) -> Result<OrderId, SyncError> {
        let target = match self.tree.lookup(path).and_then(|inode| self.tree.get(inode)) {
            Some(object) if object.is_dir() => {
                return Err(SyncError::IllegalOperation(format!(
                    "{path} is a directory on the server"
                )));
            }
            Some(object) => {
                let file = object.as_file().ok_or(SyncError::StaleView)?;
                match &file.current_version {
                    Some(current) => UploadTarget::Update {
                        inode: object.inode,
                        base_commit_id: current.commit_id,
                    },
                    None if !file.uploaders.is_empty() => {
                        return Err(SyncError::InTransfer(path.to_string()));
                    }
                    None => UploadTarget::Create,
                }
            }
            None => UploadTarget::Create,
        };
        let tracking = match &target {
            UploadTarget::Update { inode, .. } => Tracking::of_object(*inode),
            UploadTarget::Create => Tracking::for_path(&self.tree, path),
        };

        let order_id = self.transfers.next_order_id();
        self.transfers.files.insert(&self.tree, order_id, tracking.clone())?;

        let source = local_path(&self.config.share_root, path);
        let staging_dir = self.config.staging_dir();
        let staged = staging_dir.join(order_id.to_string());
        let staged_copy = staged.clone();
        let snapshot = tokio::task::spawn_blocking(move || -> Result<(u64, String), LocalError> {
            std::fs::create_dir_all(&staging_dir).map_err(|err| LocalError::io(&staging_dir, err))?;
            let size = std::fs::copy(&source, &staged_copy).map_err(|err| LocalError::io(&source, err))?;
            Ok((size, local::hash_file(&staged_copy)?))
        })
        .await
        .map_err(|err| LocalError::Worker(err.to_string()))
        .and_then(|result| result);
        let (size, hash) = match snapshot {
            Ok(snapshot) => snapshot,
            Err(err) => {
                self.transfers.files.remove(order_id);
                release_staging(&staged).await;
                return Err(err.into());
            }
        };

        debug!(order_id, path = %path, size, "upload queued");
        let inode = match &target {
            UploadTarget::Update { inode, .. } => Some(*inode),
            UploadTarget::Create => None,
        };
        self.transfers.upload.items.insert(
            order_id,
            UploadItem {
                record: TransferRecord::new(order_id, tracking, size),
                target,
                staged,
                hash,
                inode,
            },
        );
        Ok(order_id)
    }

    /// Phase-1 descriptor for a queued item, or `None` while a queued
    /// metadata request has yet to create its parent directory.
    fn upload_descriptor(&self, item: &UploadItem) -> Option<Result<Phase1Op, String>> {
        let Some(path) = item.record.tracking.resolve(&self.tree) else {
            return Some(Err("the target was deleted on the server".to_string()));
        };
        match &item.target {
            UploadTarget::Create => {
                let (parent, name) = split_parent(&path);
                let Some(parent_inode) = self.tree.lookup(parent) else {
                    if self.transfers.metadata.creates_dir(parent) {
                        return None;
                    }
                    return Some(Err(format!("{parent} does not exist on the server")));
                };
                if !self.tree.is_dir(parent_inode) {
                    return Some(Err(format!("{parent} is not a directory on the server")));
                }
                Some(Ok(Phase1Op::CreateFile {
                    parent_inode,
                    name: name.to_string(),
                    size: item.record.total,
                    hash: item.hash.clone(),
                }))
            }
            UploadTarget::Update {
                inode,
                base_commit_id,
            } => {
                if !self.tree.contains(*inode) {
                    return Some(Err(format!("{path} was deleted on the server")));
                }
                Some(Ok(Phase1Op::UpdateFile {
                    inode: *inode,
                    commit_id: *base_commit_id,
                    size: item.record.total,
                    hash: item.hash.clone(),
                }))
            }
        }
    }

    pub(crate) fn uploads_ready(&self) -> bool {
        self.transfers
            .upload
            .items
            .values()
            .filter(|item| item.record.status == TransferStatus::Queued)
            .any(|item| matches!(self.upload_descriptor(item), Some(Ok(_))))
    }

    /// Fails queued uploads that can no longer be placed on the server.
    pub(crate) fn fail_unplaceable_uploads(&mut self) {
        let broken: Vec<(OrderId, String)> = self
            .transfers
            .upload
            .items
            .values()
            .filter(|item| item.record.status == TransferStatus::Queued)
            .filter_map(|item| match self.upload_descriptor(item) {
                Some(Err(reason)) => Some((item.record.order_id, reason)),
                _ => None,
            })
            .collect();
        for (order_id, reason) in broken {
            debug!(order_id, "dropping upload: {reason}");
            self.fail_upload_later(order_id, ErrorKind::IllegalOperation, reason);
        }
    }

    pub(crate) fn start_upload_batch(&mut self) {
        self.fail_unplaceable_uploads();
        let mut plan = Vec::new();
        for item in self.transfers.upload.items.values() {
            if item.record.status != TransferStatus::Queued {
                continue;
            }
            if let Some(Ok(op)) = self.upload_descriptor(item) {
                plan.push(PlannedUpload {
                    order_id: item.record.order_id,
                    op,
                    staged: item.staged.clone(),
                    hash: item.hash.clone(),
                    known_inode: item.inode,
                });
            }
        }
        if plan.is_empty() {
            return;
        }
        let Some((ticket, link)) = self.transfers.upload.session.begin_batch() else {
            return;
        };
        for planned in &plan {
            if let Some(item) = self.transfers.upload.items.get_mut(&planned.order_id) {
                item.record.status = TransferStatus::Batched;
            }
        }
        self.transfers.upload.commit_id = None;
        info!(batch_id = link.batch_id, files = plan.len(), "upload batch started");
        let ctx = self.worker_context();
        tokio::spawn(run_upload_batch(ctx, ticket, plan, link));
    }

    fn fail_upload_later(&mut self, order_id: OrderId, kind: ErrorKind, reason: String) {
        let Some(item) = self.transfers.upload.items.remove(&order_id) else {
            return;
        };
        self.transfers.files.remove(order_id);
        let path = item.record.tracking.resolve(&self.tree).unwrap_or_default();
        self.report_transfer_failure(order_id, path, kind, reason);
        let staged = item.staged;
        tokio::spawn(async move { release_staging(&staged).await });
    }

    async fn fail_upload(&mut self, order_id: OrderId, kind: ErrorKind, reason: &str) {
        let Some(item) = self.transfers.upload.items.remove(&order_id) else {
            return;
        };
        self.transfers.files.remove(order_id);
        release_staging(&item.staged).await;
        let path = item.record.tracking.resolve(&self.tree).unwrap_or_default();
        self.report_transfer_failure(order_id, path, kind, reason.to_string());
    }

    pub(crate) async fn fail_uploads(&mut self, kind: ErrorKind, reason: &str) {
        let failed: Vec<OrderId> = self.transfers.upload.items.keys().copied().collect();
        for order_id in failed {
            self.fail_upload(order_id, kind, reason).await;
        }
        self.transfers.upload.commit_id = None;
    }

    pub(crate) async fn cancel_upload(&mut self, order_id: OrderId) -> bool {
        let Some(item) = self.transfers.upload.items.get_mut(&order_id) else {
            return false;
        };
        match item.record.status {
            TransferStatus::Queued => {
                self.fail_upload(order_id, ErrorKind::Cancelled, "cancelled").await;
            }
            TransferStatus::Batched => {
                item.record.status = TransferStatus::CancelPending;
                if !self
                    .transfers
                    .upload
                    .session
                    .post_control(WorkerControl::CancelItem(order_id))
                {
                    self.fail_upload(order_id, ErrorKind::Cancelled, "cancelled").await;
                }
            }
            // Already handed to the server; the commit decides.
            TransferStatus::Transferred | TransferStatus::CancelPending => return false,
        }
        true
    }

    pub(crate) async fn on_upload_event(&mut self, event: UploadEvent) {
        match event {
            UploadEvent::Phase1Done {
                batch_id,
                commit_id,
                results,
            } => {
                if !self.transfers.upload.session.is_current(batch_id) {
                    return;
                }
                debug!(batch_id, commit_id, "upload phase 1 accepted");
                self.transfers.upload.commit_id = Some(commit_id);
                for (order_id, result) in results {
                    if !result.accepted {
                        let reason = result
                            .reason
                            .unwrap_or_else(|| "rejected by the server".to_string());
                        self.fail_upload(order_id, ErrorKind::ServerRejected, &reason)
                            .await;
                        continue;
                    }
                    if let Some(item) = self.transfers.upload.items.get_mut(&order_id)
                        && item.inode.is_none()
                    {
                        item.inode = result.inode;
                    }
                }
            }
            UploadEvent::Progress {
                batch_id,
                order_id,
                bytes_done,
            } => {
                if !self.transfers.upload.session.is_current(batch_id) {
                    return;
                }
                let Some(item) = self.transfers.upload.items.get_mut(&order_id) else {
                    return;
                };
                item.record.bytes_done = bytes_done;
                let progress = TransferProgress {
                    order_id,
                    direction: Direction::Upload,
                    path: item.record.tracking.resolve(&self.tree).unwrap_or_default(),
                    bytes_done,
                    total: item.record.total,
                };
                self.observer.transfer_progress_changed(&progress);
            }
            UploadEvent::FileAborted { batch_id, order_id } => {
                if self.transfers.upload.session.is_current(batch_id) {
                    debug!(batch_id, order_id, "upload aborted");
                    self.fail_upload(order_id, ErrorKind::Cancelled, "cancelled").await;
                }
            }
            UploadEvent::FileSent { batch_id, order_id } => {
                if !self.transfers.upload.session.is_current(batch_id) {
                    return;
                }
                if let Some(item) = self.transfers.upload.items.get_mut(&order_id) {
                    item.record.status = TransferStatus::Transferred;
                    item.record.bytes_done = item.record.total;
                }
            }
            UploadEvent::BatchSent { batch_id } => {
                if !self.transfers.upload.session.is_current(batch_id) {
                    return;
                }
                let sent = self
                    .transfers
                    .upload
                    .items
                    .values()
                    .any(|item| item.record.status == TransferStatus::Transferred);
                match self.transfers.upload.commit_id {
                    Some(commit_id) if sent => {
                        info!(batch_id, commit_id, "upload batch sent, waiting for server echo");
                        let deadline = Instant::now() + self.config.tuning.upload_echo_timeout;
                        self.transfers.upload.session.wait_for_echo(commit_id, deadline);
                    }
                    _ => {
                        info!(batch_id, "upload batch finished without content");
                        self.transfers.upload.session.end_batch();
                    }
                }
            }
            UploadEvent::BatchFailed { batch_id, reason } => {
                if !self.transfers.upload.session.is_current(batch_id) {
                    return;
                }
                warn!(batch_id, "upload batch failed: {reason}");
                self.fail_manager(TicketPurpose::Upload, ErrorKind::Generic, reason)
                    .await;
            }
            UploadEvent::BatchCancelled { batch_id } => {
                if !self.transfers.upload.session.is_current(batch_id) {
                    return;
                }
                info!(batch_id, "upload batch cancelled");
                let batched: Vec<OrderId> = self
                    .transfers
                    .upload
                    .items
                    .values()
                    .filter(|item| item.record.status != TransferStatus::Queued)
                    .map(|item| item.record.order_id)
                    .collect();
                for order_id in batched {
                    self.fail_upload(order_id, ErrorKind::Cancelled, "cancelled").await;
                }
                self.transfers.upload.session.end_batch();
            }
        }
    }

    /// Called once a server operation has been applied to the tree. A
    /// phase-2 commit from us for the batch we wait on completes it.
    pub(crate) async fn upload_echo(&mut self, op: &ServerOp) {
        let OpKind::Phase2Commit { files } = &op.kind else {
            return;
        };
        if op.header.user_id != self.config.user_id
            || self.transfers.upload.session.echo_commit() != Some(op.header.commit_id)
        {
            return;
        }
        let committed: HashSet<u64> = files.iter().map(|entry| entry.inode).collect();
        let sent: Vec<(OrderId, Option<u64>)> = self
            .transfers
            .upload
            .items
            .values()
            .filter(|item| item.record.status == TransferStatus::Transferred)
            .map(|item| (item.record.order_id, item.inode))
            .collect();
        for (order_id, inode) in sent {
            let Some(inode) = inode.filter(|inode| committed.contains(inode)) else {
                self.fail_upload(order_id, ErrorKind::Generic, "the server did not commit the file")
                    .await;
                continue;
            };
            if let Some(item) = self.transfers.upload.items.remove(&order_id) {
                self.transfers.files.remove(order_id);
                release_staging(&item.staged).await;
            }
            if let Some(file) = self.tree.file_mut(inode) {
                file.download_version = file.current_version.clone();
                file.transient_status = LocalStatus::None;
            }
            self.local_update.dirty.insert(inode);
            info!(order_id, inode, "upload confirmed by the server");
        }
        self.transfers.upload.commit_id = None;
        self.transfers.upload.session.end_batch();
        self.ui.view_stale = true;
    }
}

async fn run_upload_batch(
    ctx: WorkerContext,
    ticket: Ticket,
    plan: Vec<PlannedUpload>,
    mut link: WorkerLink,
) {
    let batch_id = link.batch_id;
    let event = match upload_batch(&ctx, &ticket, &plan, &mut link).await {
        Ok(()) => UploadEvent::BatchSent { batch_id },
        Err(WorkerStop::Cancelled) => UploadEvent::BatchCancelled { batch_id },
        Err(WorkerStop::Failed(reason)) => UploadEvent::BatchFailed { batch_id, reason },
    };
    ctx.post(Message::Upload(event)).await;
}

/// Collects pending per-item cancellations and checks the batch token.
fn poll_control(link: &mut WorkerLink, cancelled: &mut HashSet<OrderId>) -> Result<(), WorkerStop> {
    if link.cancel.is_cancelled() {
        return Err(WorkerStop::Cancelled);
    }
    while let Ok(WorkerControl::CancelItem(order_id)) = link.control.try_recv() {
        cancelled.insert(order_id);
    }
    Ok(())
}

async fn flush_phase2(
    ctx: &WorkerContext,
    ticket: &Ticket,
    batcher: &mut Phase2Batcher,
    link: &mut WorkerLink,
    cancelled: &mut HashSet<OrderId>,
) -> Result<(), WorkerStop> {
    if batcher.is_empty() {
        return Ok(());
    }
    poll_control(link, cancelled)?;
    let messages = batcher.take();
    ctx.transport
        .send_phase2(ticket, &messages)
        .await
        .map_err(|err| WorkerStop::Failed(err.reason()))
}

async fn upload_batch(
    ctx: &WorkerContext,
    ticket: &Ticket,
    plan: &[PlannedUpload],
    link: &mut WorkerLink,
) -> Result<(), WorkerStop> {
    let batch_id = link.batch_id;
    let mut cancelled = HashSet::new();
    poll_control(link, &mut cancelled)?;

    let ops: Vec<Phase1Op> = plan.iter().map(|p| p.op.clone()).collect();
    let reply = ctx
        .transport
        .submit_phase1(ticket, &ops)
        .await
        .map_err(|err| WorkerStop::Failed(err.reason()))?;
    check_phase1_reply(&reply, ops.len()).map_err(WorkerStop::Failed)?;
    let accepted: Vec<(&PlannedUpload, Option<u64>)> = plan
        .iter()
        .zip(&reply.results)
        .filter(|(_, result)| result.accepted)
        .map(|(planned, result)| (planned, planned.known_inode.or(result.inode)))
        .collect();
    ctx.post(Message::Upload(UploadEvent::Phase1Done {
        batch_id,
        commit_id: reply.commit_id,
        results: plan
            .iter()
            .map(|p| p.order_id)
            .zip(reply.results.iter().cloned())
            .collect(),
    }))
    .await;

    let mut batcher = Phase2Batcher::new();
    let mut buffer = vec![0u8; PHASE2_TARGET_PAYLOAD];
    for (planned, inode) in accepted {
        let Some(inode) = inode else {
            return Err(WorkerStop::Failed(format!(
                "server assigned no inode to upload {}",
                planned.order_id
            )));
        };
        let mut file = tokio::fs::File::open(&planned.staged)
            .await
            .map_err(|err| WorkerStop::Failed(format!("staged upload missing: {err}")))?;
        let mut sent = 0u64;
        let mut aborted = false;
        loop {
            poll_control(link, &mut cancelled)?;
            if cancelled.contains(&planned.order_id) {
                batcher.push(Phase2Message::Abort { inode });
                aborted = true;
                break;
            }
            let mut budget = batcher.chunk_budget();
            if budget == 0 {
                flush_phase2(ctx, ticket, &mut batcher, link, &mut cancelled).await?;
                budget = batcher.chunk_budget();
            }
            let want = budget.min(buffer.len());
            let read = file
                .read(&mut buffer[..want])
                .await
                .map_err(|err| WorkerStop::Failed(err.to_string()))?;
            if read == 0 {
                break;
            }
            batcher.push(Phase2Message::Chunk {
                inode,
                data: buffer[..read].to_vec(),
            });
            sent += read as u64;
            ctx.post(Message::Upload(UploadEvent::Progress {
                batch_id,
                order_id: planned.order_id,
                bytes_done: sent,
            }))
            .await;
            if batcher.is_full() {
                flush_phase2(ctx, ticket, &mut batcher, link, &mut cancelled).await?;
            }
        }
        let event = if aborted {
            UploadEvent::FileAborted {
                batch_id,
                order_id: planned.order_id,
            }
        } else {
            batcher.push(Phase2Message::Commit {
                inode,
                hash: planned.hash.clone(),
            });
            UploadEvent::FileSent {
                batch_id,
                order_id: planned.order_id,
            }
        };
        ctx.post(Message::Upload(event)).await;
    }
    flush_phase2(ctx, ticket, &mut batcher, link, &mut cancelled).await
}
