use std::collections::{BTreeMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use futures_util::StreamExt;
use sharesync_core::{DownloadMessage, DownloadRequest, Ticket, TicketPurpose};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{Session, Tracking, TransferRecord, TransferStatus, WorkerContext, WorkerLink};
use crate::sync::error::{ErrorKind, SyncError};
use crate::sync::events::{Direction, TransferProgress};
use crate::sync::local::{self, LocalError};
use crate::sync::messages::{BatchId, DownloadEvent, Message, OrderId, WorkerControl};
use crate::sync::paths::local_path;
use crate::sync::reconcile::PathStatus;
use crate::sync::share::Share;
use crate::sync::store::FileCacheRecord;
use crate::sync::tree::{FileVersion, LocalCache, LocalStatus};

#[derive(Debug, Clone)]
pub struct DownloadItem {
    pub record: TransferRecord,
    pub version: FileVersion,
    /// Overwrite the local copy even if it was modified.
    pub forced: bool,
    pub cache_path: PathBuf,
}

#[derive(Debug)]
pub struct DownloadManager {
    pub session: Session,
    pub items: BTreeMap<OrderId, DownloadItem>,
    /// Automatic queuing is suspended until then after a failed batch.
    pub retry_after: Option<Instant>,
    /// (inode, commit id) pairs the user cancelled; not queued again
    /// automatically.
    pub declined: HashSet<(u64, u64)>,
    prune_due: bool,
}

impl Default for DownloadManager {
    fn default() -> Self {
        Self {
            session: Session::new(TicketPurpose::Download),
            items: BTreeMap::new(),
            retry_after: None,
            declined: HashSet::new(),
            prune_due: true,
        }
    }
}

impl DownloadManager {
    pub fn has_queued(&self) -> bool {
        self.items
            .values()
            .any(|item| item.record.status == TransferStatus::Queued)
    }

    pub fn find_inode(&self, inode: u64) -> Option<OrderId> {
        self.items
            .values()
            .find(|item| item.version.inode == inode)
            .map(|item| item.record.order_id)
    }
}

/// Cache file for one version of one file; partial content is resumed.
pub fn cache_file_name(inode: u64, commit_id: u64) -> String {
    format!("{inode}-{commit_id}")
}

#[derive(Debug, Clone)]
struct PlannedDownload {
    order_id: OrderId,
    request: DownloadRequest,
    cache_path: PathBuf,
}

enum WorkerStop {
    Cancelled,
    Failed(String),
}

impl Share {
    /// Queues the current version of a server file for download.
    pub(crate) fn enqueue_download(&mut self, inode: u64, forced: bool) -> Result<OrderId, SyncError> {
        let path = self
            .tree
            .path_of(inode)
            .ok_or(SyncError::StaleView)?;
        let version = self
            .tree
            .file(inode)
            .and_then(|file| file.current_version.clone())
            .ok_or_else(|| SyncError::IllegalOperation(format!("{path} has no content yet")))?;
        let order_id = self.transfers.next_order_id();
        self.transfers
            .files
            .insert(&self.tree, order_id, Tracking::of_object(inode))?;
        let cache_path = self
            .config
            .cache_dir()
            .join(cache_file_name(inode, version.commit_id));
        debug!(order_id, inode, path = %path, "download queued");
        self.transfers.download.items.insert(
            order_id,
            DownloadItem {
                record: TransferRecord::new(order_id, Tracking::of_object(inode), version.size),
                version,
                forced,
                cache_path,
            },
        );
        Ok(order_id)
    }

    /// Queues files the status view reports as missing or outdated locally.
    pub(crate) fn queue_stale_downloads(&mut self, now: Instant) {
        if !self.scan.scanned {
            return;
        }
        if let Some(after) = self.transfers.download.retry_after {
            if now < after {
                self.wake_at(after);
                return;
            }
            self.transfers.download.retry_after = None;
        }
        let candidates: Vec<(String, u64)> = self
            .view
            .iter()
            .filter(|entry| {
                matches!(
                    entry.status,
                    PathStatus::NotDownloaded | PathStatus::UnmodifiedStale
                )
            })
            .filter_map(|entry| entry.server_inode.map(|inode| (entry.path.clone(), inode)))
            .collect();
        for (path, inode) in candidates {
            let Some(commit_id) = self
                .tree
                .file(inode)
                .and_then(|file| file.current_version.as_ref())
                .map(|version| version.commit_id)
            else {
                continue;
            };
            if self.transfers.download.declined.contains(&(inode, commit_id))
                || self.transfers.files.is_busy(&self.tree, &path)
            {
                continue;
            }
            if let Err(err) = self.enqueue_download(inode, false) {
                debug!(path = %path, "not queuing download: {err}");
            }
        }
    }

    pub(crate) async fn start_download_batch(&mut self) {
        let queued: Vec<(OrderId, u64, u64, PathBuf)> = self
            .transfers
            .download
            .items
            .values()
            .filter(|item| item.record.status == TransferStatus::Queued)
            .map(|item| {
                (
                    item.record.order_id,
                    item.version.inode,
                    item.version.commit_id,
                    item.cache_path.clone(),
                )
            })
            .collect();
        if queued.is_empty() {
            return;
        }
        let mut plan = Vec::with_capacity(queued.len());
        for (order_id, inode, commit_id, cache_path) in queued {
            let offset = match tokio::fs::metadata(&cache_path).await {
                Ok(metadata) => metadata.len(),
                Err(_) => 0,
            };
            plan.push(PlannedDownload {
                order_id,
                request: DownloadRequest {
                    inode,
                    commit_id,
                    offset,
                },
                cache_path,
            });
        }
        let Some((ticket, link)) = self.transfers.download.session.begin_batch() else {
            return;
        };
        for planned in &plan {
            if let Some(item) = self.transfers.download.items.get_mut(&planned.order_id) {
                item.record.status = TransferStatus::Batched;
                item.record.bytes_done = planned.request.offset;
            }
        }
        info!(batch_id = link.batch_id, files = plan.len(), "download batch started");
        let ctx = self.worker_context();
        let cache_dir = self.config.cache_dir();
        tokio::spawn(run_download_batch(ctx, ticket, cache_dir, plan, link));
    }

    pub(crate) async fn on_download_event(&mut self, event: DownloadEvent) {
        match event {
            DownloadEvent::Progress {
                batch_id,
                order_id,
                bytes_done,
            } => {
                if !self.transfers.download.session.is_current(batch_id) {
                    return;
                }
                let Some(item) = self.transfers.download.items.get_mut(&order_id) else {
                    return;
                };
                item.record.bytes_done = bytes_done;
                let progress = TransferProgress {
                    order_id,
                    direction: Direction::Download,
                    path: item.record.tracking.resolve(&self.tree).unwrap_or_default(),
                    bytes_done,
                    total: item.record.total,
                };
                self.observer.transfer_progress_changed(&progress);
            }
            DownloadEvent::FileDone {
                batch_id,
                order_id,
                cache_path,
            } => {
                if !self.transfers.download.session.is_current(batch_id) {
                    return;
                }
                if let Some(item) = self.transfers.download.items.get_mut(&order_id)
                    && item.record.status == TransferStatus::Batched
                {
                    item.record.status = TransferStatus::Transferred;
                    item.record.bytes_done = item.record.total;
                    item.cache_path = cache_path;
                }
            }
            DownloadEvent::CancelAck {
                batch_id,
                order_id,
                cached_bytes,
            } => {
                debug!(batch_id, order_id, cached_bytes, "download cancel acknowledged");
                self.forget_download(order_id);
            }
            DownloadEvent::BatchDone { batch_id } => {
                if !self.transfers.download.session.is_current(batch_id) {
                    return;
                }
                info!(batch_id, "download batch finished");
                self.transfers.download.session.end_batch();
                self.transfers.download.prune_due = true;
                let unfinished: Vec<(OrderId, TransferStatus)> = self
                    .transfers
                    .download
                    .items
                    .values()
                    .filter(|item| {
                        matches!(
                            item.record.status,
                            TransferStatus::Batched | TransferStatus::CancelPending
                        )
                    })
                    .map(|item| (item.record.order_id, item.record.status))
                    .collect();
                for (order_id, status) in unfinished {
                    if status == TransferStatus::CancelPending {
                        self.forget_download(order_id);
                        continue;
                    }
                    self.fail_download(
                        order_id,
                        ErrorKind::Generic,
                        "the server did not send the file",
                    );
                }
            }
            DownloadEvent::BatchFailed { batch_id, reason } => {
                if !self.transfers.download.session.is_current(batch_id) {
                    return;
                }
                warn!(batch_id, "download batch failed: {reason}");
                self.transfers.download.prune_due = true;
                self.transfers.download.retry_after =
                    Some(Instant::now() + self.config.tuning.scan_retry_delay);
                self.fail_manager(TicketPurpose::Download, ErrorKind::Generic, reason)
                    .await;
            }
            DownloadEvent::BatchCancelled { batch_id } => {
                if !self.transfers.download.session.is_current(batch_id) {
                    return;
                }
                info!(batch_id, "download batch cancelled");
                self.transfers.download.session.end_batch();
                for item in self.transfers.download.items.values_mut() {
                    if item.record.status == TransferStatus::Batched {
                        item.record.status = TransferStatus::Queued;
                    }
                }
                let cancelled: Vec<OrderId> = self
                    .transfers
                    .download
                    .items
                    .values()
                    .filter(|item| item.record.status == TransferStatus::CancelPending)
                    .map(|item| item.record.order_id)
                    .collect();
                for order_id in cancelled {
                    self.forget_download(order_id);
                }
            }
        }
    }

    /// Removes a queued download, or asks the worker to drop a batched one.
    pub(crate) fn cancel_download(&mut self, order_id: OrderId) -> bool {
        let Some(item) = self.transfers.download.items.get_mut(&order_id) else {
            return false;
        };
        let version = (item.version.inode, item.version.commit_id);
        self.transfers.download.declined.insert(version);
        match item.record.status {
            TransferStatus::Queued | TransferStatus::Transferred => {
                self.forget_download(order_id);
            }
            TransferStatus::Batched => {
                item.record.status = TransferStatus::CancelPending;
                if !self
                    .transfers
                    .download
                    .session
                    .post_control(WorkerControl::CancelItem(order_id))
                {
                    self.forget_download(order_id);
                }
            }
            TransferStatus::CancelPending => {}
        }
        true
    }

    fn forget_download(&mut self, order_id: OrderId) {
        self.transfers.download.items.remove(&order_id);
        self.transfers.files.remove(order_id);
    }

    fn fail_download(&mut self, order_id: OrderId, kind: ErrorKind, reason: &str) {
        let path = self
            .transfers
            .download
            .items
            .get(&order_id)
            .and_then(|item| item.record.tracking.resolve(&self.tree))
            .unwrap_or_default();
        self.forget_download(order_id);
        self.report_transfer_failure(order_id, path, kind, reason.to_string());
    }

    pub(crate) fn fail_downloads(&mut self, kind: ErrorKind, reason: &str) {
        let failed: Vec<OrderId> = self
            .transfers
            .download
            .items
            .values()
            .filter(|item| item.record.status != TransferStatus::Transferred)
            .map(|item| item.record.order_id)
            .collect();
        for order_id in failed {
            self.fail_download(order_id, kind, reason);
        }
    }

    /// Moves finished downloads from the cache into the share.
    pub(crate) async fn drain_downloads(&mut self) {
        let done: Vec<OrderId> = self
            .transfers
            .download
            .items
            .values()
            .filter(|item| item.record.status == TransferStatus::Transferred)
            .map(|item| item.record.order_id)
            .collect();
        for order_id in done {
            let Some(item) = self.transfers.download.items.get(&order_id).cloned() else {
                continue;
            };
            let Some(path) = item.record.tracking.resolve(&self.tree) else {
                debug!(order_id, "downloaded file no longer exists on the server");
                self.forget_download(order_id);
                continue;
            };
            if let Err(err) = self.check_download_destination(&path, &item) {
                self.fail_download(order_id, err.kind(), &err.to_string());
                continue;
            }
            match self.install_download(&path, &item).await {
                Ok(()) => {
                    info!(order_id, path = %path, "download installed");
                    self.forget_download(order_id);
                    self.ui.view_stale = true;
                }
                Err(err) => {
                    warn!(order_id, path = %path, "could not install download: {err}");
                    self.fail_download(order_id, err.kind(), &err.to_string());
                }
            }
        }
    }

    fn check_download_destination(&self, path: &str, item: &DownloadItem) -> Result<(), SyncError> {
        let Some(entry) = self.local.get(path) else {
            return Ok(());
        };
        if entry.is_dir {
            return Err(SyncError::IllegalOperation(format!(
                "a local directory is in the way of {path}"
            )));
        }
        if item.forced {
            return Ok(());
        }
        let file = self.tree.file(item.version.inode);
        let verified = file.is_some_and(|file| {
            file.comparison_status() == LocalStatus::Unmodified
                && file.local_cache.as_ref().is_some_and(|cache| {
                    cache.size == entry.size
                        && cache.mtime == entry.mtime
                        && cache.local_id == entry.local_id
                })
        });
        if verified {
            Ok(())
        } else {
            Err(SyncError::IllegalOperation(format!(
                "{path} was modified locally and was not overwritten"
            )))
        }
    }

    async fn install_download(&mut self, path: &str, item: &DownloadItem) -> Result<(), SyncError> {
        let target = local_path(&self.config.share_root, path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        move_file(&item.cache_path, &target).await?;
        let entry = local::stat(&self.config.share_root, path)?
            .ok_or_else(|| LocalError::io(&target, io::Error::from(io::ErrorKind::NotFound)))?;
        let inode = item.version.inode;
        if let Some(file) = self.tree.file_mut(inode) {
            file.download_version = Some(item.version.clone());
            file.transient_status = LocalStatus::Unmodified;
            file.local_cache = Some(LocalCache {
                size: entry.size,
                mtime: entry.mtime,
                local_id: entry.local_id,
                hash: item.version.hash.clone(),
            });
            let record = FileCacheRecord::from_file(file);
            self.store.save_file_cache(inode, &record).await?;
        }
        self.local.insert(entry);
        Ok(())
    }

    /// Trims the download cache below its ceiling, oldest files first, never
    /// while a batch may still be writing into it. Partial files of queued
    /// downloads are kept.
    pub(crate) async fn prune_download_cache(&mut self) {
        if !self.transfers.download.prune_due || self.transfers.download.session.in_batch() {
            return;
        }
        self.transfers.download.prune_due = false;
        let cache_dir = self.config.cache_dir();
        let mut files = match cached_files(&cache_dir).await {
            Ok(files) => files,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return,
            Err(err) => {
                warn!("could not measure download cache: {err}");
                return;
            }
        };
        let ceiling = self.config.download_cache_max_bytes;
        let mut size: u64 = files.iter().map(|file| file.size).sum();
        if size <= ceiling {
            return;
        }
        info!(size, ceiling, "download cache over its ceiling, pruning");
        let in_use: HashSet<&Path> = self
            .transfers
            .download
            .items
            .values()
            .map(|item| item.cache_path.as_path())
            .collect();
        files.sort_by_key(|file| file.modified);
        for file in &files {
            if size <= ceiling {
                break;
            }
            if in_use.contains(file.path.as_path()) {
                continue;
            }
            match tokio::fs::remove_file(&file.path).await {
                Ok(()) => size = size.saturating_sub(file.size),
                Err(err) => warn!(path = %file.path.display(), "could not prune cached download: {err}"),
            }
        }
    }
}

struct CachedFile {
    path: PathBuf,
    size: u64,
    modified: SystemTime,
}

async fn cached_files(dir: &Path) -> io::Result<Vec<CachedFile>> {
    let mut files = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let metadata = entry.metadata().await?;
        if metadata.is_file() {
            files.push(CachedFile {
                path: entry.path(),
                size: metadata.len(),
                modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            });
        }
    }
    Ok(files)
}

async fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    match tokio::fs::rename(from, to).await {
        Ok(()) => Ok(()),
        Err(_) => {
            // The cache may live on another filesystem.
            tokio::fs::copy(from, to).await?;
            tokio::fs::remove_file(from).await
        }
    }
}

async fn run_download_batch(
    ctx: WorkerContext,
    ticket: Ticket,
    cache_dir: PathBuf,
    plan: Vec<PlannedDownload>,
    mut link: WorkerLink,
) {
    let batch_id = link.batch_id;
    let event = match download_batch(&ctx, &ticket, &cache_dir, &plan, &mut link).await {
        Ok(()) => DownloadEvent::BatchDone { batch_id },
        Err(WorkerStop::Cancelled) => DownloadEvent::BatchCancelled { batch_id },
        Err(WorkerStop::Failed(reason)) => DownloadEvent::BatchFailed { batch_id, reason },
    };
    ctx.post(Message::Download(event)).await;
}

struct CurrentFile {
    order_id: OrderId,
    cache_path: PathBuf,
    file: Option<tokio::fs::File>,
    written: u64,
    remaining: u64,
}

async fn download_batch(
    ctx: &WorkerContext,
    ticket: &Ticket,
    cache_dir: &Path,
    plan: &[PlannedDownload],
    link: &mut WorkerLink,
) -> Result<(), WorkerStop> {
    let batch_id = link.batch_id;
    tokio::fs::create_dir_all(cache_dir)
        .await
        .map_err(|err| WorkerStop::Failed(format!("cannot create download cache: {err}")))?;
    let requests: Vec<DownloadRequest> = plan.iter().map(|p| p.request.clone()).collect();
    let mut stream = tokio::select! {
        biased;
        _ = link.cancel.cancelled() => return Err(WorkerStop::Cancelled),
        opened = ctx.transport.open_download(ticket, &requests) => {
            opened.map_err(|err| WorkerStop::Failed(err.reason()))?
        }
    };

    let mut pending: Vec<&PlannedDownload> = plan.iter().collect();
    let mut cancelled: HashSet<OrderId> = HashSet::new();
    let mut current: Option<CurrentFile> = None;

    loop {
        let message = tokio::select! {
            biased;
            _ = link.cancel.cancelled() => return Err(WorkerStop::Cancelled),
            Some(WorkerControl::CancelItem(order_id)) = link.control.recv() => {
                cancelled.insert(order_id);
                let cached_bytes = match current.as_mut() {
                    Some(cur) if cur.order_id == order_id => {
                        if let Some(mut file) = cur.file.take() {
                            file.flush().await.map_err(|err| WorkerStop::Failed(err.to_string()))?;
                        }
                        cur.written
                    }
                    _ => pending
                        .iter()
                        .find(|p| p.order_id == order_id)
                        .map(|p| p.request.offset)
                        .unwrap_or_default(),
                };
                ctx.post(Message::Download(DownloadEvent::CancelAck {
                    batch_id,
                    order_id,
                    cached_bytes,
                }))
                .await;
                continue;
            }
            next = stream.next() => next,
        };
        let Some(message) = message else {
            break;
        };
        match message.map_err(|err| WorkerStop::Failed(err.reason()))? {
            DownloadMessage::File {
                inode,
                total_size,
                remaining,
            } => {
                if current.as_ref().is_some_and(|cur| cur.remaining > 0) {
                    return Err(WorkerStop::Failed("file announced before the previous one ended".into()));
                }
                let index = pending
                    .iter()
                    .position(|p| p.request.inode == inode)
                    .ok_or_else(|| WorkerStop::Failed(format!("unexpected file {inode} in stream")))?;
                let planned = pending.remove(index);
                let already = total_size.saturating_sub(remaining);
                let mut cur = CurrentFile {
                    order_id: planned.order_id,
                    cache_path: planned.cache_path.clone(),
                    file: None,
                    written: already,
                    remaining,
                };
                if !cancelled.contains(&planned.order_id) {
                    let file = open_cache_file(&planned.cache_path, already)
                        .await
                        .map_err(|err| WorkerStop::Failed(format!("download cache: {err}")))?;
                    cur.file = Some(file);
                }
                if remaining == 0 {
                    finish_file(ctx, batch_id, &mut cur).await?;
                    current = None;
                } else {
                    current = Some(cur);
                }
            }
            DownloadMessage::Chunk(bytes) => {
                let cur = current
                    .as_mut()
                    .ok_or_else(|| WorkerStop::Failed("content chunk outside of a file".into()))?;
                let len = bytes.len() as u64;
                if len > cur.remaining {
                    return Err(WorkerStop::Failed("server sent more bytes than announced".into()));
                }
                cur.remaining -= len;
                if let Some(file) = cur.file.as_mut() {
                    file.write_all(&bytes)
                        .await
                        .map_err(|err| WorkerStop::Failed(err.to_string()))?;
                    file.flush()
                        .await
                        .map_err(|err| WorkerStop::Failed(err.to_string()))?;
                    cur.written += len;
                    ctx.post(Message::Download(DownloadEvent::Progress {
                        batch_id,
                        order_id: cur.order_id,
                        bytes_done: cur.written,
                    }))
                    .await;
                }
                if cur.remaining == 0 {
                    finish_file(ctx, batch_id, cur).await?;
                    current = None;
                }
            }
        }
    }

    if current.is_some_and(|cur| cur.remaining > 0) {
        return Err(WorkerStop::Failed("download stream ended mid-file".into()));
    }
    Ok(())
}

async fn open_cache_file(path: &Path, expected_len: u64) -> io::Result<tokio::fs::File> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    let len = file.metadata().await?.len();
    if len > expected_len {
        file.set_len(expected_len).await?;
    } else if len < expected_len {
        return Err(io::Error::other(format!(
            "cached {len} bytes but the server resumed at {expected_len}"
        )));
    }
    Ok(file)
}

async fn finish_file(
    ctx: &WorkerContext,
    batch_id: BatchId,
    cur: &mut CurrentFile,
) -> Result<(), WorkerStop> {
    let Some(mut file) = cur.file.take() else {
        return Ok(());
    };
    file.flush()
        .await
        .map_err(|err| WorkerStop::Failed(err.to_string()))?;
    file.sync_all()
        .await
        .map_err(|err| WorkerStop::Failed(err.to_string()))?;
    ctx.post(Message::Download(DownloadEvent::FileDone {
        batch_id,
        order_id: cur.order_id,
        cache_path: cur.cache_path.clone(),
    }))
    .await;
    Ok(())
}
