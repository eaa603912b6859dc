//! Ticketed batch transfers: shared bookkeeping for the download, upload and
//! metadata managers, and the pipeline's Transfer stage.

pub mod download;
pub mod metadata;
pub mod upload;

use std::collections::BTreeMap;
use std::sync::Arc;

use sharesync_core::{Phase1Reply, RemoteError, ShareTransport, Ticket, TicketPurpose};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::error::{ErrorKind, SyncError};
use super::events::{AllowedOps, TransferFailure};
use super::messages::{BatchId, Message, OrderId, WorkerControl};
use super::paths::{is_within, join};
use super::share::Share;
use super::tree::ServerTree;

use download::DownloadManager;
use metadata::MetadataManager;
use upload::UploadManager;

const CONTROL_CAPACITY: usize = 64;

/// Reference to a transfer target that survives renames of its ancestors:
/// an existing server object plus the not-yet-existing remainder below it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tracking {
    pub inode: u64,
    pub suffix: String,
}

impl Tracking {
    pub fn of_object(inode: u64) -> Self {
        Self {
            inode,
            suffix: String::new(),
        }
    }

    /// Anchors `path` at its deepest existing server object.
    pub fn for_path(tree: &ServerTree, path: &str) -> Self {
        let parts: Vec<&str> = path.split('/').filter(|part| !part.is_empty()).collect();
        let mut inode = super::tree::ROOT_INODE;
        let mut consumed = 0;
        for part in &parts {
            match tree.child(inode, part) {
                Some(child) => {
                    inode = child;
                    consumed += 1;
                }
                None => break,
            }
        }
        Self {
            inode,
            suffix: parts[consumed..].join("/"),
        }
    }

    pub fn resolve(&self, tree: &ServerTree) -> Option<String> {
        let base = tree.path_of(self.inode)?;
        if self.suffix.is_empty() {
            Some(base)
        } else {
            Some(join(&base, &self.suffix))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Queued,
    Batched,
    Transferred,
    CancelPending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRecord {
    pub order_id: OrderId,
    pub tracking: Tracking,
    pub status: TransferStatus,
    pub bytes_done: u64,
    pub total: u64,
    pub error: Option<String>,
}

impl TransferRecord {
    pub fn new(order_id: OrderId, tracking: Tracking, total: u64) -> Self {
        Self {
            order_id,
            tracking,
            status: TransferStatus::Queued,
            bytes_done: 0,
            total,
            error: None,
        }
    }
}

/// Every content transfer in flight, keyed by order id. At most one per
/// target path.
#[derive(Debug, Default)]
pub struct FileTransferTree {
    entries: BTreeMap<OrderId, Tracking>,
}

impl FileTransferTree {
    pub fn insert(
        &mut self,
        tree: &ServerTree,
        order_id: OrderId,
        tracking: Tracking,
    ) -> Result<(), SyncError> {
        let path = tracking.resolve(tree).unwrap_or_default();
        if self.is_busy(tree, &path) {
            return Err(SyncError::InTransfer(path));
        }
        self.entries.insert(order_id, tracking);
        Ok(())
    }

    pub fn remove(&mut self, order_id: OrderId) -> Option<Tracking> {
        self.entries.remove(&order_id)
    }

    pub fn contains(&self, order_id: OrderId) -> bool {
        self.entries.contains_key(&order_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_busy(&self, tree: &ServerTree, path: &str) -> bool {
        self.entries
            .values()
            .any(|tracking| tracking.resolve(tree).as_deref() == Some(path))
    }

    /// First transferring path at or below `path`.
    pub fn busy_within(&self, tree: &ServerTree, path: &str) -> Option<String> {
        self.entries
            .values()
            .filter_map(|tracking| tracking.resolve(tree))
            .find(|busy| is_within(path, busy))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Idle,
    Ticket,
    Batch { batch_id: BatchId },
    WaitForServerEcho { commit_id: u64, deadline: Instant },
}

/// Ticket and batch lifecycle shared by all three managers.
#[derive(Debug)]
pub struct Session {
    pub purpose: TicketPurpose,
    pub state: ManagerState,
    pub ticket: Option<Ticket>,
    next_batch_id: BatchId,
    control: Option<mpsc::Sender<WorkerControl>>,
    cancel: Option<CancellationToken>,
}

/// Handles a worker needs to listen to the orchestrator.
pub struct WorkerLink {
    pub batch_id: BatchId,
    pub control: mpsc::Receiver<WorkerControl>,
    pub cancel: CancellationToken,
}

impl Session {
    pub fn new(purpose: TicketPurpose) -> Self {
        Self {
            purpose,
            state: ManagerState::Idle,
            ticket: None,
            next_batch_id: 1,
            control: None,
            cancel: None,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.state == ManagerState::Idle
    }

    pub fn in_batch(&self) -> bool {
        matches!(self.state, ManagerState::Batch { .. })
    }

    pub fn is_current(&self, batch_id: BatchId) -> bool {
        self.state == ManagerState::Batch { batch_id }
    }

    pub fn echo_commit(&self) -> Option<u64> {
        match self.state {
            ManagerState::WaitForServerEcho { commit_id, .. } => Some(commit_id),
            _ => None,
        }
    }

    /// Consumes the held ticket and opens a new batch.
    pub fn begin_batch(&mut self) -> Option<(Ticket, WorkerLink)> {
        let ticket = self.ticket.take()?;
        let batch_id = self.next_batch_id;
        self.next_batch_id += 1;
        let (control_tx, control_rx) = mpsc::channel(CONTROL_CAPACITY);
        let cancel = CancellationToken::new();
        self.control = Some(control_tx);
        self.cancel = Some(cancel.clone());
        self.state = ManagerState::Batch { batch_id };
        Some((
            ticket,
            WorkerLink {
                batch_id,
                control: control_rx,
                cancel,
            },
        ))
    }

    pub fn end_batch(&mut self) {
        self.control = None;
        self.cancel = None;
        self.state = ManagerState::Idle;
    }

    pub fn wait_for_echo(&mut self, commit_id: u64, deadline: Instant) {
        self.control = None;
        self.cancel = None;
        self.state = ManagerState::WaitForServerEcho {
            commit_id,
            deadline,
        };
    }

    /// Hands a control message to the running batch. False once the worker
    /// is gone; a full channel is drained in the background.
    pub fn post_control(&self, control: WorkerControl) -> bool {
        let Some(sender) = &self.control else {
            return false;
        };
        match sender.try_send(control) {
            Ok(()) => true,
            Err(TrySendError::Full(control)) => {
                let sender = sender.clone();
                tokio::spawn(async move {
                    if sender.send(control).await.is_err() {
                        debug!("batch ended before taking a control message");
                    }
                });
                true
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    pub fn cancel_batch(&self) {
        if let Some(cancel) = &self.cancel {
            cancel.cancel();
        }
    }
}

/// A phase-1 reply must answer every submitted operation, in order.
fn check_phase1_reply(reply: &Phase1Reply, submitted: usize) -> Result<(), String> {
    if reply.results.len() == submitted {
        Ok(())
    } else {
        Err(format!(
            "server answered {} of {submitted} operations",
            reply.results.len()
        ))
    }
}

/// What a batch worker needs from the share.
#[derive(Clone)]
pub struct WorkerContext {
    pub transport: Arc<dyn ShareTransport>,
    pub inbox: mpsc::Sender<Message>,
}

impl WorkerContext {
    pub async fn post(&self, message: Message) {
        if self.inbox.send(message).await.is_err() {
            debug!("share inbox closed, dropping worker message");
        }
    }
}

#[derive(Debug)]
pub struct Transfers {
    pub files: FileTransferTree,
    pub download: DownloadManager,
    pub upload: UploadManager,
    pub metadata: MetadataManager,
    next_order_id: OrderId,
}

impl Default for Transfers {
    fn default() -> Self {
        Self {
            files: FileTransferTree::default(),
            download: DownloadManager::default(),
            upload: UploadManager::default(),
            metadata: MetadataManager::default(),
            next_order_id: 1,
        }
    }
}

impl Transfers {
    pub fn next_order_id(&mut self) -> OrderId {
        let order_id = self.next_order_id;
        self.next_order_id += 1;
        order_id
    }

    pub fn session_mut(&mut self, purpose: TicketPurpose) -> &mut Session {
        match purpose {
            TicketPurpose::Download => &mut self.download.session,
            TicketPurpose::Upload => &mut self.upload.session,
            TicketPurpose::Metadata => &mut self.metadata.session,
        }
    }

    pub fn cancel_all(&self) {
        self.download.session.cancel_batch();
        self.upload.session.cancel_batch();
        self.metadata.session.cancel_batch();
    }
}

impl Share {
    pub(crate) fn worker_context(&self) -> WorkerContext {
        WorkerContext {
            transport: self.transport.clone(),
            inbox: self.inbox.clone(),
        }
    }

    pub(crate) fn report_transfer_failure(
        &self,
        order_id: OrderId,
        path: String,
        kind: ErrorKind,
        reason: String,
    ) {
        if kind == ErrorKind::Cancelled {
            return;
        }
        self.observer.transfer_error_raised(&TransferFailure {
            order_id,
            path,
            kind,
            reason,
        });
    }

    /// Starts a ticket request unless one is already outstanding.
    pub(crate) fn request_ticket(&mut self, purpose: TicketPurpose) {
        let session = self.transfers.session_mut(purpose);
        if !session.is_idle() || session.ticket.is_some() {
            return;
        }
        session.state = ManagerState::Ticket;
        info!(purpose = purpose.as_str(), "requesting transfer ticket");
        let ctx = self.worker_context();
        tokio::spawn(async move {
            let result = ctx.transport.request_ticket(purpose).await;
            ctx.post(Message::TicketReply { purpose, result }).await;
        });
    }

    pub(crate) async fn on_ticket_reply(
        &mut self,
        purpose: TicketPurpose,
        result: Result<Ticket, RemoteError>,
    ) {
        let session = self.transfers.session_mut(purpose);
        if session.state != ManagerState::Ticket {
            debug!(purpose = purpose.as_str(), "ignoring stale ticket reply");
            return;
        }
        session.state = ManagerState::Idle;
        match result {
            Ok(ticket) => {
                debug!(purpose = purpose.as_str(), "ticket granted");
                session.ticket = Some(ticket);
            }
            Err(err) => {
                warn!(purpose = purpose.as_str(), "ticket request failed: {err}");
                let reason = err.reason();
                let kind = SyncError::from(err).kind();
                self.fail_manager(purpose, kind, reason).await;
            }
        }
    }

    /// Fails every queued and batched item of one manager and returns it to
    /// idle.
    pub(crate) async fn fail_manager(
        &mut self,
        purpose: TicketPurpose,
        kind: ErrorKind,
        reason: String,
    ) {
        match purpose {
            TicketPurpose::Download => self.fail_downloads(kind, &reason),
            TicketPurpose::Upload => self.fail_uploads(kind, &reason).await,
            TicketPurpose::Metadata => self.fail_metadata(kind, &reason),
        }
        self.transfers.session_mut(purpose).end_batch();
        self.pipeline.full_sync = true;
        self.ui.view_stale = true;
    }

    /// The Transfer stage.
    pub(crate) async fn transfer_stage(&mut self, now: Instant) {
        self.drain_downloads().await;
        self.check_echo_timeouts(now).await;

        let allowed = self.health.allowed;
        if allowed >= AllowedOps::DownloadOnly {
            self.queue_stale_downloads(now);
            if self.transfers.download.session.is_idle() && self.transfers.download.has_queued() {
                self.advance_session(TicketPurpose::Download).await;
            }
        }
        if allowed == AllowedOps::All {
            self.fail_unplaceable_uploads();
            if self.transfers.metadata.session.is_idle() && self.metadata_ready() {
                self.advance_session(TicketPurpose::Metadata).await;
            }
            if self.transfers.upload.session.is_idle() && self.uploads_ready() {
                self.advance_session(TicketPurpose::Upload).await;
            }
        }
        self.prune_download_cache().await;
    }

    async fn advance_session(&mut self, purpose: TicketPurpose) {
        if self.transfers.session_mut(purpose).ticket.is_none() {
            self.request_ticket(purpose);
            return;
        }
        match purpose {
            TicketPurpose::Download => self.start_download_batch().await,
            TicketPurpose::Upload => self.start_upload_batch(),
            TicketPurpose::Metadata => self.start_metadata_batch(),
        }
    }

    async fn check_echo_timeouts(&mut self, now: Instant) {
        for purpose in [TicketPurpose::Upload, TicketPurpose::Metadata] {
            let ManagerState::WaitForServerEcho { commit_id, deadline } =
                self.transfers.session_mut(purpose).state
            else {
                continue;
            };
            if now < deadline {
                self.wake_at(deadline);
                continue;
            }
            warn!(purpose = purpose.as_str(), commit_id, "server never confirmed the commit");
            self.fail_manager(
                purpose,
                ErrorKind::Generic,
                "the server did not confirm the change in time".to_string(),
            )
            .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_batch(session: &mut Session) -> WorkerLink {
        session.ticket = Some(Ticket::new("download-1"));
        let (_ticket, link) = session.begin_batch().unwrap();
        link
    }

    #[tokio::test]
    async fn control_messages_past_the_channel_capacity_are_delivered() {
        let mut session = Session::new(TicketPurpose::Download);
        let mut link = open_batch(&mut session);
        let total = CONTROL_CAPACITY as u64 + 1;

        for order_id in 1..=total {
            assert!(session.post_control(WorkerControl::CancelItem(order_id)));
        }

        let mut received = Vec::new();
        while received.len() < total as usize {
            match link.control.recv().await {
                Some(WorkerControl::CancelItem(order_id)) => received.push(order_id),
                None => break,
            }
        }
        received.sort_unstable();
        assert_eq!(received, (1..=total).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn control_for_a_finished_worker_is_refused() {
        let mut session = Session::new(TicketPurpose::Upload);
        let link = open_batch(&mut session);
        drop(link);

        assert!(!session.post_control(WorkerControl::CancelItem(1)));
        session.end_batch();
        assert!(!session.post_control(WorkerControl::CancelItem(1)));
    }

    #[test]
    fn short_phase1_reply_is_rejected() {
        let reply = Phase1Reply {
            commit_id: 7,
            results: Vec::new(),
        };
        assert_eq!(
            check_phase1_reply(&reply, 2),
            Err("server answered 0 of 2 operations".to_string())
        );
        assert!(check_phase1_reply(&reply, 0).is_ok());
    }
}
