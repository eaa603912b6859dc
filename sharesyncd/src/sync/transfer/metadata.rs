use std::collections::BTreeMap;

use sharesync_core::{Phase1Op, Ticket, TicketPurpose};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{Session, TransferStatus, WorkerContext, WorkerLink, check_phase1_reply};
use crate::sync::error::{ErrorKind, SyncError};
use crate::sync::messages::{Message, MetadataEvent, OrderId};
use crate::sync::ops::ServerOp;
use crate::sync::paths::split_parent;
use crate::sync::share::Share;

/// A namespace change requested by the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataRequest {
    CreateDir { path: String },
    Delete { inode: u64 },
    Move { inode: u64, new_path: String },
}

#[derive(Debug, Clone)]
pub struct MetadataItem {
    pub order_id: OrderId,
    pub request: MetadataRequest,
    pub status: TransferStatus,
}

#[derive(Debug)]
pub struct MetadataManager {
    pub session: Session,
    pub items: BTreeMap<OrderId, MetadataItem>,
}

impl Default for MetadataManager {
    fn default() -> Self {
        Self {
            session: Session::new(TicketPurpose::Metadata),
            items: BTreeMap::new(),
        }
    }
}

impl MetadataManager {
    pub(crate) fn creates_dir(&self, path: &str) -> bool {
        self.items.values().any(|item| {
            matches!(&item.request, MetadataRequest::CreateDir { path: queued } if queued == path)
        })
    }
}

/// Where a queued request stands against the current server tree.
enum Readiness {
    Ready(Phase1Op),
    /// Waiting on a directory another queued request creates.
    Deferred,
    /// The server already looks the way the request asks for.
    Satisfied,
    Invalid(String),
}

impl Share {
    pub(crate) fn enqueue_metadata(&mut self, request: MetadataRequest) -> OrderId {
        let order_id = self.transfers.next_order_id();
        debug!(order_id, ?request, "metadata change queued");
        self.transfers.metadata.items.insert(
            order_id,
            MetadataItem {
                order_id,
                request,
                status: TransferStatus::Queued,
            },
        );
        order_id
    }

    fn resolve_parent(&self, path: &str) -> Result<Option<(u64, String)>, String> {
        let (parent, name) = split_parent(path);
        match self.tree.lookup(parent) {
            Some(inode) if self.tree.is_dir(inode) => Ok(Some((inode, name.to_string()))),
            Some(_) => Err(format!("{parent} is not a directory on the server")),
            None if self.transfers.metadata.creates_dir(parent) => Ok(None),
            None => Err(format!("{parent} does not exist on the server")),
        }
    }

    fn metadata_readiness(&self, request: &MetadataRequest) -> Readiness {
        match request {
            MetadataRequest::CreateDir { path } => {
                if let Some(existing) = self.tree.lookup(path) {
                    return if self.tree.is_dir(existing) {
                        Readiness::Satisfied
                    } else {
                        Readiness::Invalid(format!("{path} is a file on the server"))
                    };
                }
                match self.resolve_parent(path) {
                    Ok(Some((parent_inode, name))) => {
                        Readiness::Ready(Phase1Op::CreateDir { parent_inode, name })
                    }
                    Ok(None) => Readiness::Deferred,
                    Err(reason) => Readiness::Invalid(reason),
                }
            }
            MetadataRequest::Delete { inode } => match self.tree.get(*inode) {
                Some(object) => Readiness::Ready(Phase1Op::Delete {
                    inode: *inode,
                    commit_id: object.commit_id,
                }),
                None => Readiness::Satisfied,
            },
            MetadataRequest::Move { inode, new_path } => {
                let Some(object) = self.tree.get(*inode) else {
                    return Readiness::Invalid("the object was deleted on the server".into());
                };
                if self.tree.path_of(*inode).as_deref() == Some(new_path.as_str()) {
                    return Readiness::Satisfied;
                }
                match self.resolve_parent(new_path) {
                    Ok(Some((new_parent_inode, new_name))) => Readiness::Ready(Phase1Op::Move {
                        inode: *inode,
                        commit_id: object.commit_id,
                        new_parent_inode,
                        new_name,
                    }),
                    Ok(None) => Readiness::Deferred,
                    Err(reason) => Readiness::Invalid(reason),
                }
            }
        }
    }

    pub(crate) fn metadata_ready(&self) -> bool {
        self.transfers
            .metadata
            .items
            .values()
            .filter(|item| item.status == TransferStatus::Queued)
            .any(|item| !matches!(self.metadata_readiness(&item.request), Readiness::Deferred))
    }

    pub(crate) fn start_metadata_batch(&mut self) {
        let mut plan = Vec::new();
        let mut settled = Vec::new();
        for item in self.transfers.metadata.items.values() {
            if item.status != TransferStatus::Queued {
                continue;
            }
            match self.metadata_readiness(&item.request) {
                Readiness::Ready(op) => plan.push((item.order_id, op)),
                Readiness::Deferred => {}
                Readiness::Satisfied => settled.push((item.order_id, None)),
                Readiness::Invalid(reason) => settled.push((item.order_id, Some(reason))),
            }
        }
        for (order_id, failure) in settled {
            match failure {
                Some(reason) => self.fail_metadata_item(order_id, ErrorKind::IllegalOperation, reason),
                None => {
                    self.transfers.metadata.items.remove(&order_id);
                }
            }
        }
        if plan.is_empty() {
            return;
        }
        let Some((ticket, link)) = self.transfers.metadata.session.begin_batch() else {
            return;
        };
        for (order_id, _) in &plan {
            if let Some(item) = self.transfers.metadata.items.get_mut(order_id) {
                item.status = TransferStatus::Batched;
            }
        }
        info!(batch_id = link.batch_id, ops = plan.len(), "metadata batch started");
        let ctx = self.worker_context();
        tokio::spawn(run_metadata_batch(ctx, ticket, plan, link));
    }

    fn metadata_path(&self, request: &MetadataRequest) -> String {
        match request {
            MetadataRequest::CreateDir { path } => path.clone(),
            MetadataRequest::Move { new_path, .. } => new_path.clone(),
            MetadataRequest::Delete { inode } => self.tree.path_of(*inode).unwrap_or_default(),
        }
    }

    fn fail_metadata_item(&mut self, order_id: OrderId, kind: ErrorKind, reason: String) {
        let Some(item) = self.transfers.metadata.items.remove(&order_id) else {
            return;
        };
        let path = self.metadata_path(&item.request);
        self.report_transfer_failure(order_id, path, kind, reason);
    }

    pub(crate) fn fail_metadata(&mut self, kind: ErrorKind, reason: &str) {
        let failed: Vec<OrderId> = self.transfers.metadata.items.keys().copied().collect();
        for order_id in failed {
            self.fail_metadata_item(order_id, kind, reason.to_string());
        }
    }

    pub(crate) async fn on_metadata_event(&mut self, event: MetadataEvent) {
        match event {
            MetadataEvent::Phase1Done {
                batch_id,
                commit_id,
                results,
            } => {
                if !self.transfers.metadata.session.is_current(batch_id) {
                    return;
                }
                let mut accepted = false;
                for (order_id, result) in results {
                    if result.accepted {
                        accepted = true;
                        if let Some(item) = self.transfers.metadata.items.get_mut(&order_id) {
                            item.status = TransferStatus::Transferred;
                        }
                    } else {
                        let reason = result
                            .reason
                            .unwrap_or_else(|| "rejected by the server".to_string());
                        self.fail_metadata_item(order_id, ErrorKind::ServerRejected, reason);
                    }
                }
                if accepted {
                    debug!(batch_id, commit_id, "metadata accepted, waiting for server echo");
                    let deadline = Instant::now() + self.config.tuning.upload_echo_timeout;
                    self.transfers.metadata.session.wait_for_echo(commit_id, deadline);
                } else {
                    self.transfers.metadata.session.end_batch();
                }
            }
            MetadataEvent::BatchFailed { batch_id, reason } => {
                if !self.transfers.metadata.session.is_current(batch_id) {
                    return;
                }
                warn!(batch_id, "metadata batch failed: {reason}");
                self.fail_manager(TicketPurpose::Metadata, ErrorKind::Generic, reason)
                    .await;
            }
            MetadataEvent::BatchCancelled { batch_id } => {
                if !self.transfers.metadata.session.is_current(batch_id) {
                    return;
                }
                info!(batch_id, "metadata batch cancelled");
                let batched: Vec<OrderId> = self
                    .transfers
                    .metadata
                    .items
                    .values()
                    .filter(|item| item.status != TransferStatus::Queued)
                    .map(|item| item.order_id)
                    .collect();
                for order_id in batched {
                    self.fail_metadata_item(order_id, ErrorKind::Cancelled, "cancelled".to_string());
                }
                self.transfers.metadata.session.end_batch();
            }
        }
    }

    /// Any applied operation carrying the awaited commit id completes the
    /// batch.
    pub(crate) fn metadata_echo(&mut self, op: &ServerOp) {
        if self.transfers.metadata.session.echo_commit() != Some(op.header.commit_id) {
            return;
        }
        self.transfers
            .metadata
            .items
            .retain(|_, item| item.status != TransferStatus::Transferred);
        self.transfers.metadata.session.end_batch();
        self.ui.view_stale = true;
        info!(commit_id = op.header.commit_id, "metadata change confirmed by the server");
    }

    /// Rejects a metadata change touching a path with a content transfer.
    pub(crate) fn ensure_not_transferring(&self, path: &str) -> Result<(), SyncError> {
        match self.transfers.files.busy_within(&self.tree, path) {
            Some(busy) => Err(SyncError::InTransfer(busy)),
            None => Ok(()),
        }
    }
}

async fn run_metadata_batch(
    ctx: WorkerContext,
    ticket: Ticket,
    plan: Vec<(OrderId, Phase1Op)>,
    link: WorkerLink,
) {
    let batch_id = link.batch_id;
    let ops: Vec<Phase1Op> = plan.iter().map(|(_, op)| op.clone()).collect();
    let submitted = tokio::select! {
        biased;
        _ = link.cancel.cancelled() => {
            ctx.post(Message::Metadata(MetadataEvent::BatchCancelled { batch_id }))
                .await;
            return;
        }
        reply = ctx.transport.submit_phase1(&ticket, &ops) => reply,
    };
    let event = match submitted {
        Ok(reply) => match check_phase1_reply(&reply, ops.len()) {
            Ok(()) => MetadataEvent::Phase1Done {
                batch_id,
                commit_id: reply.commit_id,
                results: plan
                    .iter()
                    .map(|(order_id, _)| *order_id)
                    .zip(reply.results)
                    .collect(),
            },
            Err(reason) => MetadataEvent::BatchFailed { batch_id, reason },
        },
        Err(err) => MetadataEvent::BatchFailed {
            batch_id,
            reason: err.reason(),
        },
    };
    ctx.post(Message::Metadata(event)).await;
}
