use std::sync::Arc;

use tracing::{info, warn};

use super::error::ErrorKind;
use super::messages::OrderId;
use super::ops::ManualAction;
use super::reconcile::StatusView;

/// Operations the share currently permits, from most to least restricted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum AllowedOps {
    #[default]
    None,
    DownloadOnly,
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Download,
    Upload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferProgress {
    pub order_id: OrderId,
    pub direction: Direction,
    pub path: String,
    pub bytes_done: u64,
    pub total: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferFailure {
    pub order_id: OrderId,
    pub path: String,
    pub kind: ErrorKind,
    pub reason: String,
}

/// Callbacks produced by a share for whoever renders it. All methods run on
/// the orchestrator and must not block.
pub trait ShareObserver: Send + Sync {
    fn status_view_changed(&self, _view: &StatusView) {}

    fn transfer_progress_changed(&self, _progress: &TransferProgress) {}

    fn transfer_error_raised(&self, _failure: &TransferFailure) {}

    fn allowed_operations_changed(&self, _allowed: AllowedOps) {}

    fn action_required(&self, _action: &ManualAction) {}

    fn share_failed(&self, _reason: &str) {}
}

/// Observer for the headless daemon: everything goes to the log.
#[derive(Debug, Default)]
pub struct LogObserver;

impl LogObserver {
    pub fn shared() -> Arc<dyn ShareObserver> {
        Arc::new(Self)
    }
}

impl ShareObserver for LogObserver {
    fn status_view_changed(&self, view: &StatusView) {
        info!(
            paths = view.len(),
            type_conflict = view.type_conflict,
            "status view refreshed"
        );
    }

    fn transfer_progress_changed(&self, progress: &TransferProgress) {
        tracing::debug!(
            order_id = progress.order_id,
            direction = ?progress.direction,
            path = %progress.path,
            done = progress.bytes_done,
            total = progress.total,
            "transfer progress"
        );
    }

    fn transfer_error_raised(&self, failure: &TransferFailure) {
        warn!(
            order_id = failure.order_id,
            path = %failure.path,
            kind = ?failure.kind,
            "transfer failed: {}",
            failure.reason
        );
    }

    fn allowed_operations_changed(&self, allowed: AllowedOps) {
        info!(?allowed, "allowed operations changed");
    }

    fn action_required(&self, action: &ManualAction) {
        warn!(path = %action.path(), ?action, "manual action required");
    }

    fn share_failed(&self, reason: &str) {
        tracing::error!("share disabled: {reason}");
    }
}
