use tokio::time::Instant;
use tracing::{debug, warn};

use super::share::Share;

impl Share {
    /// Holds the pipeline at its Entry stage until the matching
    /// [`Share::gate_exit`].
    pub fn gate_enter(&mut self, reason: &str) {
        self.gate.depth += 1;
        debug!(depth = self.gate.depth, reason, "gate entered");
        if self.ui.view_stale {
            self.refresh_view(Instant::now());
        }
        self.update_allowed();
    }

    /// Releases one hold. The last release runs a full synchronization pass.
    pub async fn gate_exit(&mut self, reason: &str) {
        let Some(depth) = self.gate.depth.checked_sub(1) else {
            warn!(reason, "gate exit without a matching enter");
            return;
        };
        self.gate.depth = depth;
        debug!(depth, reason, "gate exited");
        if depth == 0 {
            self.pipeline.full_sync = true;
            self.run_pipeline().await;
        }
    }

    pub fn gate_held(&self) -> bool {
        self.gate.depth > 0
    }

    /// Opens the gate for an in-place rename. Retries within the same edit
    /// session keep the existing hold.
    pub fn begin_label_edit(&mut self) {
        if self.gate.label_edit {
            return;
        }
        self.gate.label_edit = true;
        self.gate_enter("label edit");
    }

    pub async fn end_label_edit(&mut self) {
        if std::mem::take(&mut self.gate.label_edit) {
            self.gate_exit("label edit").await;
        }
    }
}
