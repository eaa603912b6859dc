use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::client::RemoteError;
use crate::frame::{DownloadMessage, Phase2Message};
use crate::wire::{DownloadRequest, EventBatch, Phase1Op, Phase1Reply, Ticket, TicketPurpose};

pub type DownloadStream = BoxStream<'static, Result<DownloadMessage, RemoteError>>;

/// The request/reply surface the synchronization core needs from the server.
///
/// Implementations must be cheap to share between the orchestrator and the
/// batch workers.
#[async_trait]
pub trait ShareTransport: Send + Sync {
    async fn request_ticket(&self, purpose: TicketPurpose) -> Result<Ticket, RemoteError>;

    async fn submit_phase1(
        &self,
        ticket: &Ticket,
        ops: &[Phase1Op],
    ) -> Result<Phase1Reply, RemoteError>;

    async fn send_phase2(
        &self,
        ticket: &Ticket,
        messages: &[Phase2Message],
    ) -> Result<(), RemoteError>;

    async fn open_download(
        &self,
        ticket: &Ticket,
        files: &[DownloadRequest],
    ) -> Result<DownloadStream, RemoteError>;

    async fn poll_events(&self, after_event_id: u64) -> Result<EventBatch, RemoteError>;
}
