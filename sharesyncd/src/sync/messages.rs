//! Everything posted into a share's inbox. Workers and collaborators never
//! touch share state; they send one of these and the orchestrator applies it
//! between pipeline runs.

use std::path::PathBuf;

use sharesync_core::{Phase1Result, RemoteError, ServerEvent, Ticket, TicketPurpose};

use super::local::{LocalEntry, LocalError, LocalTree};

pub type BatchId = u64;
pub type OrderId = u64;

#[derive(Debug)]
pub enum ScanResult {
    Full(Result<LocalTree, LocalError>),
    /// Fresh entries for each rescanned share-relative path.
    Partial(Result<Vec<(String, Vec<LocalEntry>)>, LocalError>),
}

#[derive(Debug)]
pub enum DownloadEvent {
    Progress {
        batch_id: BatchId,
        order_id: OrderId,
        bytes_done: u64,
    },
    FileDone {
        batch_id: BatchId,
        order_id: OrderId,
        cache_path: PathBuf,
    },
    CancelAck {
        batch_id: BatchId,
        order_id: OrderId,
        /// Bytes present in the partial cache file.
        cached_bytes: u64,
    },
    BatchDone {
        batch_id: BatchId,
    },
    BatchFailed {
        batch_id: BatchId,
        reason: String,
    },
    BatchCancelled {
        batch_id: BatchId,
    },
}

#[derive(Debug)]
pub enum UploadEvent {
    Phase1Done {
        batch_id: BatchId,
        commit_id: u64,
        /// One result per batched item, in batch order.
        results: Vec<(OrderId, Phase1Result)>,
    },
    Progress {
        batch_id: BatchId,
        order_id: OrderId,
        bytes_done: u64,
    },
    FileAborted {
        batch_id: BatchId,
        order_id: OrderId,
    },
    FileSent {
        batch_id: BatchId,
        order_id: OrderId,
    },
    BatchSent {
        batch_id: BatchId,
    },
    BatchFailed {
        batch_id: BatchId,
        reason: String,
    },
    BatchCancelled {
        batch_id: BatchId,
    },
}

#[derive(Debug)]
pub enum MetadataEvent {
    Phase1Done {
        batch_id: BatchId,
        commit_id: u64,
        results: Vec<(OrderId, Phase1Result)>,
    },
    BatchFailed {
        batch_id: BatchId,
        reason: String,
    },
    BatchCancelled {
        batch_id: BatchId,
    },
}

#[derive(Debug)]
pub enum Message {
    ScanCompleted(ScanResult),
    FsChanged {
        path: String,
    },
    FsRenamed {
        from: String,
        to: String,
    },
    MarkerObserved {
        marker_id: u64,
    },
    WatcherFailed {
        reason: String,
    },
    ServerEvents {
        events: Vec<ServerEvent>,
        caught_up: bool,
    },
    TicketReply {
        purpose: TicketPurpose,
        result: Result<Ticket, RemoteError>,
    },
    Download(DownloadEvent),
    Upload(UploadEvent),
    Metadata(MetadataEvent),
    /// Asks for a pipeline pass, optionally as a full synchronization.
    Run {
        full_sync: bool,
    },
}

/// Control messages posted from the orchestrator into a running batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerControl {
    CancelItem(OrderId),
}
