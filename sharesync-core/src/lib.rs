mod client;
pub mod frame;
mod transport;
pub mod wire;

pub use client::{RemoteError, RemoteErrorClass, ShareClient};
pub use frame::{DownloadMessage, FrameError, Phase2Message};
pub use transport::{DownloadStream, ShareTransport};
pub use wire::{
    CommitEntry, DownloadRequest, EventBatch, EventKind, Phase1Op, Phase1Reply, Phase1Result,
    ServerEvent, Ticket, TicketPurpose,
};
