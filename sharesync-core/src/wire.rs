use serde::{Deserialize, Serialize};

/// Which transfer manager a ticket is scoped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketPurpose {
    Download,
    Upload,
    Metadata,
}

impl TicketPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            TicketPurpose::Download => "download",
            TicketPurpose::Upload => "upload",
            TicketPurpose::Metadata => "metadata",
        }
    }
}

/// Opaque single-use token authorizing one batch.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Ticket {
    pub ticket: String,
}

impl Ticket {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            ticket: token.into(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.ticket
    }
}

/// One descriptor of a phase-1 request. The server applies the whole list
/// atomically and answers with a single commit id.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Phase1Op {
    CreateFile {
        parent_inode: u64,
        name: String,
        size: u64,
        hash: String,
    },
    UpdateFile {
        inode: u64,
        commit_id: u64,
        size: u64,
        hash: String,
    },
    CreateDir {
        parent_inode: u64,
        name: String,
    },
    Delete {
        inode: u64,
        commit_id: u64,
    },
    Move {
        inode: u64,
        commit_id: u64,
        new_parent_inode: u64,
        new_name: String,
    },
}

impl Phase1Op {
    pub fn kind(&self) -> &'static str {
        match self {
            Phase1Op::CreateFile { .. } => "create_file",
            Phase1Op::UpdateFile { .. } => "update_file",
            Phase1Op::CreateDir { .. } => "create_dir",
            Phase1Op::Delete { .. } => "delete",
            Phase1Op::Move { .. } => "move",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Phase1Request {
    pub ops: Vec<Phase1Op>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Phase1Result {
    pub accepted: bool,
    #[serde(default)]
    pub reason: Option<String>,
    /// Inode assigned (create) or confirmed (update) by the server.
    #[serde(default)]
    pub inode: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Phase1Reply {
    pub commit_id: u64,
    pub results: Vec<Phase1Result>,
}

/// A file requested in a download batch. `offset` is the number of bytes
/// already present in the local cache for `commit_id`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct DownloadRequest {
    pub inode: u64,
    pub commit_id: u64,
    pub offset: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct DownloadBatchRequest {
    pub files: Vec<DownloadRequest>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct CommitEntry {
    pub inode: u64,
    pub size: u64,
    pub hash: String,
}

/// A server-side tree mutation as broadcast to every client of the share.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ServerEvent {
    pub event_id: u64,
    pub commit_id: u64,
    pub user_id: u64,
    pub date: i64,
    #[serde(flatten)]
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    Create {
        inode: u64,
        parent_inode: u64,
        name: String,
        is_dir: bool,
    },
    Update {
        inode: u64,
    },
    Delete {
        inode: u64,
    },
    Move {
        inode: u64,
        new_parent_inode: u64,
        new_name: String,
    },
    Phase2Commit {
        files: Vec<CommitEntry>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct EventBatch {
    pub events: Vec<ServerEvent>,
    /// True once the batch reaches the newest event the server knows about.
    #[serde(default)]
    pub caught_up: bool,
}
