//! In-memory server and observer used by the share tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use sharesync_core::{
    CommitEntry, DownloadMessage, DownloadRequest, DownloadStream, EventBatch, EventKind,
    Phase1Op, Phase1Reply, Phase1Result, Phase2Message, RemoteError, ServerEvent, ShareTransport,
    Ticket, TicketPurpose,
};
use tempfile::TempDir;
use tokio::sync::mpsc;

use super::config::{ShareConfig, Tuning};
use super::error::{Choice, Prompt, PromptAnswer, SyncError};
use super::events::{AllowedOps, ShareObserver, TransferFailure, TransferProgress};
use super::local::hash_bytes;
use super::messages::Message;
use super::ops::ManualAction;
use super::reconcile::StatusView;
use super::runtime;
use super::share::Share;
use super::store::memory_store;

pub const TEST_USER: u64 = 1;
pub const OTHER_USER: u64 = 2;

const SETTLE_ROUNDS: usize = 50;
const SETTLE_QUIET: Duration = Duration::from_millis(200);

struct FakeState {
    ticket_errors: VecDeque<RemoteError>,
    tickets_issued: Vec<TicketPurpose>,
    phase1_calls: Vec<Vec<Phase1Op>>,
    rejections: HashMap<String, String>,
    phase2: Vec<Phase2Message>,
    contents: HashMap<u64, Vec<u8>>,
    chunk_size: usize,
    stall_after_bytes: Option<usize>,
    stall_phase1: bool,
    short_phase1: bool,
    events: Vec<ServerEvent>,
    polled: Vec<u64>,
    download_requests: Vec<DownloadRequest>,
    next_commit: u64,
    next_inode: u64,
}

impl Default for FakeState {
    fn default() -> Self {
        Self {
            ticket_errors: VecDeque::new(),
            tickets_issued: Vec::new(),
            phase1_calls: Vec::new(),
            rejections: HashMap::new(),
            phase2: Vec::new(),
            contents: HashMap::new(),
            chunk_size: 4,
            stall_after_bytes: None,
            stall_phase1: false,
            short_phase1: false,
            events: Vec::new(),
            polled: Vec::new(),
            download_requests: Vec::new(),
            next_commit: 100,
            next_inode: 1000,
        }
    }
}

/// Server double: grants tickets, accepts phase 1 with fresh commit and
/// inode numbers, streams registered content and serves a fixed event log.
#[derive(Default)]
pub struct FakeTransport {
    state: Mutex<FakeState>,
}

impl FakeTransport {
    fn with_state<T>(&self, f: impl FnOnce(&mut FakeState) -> T) -> T {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    pub fn fail_next_ticket(&self, err: RemoteError) {
        self.with_state(|state| state.ticket_errors.push_back(err));
    }

    pub fn reject_name(&self, name: &str, reason: &str) {
        self.with_state(|state| {
            state.rejections.insert(name.to_string(), reason.to_string())
        });
    }

    pub fn set_content(&self, inode: u64, content: &[u8]) {
        self.with_state(|state| state.contents.insert(inode, content.to_vec()));
    }

    pub fn set_chunk_size(&self, chunk_size: usize) {
        self.with_state(|state| state.chunk_size = chunk_size.max(1));
    }

    /// Download streams go silent after this many content bytes.
    pub fn stall_after(&self, bytes: usize) {
        self.with_state(|state| state.stall_after_bytes = Some(bytes));
    }

    /// Phase-1 submissions never get an answer.
    pub fn stall_phase1(&self) {
        self.with_state(|state| state.stall_phase1 = true);
    }

    /// Phase-1 replies leave out the result of the last operation.
    pub fn short_phase1_replies(&self) {
        self.with_state(|state| state.short_phase1 = true);
    }

    pub fn push_event(&self, event: ServerEvent) {
        self.with_state(|state| state.events.push(event));
    }

    pub fn phase1_calls(&self) -> Vec<Vec<Phase1Op>> {
        self.with_state(|state| state.phase1_calls.clone())
    }

    pub fn phase2_messages(&self) -> Vec<Phase2Message> {
        self.with_state(|state| state.phase2.clone())
    }

    pub fn polled_cursors(&self) -> Vec<u64> {
        self.with_state(|state| state.polled.clone())
    }

    pub fn download_requests(&self) -> Vec<DownloadRequest> {
        self.with_state(|state| state.download_requests.clone())
    }

    pub fn tickets_issued(&self) -> Vec<TicketPurpose> {
        self.with_state(|state| state.tickets_issued.clone())
    }
}

fn op_name(op: &Phase1Op) -> Option<&str> {
    match op {
        Phase1Op::CreateFile { name, .. } | Phase1Op::CreateDir { name, .. } => Some(name),
        Phase1Op::Move { new_name, .. } => Some(new_name),
        Phase1Op::UpdateFile { .. } | Phase1Op::Delete { .. } => None,
    }
}

#[async_trait]
impl ShareTransport for FakeTransport {
    async fn request_ticket(&self, purpose: TicketPurpose) -> Result<Ticket, RemoteError> {
        self.with_state(|state| {
            if let Some(err) = state.ticket_errors.pop_front() {
                return Err(err);
            }
            state.tickets_issued.push(purpose);
            Ok(Ticket::new(format!("{}-{}", purpose.as_str(), state.tickets_issued.len())))
        })
    }

    async fn submit_phase1(
        &self,
        _ticket: &Ticket,
        ops: &[Phase1Op],
    ) -> Result<Phase1Reply, RemoteError> {
        if self.with_state(|state| state.stall_phase1) {
            std::future::pending::<()>().await;
        }
        self.with_state(|state| {
            state.phase1_calls.push(ops.to_vec());
            let commit_id = state.next_commit;
            state.next_commit += 1;
            let mut results = Vec::with_capacity(ops.len());
            for op in ops {
                if let Some(reason) = op_name(op).and_then(|name| state.rejections.get(name)) {
                    results.push(Phase1Result {
                        accepted: false,
                        reason: Some(reason.clone()),
                        inode: None,
                    });
                    continue;
                }
                let inode = match op {
                    Phase1Op::CreateFile { .. } | Phase1Op::CreateDir { .. } => {
                        let inode = state.next_inode;
                        state.next_inode += 1;
                        Some(inode)
                    }
                    Phase1Op::UpdateFile { inode, .. } => Some(*inode),
                    Phase1Op::Delete { .. } | Phase1Op::Move { .. } => None,
                };
                results.push(Phase1Result {
                    accepted: true,
                    reason: None,
                    inode,
                });
            }
            if state.short_phase1 {
                results.pop();
            }
            Ok(Phase1Reply { commit_id, results })
        })
    }

    async fn send_phase2(
        &self,
        _ticket: &Ticket,
        messages: &[Phase2Message],
    ) -> Result<(), RemoteError> {
        self.with_state(|state| state.phase2.extend_from_slice(messages));
        Ok(())
    }

    async fn open_download(
        &self,
        _ticket: &Ticket,
        files: &[DownloadRequest],
    ) -> Result<DownloadStream, RemoteError> {
        let (messages, stalls) = self.with_state(|state| {
            state.download_requests.extend_from_slice(files);
            let mut budget = state.stall_after_bytes;
            let mut messages = Vec::new();
            'files: for request in files {
                let content = state.contents.get(&request.inode).cloned().unwrap_or_default();
                let total = content.len() as u64;
                let offset = request.offset.min(total);
                messages.push(DownloadMessage::File {
                    inode: request.inode,
                    total_size: total,
                    remaining: total - offset,
                });
                for chunk in content[offset as usize..].chunks(state.chunk_size) {
                    if let Some(left) = budget.as_mut() {
                        if *left == 0 {
                            break 'files;
                        }
                        *left = left.saturating_sub(chunk.len());
                    }
                    messages.push(DownloadMessage::Chunk(chunk.to_vec()));
                }
            }
            (messages, state.stall_after_bytes.is_some())
        });
        let head = stream::iter(messages.into_iter().map(Ok));
        if stalls {
            Ok(head.chain(stream::pending()).boxed())
        } else {
            Ok(head.boxed())
        }
    }

    async fn poll_events(&self, after_event_id: u64) -> Result<EventBatch, RemoteError> {
        self.with_state(|state| {
            state.polled.push(after_event_id);
            let events = state
                .events
                .iter()
                .filter(|event| event.event_id > after_event_id)
                .cloned()
                .collect();
            Ok(EventBatch {
                events,
                caught_up: true,
            })
        })
    }
}

#[derive(Default)]
struct ObserverLog {
    views: usize,
    progress: Vec<TransferProgress>,
    failures: Vec<TransferFailure>,
    allowed: Vec<AllowedOps>,
    actions: Vec<ManualAction>,
    share_failures: Vec<String>,
}

#[derive(Default)]
pub struct RecordingObserver {
    log: Mutex<ObserverLog>,
}

impl RecordingObserver {
    fn with_log<T>(&self, f: impl FnOnce(&ObserverLog) -> T) -> T {
        f(&self.log.lock().unwrap())
    }

    pub fn views(&self) -> usize {
        self.with_log(|log| log.views)
    }

    pub fn progress(&self) -> Vec<TransferProgress> {
        self.with_log(|log| log.progress.clone())
    }

    pub fn failures(&self) -> Vec<TransferFailure> {
        self.with_log(|log| log.failures.clone())
    }

    pub fn allowed_changes(&self) -> Vec<AllowedOps> {
        self.with_log(|log| log.allowed.clone())
    }

    pub fn actions(&self) -> Vec<ManualAction> {
        self.with_log(|log| log.actions.clone())
    }

    pub fn share_failures(&self) -> Vec<String> {
        self.with_log(|log| log.share_failures.clone())
    }
}

impl ShareObserver for RecordingObserver {
    fn status_view_changed(&self, _view: &StatusView) {
        self.log.lock().unwrap().views += 1;
    }

    fn transfer_progress_changed(&self, progress: &TransferProgress) {
        self.log.lock().unwrap().progress.push(progress.clone());
    }

    fn transfer_error_raised(&self, failure: &TransferFailure) {
        self.log.lock().unwrap().failures.push(failure.clone());
    }

    fn allowed_operations_changed(&self, allowed: AllowedOps) {
        self.log.lock().unwrap().allowed.push(allowed);
    }

    fn action_required(&self, action: &ManualAction) {
        self.log.lock().unwrap().actions.push(action.clone());
    }

    fn share_failed(&self, reason: &str) {
        self.log.lock().unwrap().share_failures.push(reason.to_string());
    }
}

/// Answers every prompt the same way.
pub struct FixedPrompt {
    pub choice: Choice,
    pub asked: usize,
}

impl FixedPrompt {
    pub fn new(choice: Choice) -> Self {
        Self { choice, asked: 0 }
    }
}

impl Prompt for FixedPrompt {
    fn choose(&mut self, _path: &str, _error: &SyncError) -> PromptAnswer {
        self.asked += 1;
        PromptAnswer {
            choice: self.choice,
            apply_to_all: false,
        }
    }
}

/// An activated share over temporary directories, driven by hand.
pub struct Harness {
    pub share: Share,
    pub rx: mpsc::Receiver<Message>,
    pub transport: Arc<FakeTransport>,
    pub observer: Arc<RecordingObserver>,
    pub root: TempDir,
    pub state: TempDir,
}

impl Harness {
    /// Activated, caught up with an empty event log and scanned.
    pub async fn new() -> Self {
        Self::with_tuning(Tuning::immediate()).await
    }

    pub async fn with_tuning(tuning: Tuning) -> Self {
        let mut harness = Self::inactive(tuning).await;
        harness.share.activate().await.unwrap();
        harness.catch_up(Vec::new()).await;
        harness
    }

    /// Built but not activated; the caller seeds the share root first.
    pub async fn inactive(tuning: Tuning) -> Self {
        let root = tempfile::tempdir().unwrap();
        let state = tempfile::tempdir().unwrap();
        let config = ShareConfig::new(root.path().to_path_buf(), state.path().to_path_buf(), TEST_USER)
            .with_tuning(tuning);
        let transport = Arc::new(FakeTransport::default());
        let observer = Arc::new(RecordingObserver::default());
        let (tx, rx) = runtime::channel();
        let share = Share::new(
            config,
            transport.clone(),
            memory_store().await,
            observer.clone(),
            tx,
        );
        Self {
            share,
            rx,
            transport,
            observer,
            root,
            state,
        }
    }

    /// Runs the pipeline and applies worker messages until the inbox stays
    /// quiet.
    pub async fn settle(&mut self) {
        for _ in 0..SETTLE_ROUNDS {
            self.share.run_pipeline().await;
            match tokio::time::timeout(SETTLE_QUIET, self.rx.recv()).await {
                Ok(Some(message)) => {
                    self.share.handle(message).await;
                    while let Ok(message) = self.rx.try_recv() {
                        self.share.handle(message).await;
                    }
                }
                Ok(None) | Err(_) => return,
            }
        }
    }

    pub async fn catch_up(&mut self, events: Vec<ServerEvent>) {
        self.share
            .handle(Message::ServerEvents {
                events,
                caught_up: true,
            })
            .await;
        self.settle().await;
    }

    pub fn write(&self, relative: &str, content: &[u8]) {
        let path = self.root.path().join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, content).unwrap();
    }

    pub fn read(&self, relative: &str) -> Option<Vec<u8>> {
        std::fs::read(self.root.path().join(relative)).ok()
    }
}

fn event(event_id: u64, commit_id: u64, user_id: u64, kind: EventKind) -> ServerEvent {
    ServerEvent {
        event_id,
        commit_id,
        user_id,
        date: 1_700_000_000,
        kind,
    }
}

pub fn create_dir_event(
    event_id: u64,
    commit_id: u64,
    inode: u64,
    parent_inode: u64,
    name: &str,
) -> ServerEvent {
    event(
        event_id,
        commit_id,
        OTHER_USER,
        EventKind::Create {
            inode,
            parent_inode,
            name: name.to_string(),
            is_dir: true,
        },
    )
}

pub fn create_file_event(
    event_id: u64,
    commit_id: u64,
    user_id: u64,
    inode: u64,
    parent_inode: u64,
    name: &str,
) -> ServerEvent {
    event(
        event_id,
        commit_id,
        user_id,
        EventKind::Create {
            inode,
            parent_inode,
            name: name.to_string(),
            is_dir: false,
        },
    )
}

pub fn commit_event(
    event_id: u64,
    commit_id: u64,
    user_id: u64,
    files: &[(u64, &[u8])],
) -> ServerEvent {
    event(
        event_id,
        commit_id,
        user_id,
        EventKind::Phase2Commit {
            files: files
                .iter()
                .map(|(inode, content)| CommitEntry {
                    inode: *inode,
                    size: content.len() as u64,
                    hash: hash_bytes(content),
                })
                .collect(),
        },
    )
}

pub fn delete_event(event_id: u64, commit_id: u64, user_id: u64, inode: u64) -> ServerEvent {
    event(event_id, commit_id, user_id, EventKind::Delete { inode })
}

/// A file another user created and committed in one go.
pub fn published_file(
    first_event_id: u64,
    commit_id: u64,
    inode: u64,
    parent_inode: u64,
    name: &str,
    content: &[u8],
) -> Vec<ServerEvent> {
    vec![
        create_file_event(first_event_id, commit_id, OTHER_USER, inode, parent_inode, name),
        commit_event(first_event_id + 1, commit_id, OTHER_USER, &[(inode, content)]),
    ]
}
