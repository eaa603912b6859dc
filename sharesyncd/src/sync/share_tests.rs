use std::time::Duration;

use sharesync_core::{DownloadRequest, Phase1Op, Phase2Message, RemoteError};

use super::*;
use crate::sync::config::Tuning;
use crate::sync::error::{Choice, ErrorKind};
use crate::sync::events::AllowedOps;
use crate::sync::local::{MARKER_PREFIX, hash_bytes};
use crate::sync::ops::ManualAction;
use crate::sync::reconcile::PathStatus;
use crate::sync::testing::{
    FixedPrompt, Harness, OTHER_USER, TEST_USER, commit_event, create_dir_event, create_file_event,
    delete_event, published_file,
};
use crate::sync::messages::DownloadEvent;
use crate::sync::transfer::download::cache_file_name;
use crate::sync::transfer::{ManagerState, TransferStatus};

fn status(h: &Harness, path: &str) -> Option<PathStatus> {
    h.share.status_view().status(path)
}

#[tokio::test]
async fn missing_server_file_is_downloaded_and_installed() {
    let mut h = Harness::new().await;
    h.transport.set_content(10, b"hello");

    h.catch_up(published_file(1, 5, 10, ROOT_INODE, "hello.txt", b"hello"))
        .await;

    assert_eq!(h.read("hello.txt").as_deref(), Some(&b"hello"[..]));
    assert_eq!(status(&h, "hello.txt"), Some(PathStatus::UnmodifiedCurrent));
    assert_eq!(
        h.transport.download_requests(),
        vec![DownloadRequest {
            inode: 10,
            commit_id: 5,
            offset: 0,
        }]
    );
    assert!(h.share.transfers.download.items.is_empty());
    assert!(h.share.transfers.files.is_empty());
    assert!(h.observer.progress().iter().any(|p| p.bytes_done == 5));
}

#[tokio::test]
async fn new_server_file_is_queued_within_one_pipeline_run() {
    let mut h = Harness::new().await;
    h.transport.set_content(10, b"hello");

    h.share
        .handle(Message::ServerEvents {
            events: published_file(1, 5, 10, ROOT_INODE, "hello.txt", b"hello"),
            caught_up: true,
        })
        .await;
    h.share.run_pipeline().await;

    assert_eq!(status(&h, "hello.txt"), Some(PathStatus::NotDownloaded));
    assert_eq!(h.share.transfers.download.items.len(), 1);
}

#[tokio::test]
async fn server_delete_keeps_a_file_edited_before_the_next_scan() {
    let mut h = Harness::new().await;
    h.transport.set_content(10, b"server");
    h.catch_up(published_file(1, 5, 10, ROOT_INODE, "doc.txt", b"server"))
        .await;
    assert_eq!(status(&h, "doc.txt"), Some(PathStatus::UnmodifiedCurrent));

    h.write("doc.txt", b"edited");
    h.catch_up(vec![delete_event(3, 6, OTHER_USER, 10)]).await;

    assert!(h.share.tree().lookup("doc.txt").is_none());
    assert_eq!(h.read("doc.txt").as_deref(), Some(&b"edited"[..]));
}

#[tokio::test]
async fn identical_local_copy_is_adopted_without_download() {
    let mut h = Harness::inactive(Tuning::immediate()).await;
    h.write("same.txt", b"shared");
    h.share.activate().await.unwrap();

    h.catch_up(published_file(1, 5, 10, ROOT_INODE, "same.txt", b"shared"))
        .await;

    assert_eq!(status(&h, "same.txt"), Some(PathStatus::UnmodifiedCurrent));
    assert!(h.transport.download_requests().is_empty());
}

#[tokio::test]
async fn ticket_failure_fails_every_queued_upload() {
    let mut h = Harness::new().await;
    let outside = tempfile::tempdir().unwrap();
    for name in ["a.txt", "b.txt"] {
        std::fs::write(outside.path().join(name), name).unwrap();
    }
    h.transport
        .fail_next_ticket(RemoteError::rejected("quota exceeded"));

    let mut prompt = FixedPrompt::new(Choice::Cancel);
    let orders = h
        .share
        .add_files(
            &[outside.path().join("a.txt"), outside.path().join("b.txt")],
            "",
            &mut prompt,
        )
        .await
        .unwrap();
    assert_eq!(orders.len(), 2);
    h.settle().await;

    let failures = h.observer.failures();
    assert_eq!(failures.len(), 2);
    assert!(failures
        .iter()
        .all(|f| f.reason == "quota exceeded" && f.kind == ErrorKind::ServerRejected));
    assert!(h.share.transfers.upload.items.is_empty());
    assert!(h.share.transfers.files.is_empty());
    assert!(h.share.transfers.upload.session.is_idle());
    assert!(h.transport.phase1_calls().is_empty());
    assert_eq!(prompt.asked, 0);
}

#[tokio::test]
async fn second_upload_of_the_same_path_is_refused() {
    let mut h = Harness::new().await;
    h.write("a.txt", b"one");

    h.share.enqueue_upload("a.txt").await.unwrap();
    let err = h.share.enqueue_upload("a.txt").await.unwrap_err();

    assert!(matches!(err, SyncError::InTransfer(ref path) if path == "a.txt"));
    assert_eq!(h.share.transfers.files.len(), 1);
}

#[tokio::test]
async fn upload_completes_on_server_echo() {
    let mut h = Harness::new().await;
    let outside = tempfile::tempdir().unwrap();
    let content: &[u8] = b"fresh content";
    std::fs::write(outside.path().join("a.txt"), content).unwrap();

    let mut prompt = FixedPrompt::new(Choice::Cancel);
    h.share
        .add_files(&[outside.path().join("a.txt")], "", &mut prompt)
        .await
        .unwrap();
    h.settle().await;

    assert_eq!(
        h.transport.phase1_calls(),
        vec![vec![Phase1Op::CreateFile {
            parent_inode: ROOT_INODE,
            name: "a.txt".into(),
            size: content.len() as u64,
            hash: hash_bytes(content),
        }]]
    );
    assert!(h.transport.phase2_messages().contains(&Phase2Message::Commit {
        inode: 1000,
        hash: hash_bytes(content),
    }));
    assert_eq!(h.share.transfers.upload.session.echo_commit(), Some(100));

    h.catch_up(vec![
        create_file_event(1, 100, TEST_USER, 1000, ROOT_INODE, "a.txt"),
        commit_event(2, 100, TEST_USER, &[(1000, content)]),
    ])
    .await;

    assert!(h.share.transfers.upload.items.is_empty());
    assert!(h.share.transfers.upload.session.is_idle());
    assert_eq!(status(&h, "a.txt"), Some(PathStatus::UnmodifiedCurrent));
    let staged = std::fs::read_dir(h.share.config().staging_dir()).unwrap().count();
    assert_eq!(staged, 0);
}

#[tokio::test]
async fn rejected_upload_reports_the_server_reason() {
    let mut h = Harness::new().await;
    let outside = tempfile::tempdir().unwrap();
    std::fs::write(outside.path().join("bad.txt"), b"x").unwrap();
    h.transport.reject_name("bad.txt", "name not allowed");

    let mut prompt = FixedPrompt::new(Choice::Cancel);
    h.share
        .add_files(&[outside.path().join("bad.txt")], "", &mut prompt)
        .await
        .unwrap();
    h.settle().await;

    let failures = h.observer.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].kind, ErrorKind::ServerRejected);
    assert_eq!(failures[0].reason, "name not allowed");
    assert!(h.share.transfers.upload.items.is_empty());
    assert!(h.share.transfers.upload.session.is_idle());
}

#[tokio::test]
async fn files_of_a_rejected_directory_fail_instead_of_waiting() {
    let mut h = Harness::new().await;
    let outside = tempfile::tempdir().unwrap();
    std::fs::create_dir(outside.path().join("pics")).unwrap();
    std::fs::write(outside.path().join("pics/a.jpg"), b"jpg").unwrap();
    h.transport.reject_name("pics", "name not allowed");

    let mut prompt = FixedPrompt::new(Choice::Cancel);
    h.share
        .add_files(&[outside.path().join("pics")], "", &mut prompt)
        .await
        .unwrap();
    h.settle().await;

    let failures = h.observer.failures();
    assert_eq!(failures.len(), 2);
    assert!(failures
        .iter()
        .any(|f| f.path == "pics" && f.kind == ErrorKind::ServerRejected));
    assert!(failures
        .iter()
        .any(|f| f.path == "pics/a.jpg" && f.kind == ErrorKind::IllegalOperation));
    assert!(h.share.transfers.upload.items.is_empty());
    assert!(h.share.transfers.metadata.items.is_empty());
    assert!(h.share.transfers.files.is_empty());
    assert_eq!(h.transport.phase1_calls().len(), 1);
}

#[tokio::test]
async fn short_upload_reply_fails_the_batch() {
    let mut h = Harness::new().await;
    let outside = tempfile::tempdir().unwrap();
    for name in ["a.txt", "b.txt"] {
        std::fs::write(outside.path().join(name), name).unwrap();
    }
    h.transport.short_phase1_replies();

    let mut prompt = FixedPrompt::new(Choice::Cancel);
    h.share
        .add_files(
            &[outside.path().join("a.txt"), outside.path().join("b.txt")],
            "",
            &mut prompt,
        )
        .await
        .unwrap();
    h.settle().await;

    let failures = h.observer.failures();
    assert_eq!(failures.len(), 2);
    assert!(failures
        .iter()
        .all(|f| f.reason == "server answered 1 of 2 operations"));
    assert!(h.share.transfers.upload.items.is_empty());
    assert!(h.share.transfers.upload.session.is_idle());
    assert!(h.transport.phase2_messages().is_empty());
}

#[tokio::test]
async fn short_metadata_reply_fails_the_batch() {
    let mut h = Harness::new().await;
    h.catch_up(vec![create_dir_event(1, 5, 20, ROOT_INODE, "docs")])
        .await;
    h.transport.short_phase1_replies();

    let mut prompt = FixedPrompt::new(Choice::Cancel);
    h.share
        .delete_paths(&["docs".to_string()], &mut prompt)
        .await
        .unwrap();
    h.settle().await;

    let failures = h.observer.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].reason, "server answered 0 of 1 operations");
    assert!(h.share.transfers.metadata.items.is_empty());
    assert!(h.share.transfers.metadata.session.is_idle());
    assert_eq!(h.share.tree().lookup("docs"), Some(20));
}

#[tokio::test]
async fn deactivation_ends_a_running_metadata_batch() {
    let mut h = Harness::new().await;
    h.catch_up(vec![create_dir_event(1, 5, 20, ROOT_INODE, "docs")])
        .await;
    h.transport.stall_phase1();

    let mut prompt = FixedPrompt::new(Choice::Cancel);
    h.share
        .delete_paths(&["docs".to_string()], &mut prompt)
        .await
        .unwrap();
    h.settle().await;
    assert!(h.share.transfers.metadata.session.in_batch());

    h.share.deactivate();
    h.settle().await;

    assert!(h.share.transfers.metadata.session.is_idle());
    assert!(h.share.transfers.metadata.items.is_empty());
    assert!(h.observer.failures().is_empty());
}

#[tokio::test]
async fn cancel_pending_download_is_dropped_quietly_when_the_batch_ends() {
    let mut h = Harness::new().await;
    h.transport.set_content(10, b"0123456789");
    h.transport.stall_after(4);
    h.catch_up(published_file(1, 5, 10, ROOT_INODE, "data.bin", b"0123456789"))
        .await;
    let order_id = *h.share.transfers.download.items.keys().next().unwrap();
    let batch_id = match h.share.transfers.download.session.state {
        ManagerState::Batch { batch_id } => batch_id,
        state => panic!("download not running: {state:?}"),
    };
    h.share
        .transfers
        .download
        .items
        .get_mut(&order_id)
        .unwrap()
        .record
        .status = TransferStatus::CancelPending;

    h.share
        .handle(Message::Download(DownloadEvent::BatchDone { batch_id }))
        .await;

    assert!(h.share.transfers.download.items.is_empty());
    assert!(h.share.transfers.files.is_empty());
    assert!(h.observer.failures().is_empty());
}

#[tokio::test]
async fn cancelled_download_keeps_partial_cache_and_is_not_requeued() {
    let mut h = Harness::new().await;
    h.transport.set_content(10, b"0123456789");
    h.transport.set_chunk_size(4);
    h.transport.stall_after(4);

    h.catch_up(published_file(1, 5, 10, ROOT_INODE, "data.bin", b"0123456789"))
        .await;
    let order_id = *h.share.transfers.download.items.keys().next().unwrap();
    assert_eq!(h.share.transfers.download.items[&order_id].record.bytes_done, 4);

    assert!(h.share.cancel_transfer(order_id).await);
    h.settle().await;

    assert!(!h.share.transfers.download.items.contains_key(&order_id));
    assert!(!h.share.transfers.files.contains(order_id));
    assert!(h.share.transfers.download.items.is_empty());
    let cached = h.share.config().cache_dir().join(cache_file_name(10, 5));
    assert_eq!(std::fs::metadata(cached).unwrap().len(), 4);
    assert!(h.read("data.bin").is_none());
    assert!(h.observer.failures().is_empty());
}

#[tokio::test]
async fn held_gate_stalls_the_pipeline() {
    let mut h = Harness::new().await;
    h.share.gate_enter("test");

    h.catch_up(vec![create_dir_event(1, 5, 20, ROOT_INODE, "late")])
        .await;
    assert!(h.share.tree().lookup("late").is_none());
    assert_eq!(h.share.server_ops.pending.len(), 1);

    h.share.gate_exit("test").await;
    assert!(h.share.tree().lookup("late").is_some());
    assert!(h.root.path().join("late").is_dir());
}

#[tokio::test]
async fn label_edit_holds_the_gate_once_until_it_ends() {
    let mut h = Harness::new().await;

    let err = h.share.rename_path("missing.txt", "other.txt").await.unwrap_err();
    assert!(matches!(err, SyncError::StaleView));
    h.share.begin_label_edit();
    assert_eq!(h.share.gate.depth, 1);

    h.share.end_label_edit().await;
    assert!(!h.share.gate_held());
}

#[tokio::test]
async fn applied_operation_waits_for_its_watcher_marker() {
    let tuning = Tuning {
        marker_timeout: Duration::from_secs(60),
        ..Tuning::immediate()
    };
    let mut h = Harness::with_tuning(tuning).await;
    h.share.set_watching(true);

    h.catch_up(vec![
        create_dir_event(1, 5, 20, ROOT_INODE, "docs"),
        create_dir_event(2, 6, 21, ROOT_INODE, "more"),
    ])
    .await;
    assert!(h.share.tree().lookup("docs").is_some());
    assert!(h.share.tree().lookup("more").is_none());
    let marker = h.share.server_ops.marker.unwrap();
    let marker_file = h.root.path().join(format!("{MARKER_PREFIX}{}", marker.id));
    assert!(marker_file.exists());

    h.share
        .handle(Message::MarkerObserved {
            marker_id: marker.id,
        })
        .await;
    h.settle().await;

    assert!(h.share.tree().lookup("more").is_some());
    assert!(!marker_file.exists());
}

#[tokio::test]
async fn blocked_operation_asks_for_action_and_retries_on_full_sync() {
    let tuning = Tuning {
        blocked_op_retry_delay: Duration::from_secs(60),
        ..Tuning::immediate()
    };
    let mut h = Harness::with_tuning(tuning).await;
    h.write("docs", b"in the way");

    h.catch_up(vec![create_dir_event(1, 5, 20, ROOT_INODE, "docs")])
        .await;
    assert_eq!(
        h.observer.actions(),
        vec![ManualAction::Rename {
            path: "docs".into()
        }]
    );
    assert!(h.share.tree().lookup("docs").is_none());
    assert_eq!(h.share.server_ops.pending.len(), 1);

    std::fs::remove_file(h.root.path().join("docs")).unwrap();
    h.share.handle(Message::Run { full_sync: true }).await;
    h.settle().await;

    assert!(h.share.tree().lookup("docs").is_some());
    assert!(h.root.path().join("docs").is_dir());
}

#[tokio::test]
async fn inconsistent_operation_fails_the_share() {
    let mut h = Harness::new().await;

    h.catch_up(vec![delete_event(1, 5, 2, 999)]).await;

    assert_eq!(h.observer.share_failures().len(), 1);
    assert_eq!(h.share.allowed_operations(), AllowedOps::None);
    assert!(h.share.health.permanent_failure.is_some());

    h.catch_up(published_file(2, 6, 10, ROOT_INODE, "after.txt", b"x"))
        .await;
    assert!(h.share.tree().lookup("after.txt").is_none());
}

#[tokio::test]
async fn server_delete_goes_through_metadata_and_its_echo() {
    let mut h = Harness::new().await;
    h.catch_up(vec![create_dir_event(1, 5, 20, ROOT_INODE, "docs")])
        .await;
    assert_eq!(status(&h, "docs"), Some(PathStatus::Directory));

    let mut prompt = FixedPrompt::new(Choice::Cancel);
    h.share
        .delete_paths(&["docs".to_string()], &mut prompt)
        .await
        .unwrap();
    h.settle().await;

    assert_eq!(
        h.transport.phase1_calls(),
        vec![vec![Phase1Op::Delete {
            inode: 20,
            commit_id: 5,
        }]]
    );
    assert_eq!(h.share.allowed_operations(), AllowedOps::DownloadOnly);

    h.catch_up(vec![delete_event(2, 100, TEST_USER, 20)]).await;

    assert!(h.share.transfers.metadata.items.is_empty());
    assert!(h.share.transfers.metadata.session.is_idle());
    assert!(h.share.tree().lookup("docs").is_none());
    assert!(!h.root.path().join("docs").exists());
    assert_eq!(h.share.allowed_operations(), AllowedOps::All);
}

#[tokio::test]
async fn local_only_delete_removes_the_file_directly() {
    let mut h = Harness::inactive(Tuning::immediate()).await;
    h.write("scratch.txt", b"mine");
    h.share.activate().await.unwrap();
    h.catch_up(Vec::new()).await;
    assert_eq!(status(&h, "scratch.txt"), Some(PathStatus::NotAdded));

    let mut prompt = FixedPrompt::new(Choice::Cancel);
    h.share
        .delete_paths(&["scratch.txt".to_string()], &mut prompt)
        .await
        .unwrap();

    assert!(h.read("scratch.txt").is_none());
    assert!(h.share.transfers.metadata.items.is_empty());
    assert!(h.transport.phase1_calls().is_empty());
}

#[tokio::test]
async fn local_directory_over_server_file_is_a_type_conflict() {
    let mut h = Harness::inactive(Tuning::immediate()).await;
    std::fs::create_dir(h.root.path().join("clash")).unwrap();
    h.share.activate().await.unwrap();

    h.catch_up(published_file(1, 5, 10, ROOT_INODE, "clash", b"x"))
        .await;

    assert_eq!(status(&h, "clash"), Some(PathStatus::DirFileConflict));
    assert!(h.share.status_view().type_conflict);
    assert_eq!(h.share.allowed_operations(), AllowedOps::DownloadOnly);
    assert!(h.transport.download_requests().is_empty());
}
