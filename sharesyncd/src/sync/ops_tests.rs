use super::*;
use crate::sync::store::memory_store;
use crate::sync::tree::LocalStatus;
use tempfile::tempdir;

fn header(op_id: u64, commit_id: u64, user_id: u64) -> OpHeader {
    OpHeader {
        op_id,
        event_id: op_id,
        commit_id,
        date: 1_700_000_000,
        user_id,
    }
}

fn create(op_id: u64, inode: u64, parent_inode: u64, name: &str, is_dir: bool) -> ServerOp {
    ServerOp {
        header: header(op_id, op_id, 1),
        kind: OpKind::Create {
            inode,
            parent_inode,
            name: name.into(),
            is_dir,
        },
    }
}

fn apply(tree: &mut ServerTree, op: &ServerOp) -> Result<(), OpError> {
    op.validate(tree)?;
    op.apply_to_tree(tree);
    Ok(())
}

#[test]
fn valid_sequences_keep_single_root_and_unique_names() {
    let mut tree = ServerTree::new();
    let ops = vec![
        create(1, 1, ROOT_INODE, "docs", true),
        create(2, 2, 1, "a.txt", false),
        create(3, 3, ROOT_INODE, "b.txt", false),
        ServerOp {
            header: header(4, 4, 1),
            kind: OpKind::Move {
                inode: 3,
                new_parent_inode: 1,
                new_name: "b.txt".into(),
            },
        },
        create(5, 4, 1, "sub", true),
        ServerOp {
            header: header(6, 6, 1),
            kind: OpKind::Move {
                inode: 2,
                new_parent_inode: 4,
                new_name: "a.txt".into(),
            },
        },
        ServerOp {
            header: header(7, 7, 1),
            kind: OpKind::Delete { inode: 4 },
        },
    ];
    for op in &ops {
        apply(&mut tree, op).unwrap();
        tree.check_invariants().unwrap();
    }
    assert_eq!(tree.lookup("docs/b.txt"), Some(3));
    assert!(!tree.contains(2));
    assert_eq!(tree.len(), 3);
}

#[test]
fn duplicate_name_is_rejected_unless_ghost() {
    let mut tree = ServerTree::new();
    apply(&mut tree, &create(1, 1, ROOT_INODE, "a.txt", false)).unwrap();
    assert!(tree.is_ghost(1));

    // A ghost is replaced by a later create under the same name.
    apply(&mut tree, &create(2, 2, ROOT_INODE, "a.txt", false)).unwrap();
    assert!(!tree.contains(1));
    assert_eq!(tree.lookup("a.txt"), Some(2));

    tree.add_uploader(
        UploaderKey {
            user_id: 1,
            commit_id: 9,
        },
        2,
    );
    let err = create(3, 3, ROOT_INODE, "a.txt", true).validate(&tree).unwrap_err();
    assert_eq!(
        err,
        OpError::DuplicateName {
            parent: ROOT_INODE,
            name: "a.txt".into()
        }
    );
}

#[test]
fn create_then_commit_clears_ghost() {
    let mut tree = ServerTree::new();
    let create = ServerOp {
        header: header(1, 40, 2),
        kind: OpKind::Create {
            inode: 5,
            parent_inode: ROOT_INODE,
            name: "a.txt".into(),
            is_dir: false,
        },
    };
    apply(&mut tree, &create).unwrap();
    assert_eq!(tree.path_of(5).as_deref(), Some("a.txt"));
    assert!(tree.is_ghost(5));

    let commit = ServerOp {
        header: header(2, 40, 2),
        kind: OpKind::Phase2Commit {
            files: vec![CommitEntry {
                inode: 5,
                size: 10,
                hash: "H".into(),
            }],
        },
    };
    apply(&mut tree, &commit).unwrap();
    let version = tree.file(5).unwrap().current_version.clone().unwrap();
    assert_eq!(version.commit_id, 40);
    assert_eq!(version.size, 10);
    assert_eq!(version.hash, "H");
    assert!(!tree.is_ghost(5));
}

#[test]
fn update_registers_uploader_until_commit() {
    let mut tree = ServerTree::new();
    apply(&mut tree, &create(1, 5, ROOT_INODE, "a.txt", false)).unwrap();
    let update = ServerOp {
        header: header(2, 50, 3),
        kind: OpKind::Update { inode: 5 },
    };
    apply(&mut tree, &update).unwrap();
    let key = UploaderKey {
        user_id: 3,
        commit_id: 50,
    };
    assert!(tree.file(5).unwrap().uploaders.contains(&key));
    assert!(!tree.is_ghost(5));

    let commit = ServerOp {
        header: header(3, 50, 3),
        kind: OpKind::Phase2Commit {
            files: vec![CommitEntry {
                inode: 5,
                size: 1,
                hash: "h".into(),
            }],
        },
    };
    apply(&mut tree, &commit).unwrap();
    assert!(tree.file(5).unwrap().uploaders.is_empty());
    assert!(tree.uploader(&key).is_none());
}

#[test]
fn commit_from_unknown_uploader_is_rejected() {
    let mut tree = ServerTree::new();
    apply(&mut tree, &create(1, 5, ROOT_INODE, "a.txt", false)).unwrap();
    let commit = ServerOp {
        header: header(2, 77, 9),
        kind: OpKind::Phase2Commit {
            files: vec![CommitEntry {
                inode: 5,
                size: 1,
                hash: "h".into(),
            }],
        },
    };
    assert_eq!(
        commit.validate(&tree),
        Err(OpError::WrongUploader {
            inode: 5,
            user_id: 9,
            commit_id: 77
        })
    );
}

#[test]
fn moving_directory_below_itself_fails_and_leaves_tree_alone() {
    let mut tree = ServerTree::new();
    apply(&mut tree, &create(1, 1, ROOT_INODE, "d", true)).unwrap();
    apply(&mut tree, &create(2, 2, 1, "child", true)).unwrap();
    let before = tree.clone();

    let op = ServerOp {
        header: header(3, 3, 1),
        kind: OpKind::Move {
            inode: 1,
            new_parent_inode: 2,
            new_name: "d".into(),
        },
    };
    let err = op.validate(&tree).unwrap_err();
    assert_eq!(err, OpError::SelfParent);
    assert_eq!(err.to_string(), "making directory child of itself");
    assert_eq!(tree, before);

    let onto_self = ServerOp {
        kind: OpKind::Move {
            inode: 1,
            new_parent_inode: 1,
            new_name: "d".into(),
        },
        ..op
    };
    assert_eq!(onto_self.validate(&tree), Err(OpError::SelfParent));
}

#[tokio::test]
async fn filesystem_effect_is_applied_once_per_op_id() {
    let dir = tempdir().unwrap();
    let store = memory_store().await;
    let mut tree = ServerTree::new();
    let op = create(1, 1, ROOT_INODE, "docs", true);
    op.validate(&tree).unwrap();

    let first = op
        .apply_to_filesystem_once(dir.path(), &tree, &store)
        .await
        .unwrap();
    assert_eq!(first, FsOutcome::Applied { touched: true });
    assert!(dir.path().join("docs").is_dir());

    // Simulate a crash after the marker was written but before the tree
    // was saved: the retry must not touch the disk again.
    std::fs::write(dir.path().join("docs/keep.txt"), b"x").unwrap();
    let second = op
        .apply_to_filesystem_once(dir.path(), &tree, &store)
        .await
        .unwrap();
    assert_eq!(second, FsOutcome::Skipped);
    assert!(dir.path().join("docs/keep.txt").exists());
    op.apply_to_tree(&mut tree);
    assert_eq!(tree.lookup("docs"), Some(1));
}

#[tokio::test]
async fn create_dir_over_local_file_requests_rename() {
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("docs"), b"file").unwrap();
    let tree = ServerTree::new();
    let outcome = create(1, 1, ROOT_INODE, "docs", true)
        .apply_to_filesystem(dir.path(), &tree)
        .await;
    assert_eq!(
        outcome,
        FsOutcome::Blocked(ManualAction::Rename {
            path: "docs".into()
        })
    );
}

#[tokio::test]
async fn delete_keeps_local_edits_and_nonempty_dirs() {
    let dir = tempdir().unwrap();
    let mut tree = ServerTree::new();
    apply(&mut tree, &create(1, 1, ROOT_INODE, "docs", true)).unwrap();
    apply(&mut tree, &create(2, 2, 1, "clean.txt", false)).unwrap();
    apply(&mut tree, &create(3, 3, 1, "edited.txt", false)).unwrap();
    tree.file_mut(2).unwrap().transient_status = LocalStatus::Unmodified;
    tree.file_mut(2).unwrap().download_version = Some(downloaded(2, b"a"));
    tree.file_mut(3).unwrap().transient_status = LocalStatus::Modified;
    std::fs::create_dir(dir.path().join("docs")).unwrap();
    std::fs::write(dir.path().join("docs/clean.txt"), b"a").unwrap();
    std::fs::write(dir.path().join("docs/edited.txt"), b"b").unwrap();

    let op = ServerOp {
        header: header(4, 4, 1),
        kind: OpKind::Delete { inode: 1 },
    };
    let outcome = op.apply_to_filesystem(dir.path(), &tree).await;
    assert_eq!(outcome, FsOutcome::Applied { touched: true });
    assert!(!dir.path().join("docs/clean.txt").exists());
    assert!(dir.path().join("docs/edited.txt").exists());
}

fn downloaded(inode: u64, content: &[u8]) -> FileVersion {
    FileVersion {
        inode,
        commit_id: inode,
        user_id: 1,
        date: 1_700_000_000,
        size: content.len() as u64,
        hash: local::hash_bytes(content),
    }
}

#[tokio::test]
async fn delete_keeps_a_file_edited_since_the_last_scan() {
    let dir = tempdir().unwrap();
    let mut tree = ServerTree::new();
    apply(&mut tree, &create(1, 1, ROOT_INODE, "doc.txt", false)).unwrap();
    {
        let file = tree.file_mut(1).unwrap();
        file.transient_status = LocalStatus::Unmodified;
        file.download_version = Some(downloaded(1, b"server"));
    }
    // Same size as the downloaded content, so only the hash tells them apart.
    std::fs::write(dir.path().join("doc.txt"), b"edited").unwrap();

    let op = ServerOp {
        header: header(2, 2, 1),
        kind: OpKind::Delete { inode: 1 },
    };
    let outcome = op.apply_to_filesystem(dir.path(), &tree).await;

    assert_eq!(outcome, FsOutcome::Applied { touched: false });
    assert_eq!(std::fs::read(dir.path().join("doc.txt")).unwrap(), b"edited");
}

#[tokio::test]
async fn delete_keeps_a_file_that_was_never_downloaded() {
    let dir = tempdir().unwrap();
    let mut tree = ServerTree::new();
    apply(&mut tree, &create(1, 1, ROOT_INODE, "doc.txt", false)).unwrap();
    tree.file_mut(1).unwrap().transient_status = LocalStatus::Unmodified;
    std::fs::write(dir.path().join("doc.txt"), b"mine").unwrap();

    let op = ServerOp {
        header: header(2, 2, 1),
        kind: OpKind::Delete { inode: 1 },
    };
    op.apply_to_filesystem(dir.path(), &tree).await;

    assert!(dir.path().join("doc.txt").exists());
}

#[tokio::test]
async fn move_renames_and_tolerates_replay() {
    let dir = tempdir().unwrap();
    let mut tree = ServerTree::new();
    apply(&mut tree, &create(1, 1, ROOT_INODE, "a", true)).unwrap();
    apply(&mut tree, &create(2, 2, ROOT_INODE, "b", true)).unwrap();
    std::fs::create_dir(dir.path().join("a")).unwrap();

    let op = ServerOp {
        header: header(3, 3, 1),
        kind: OpKind::Move {
            inode: 1,
            new_parent_inode: 2,
            new_name: "a2".into(),
        },
    };
    assert_eq!(
        op.apply_to_filesystem(dir.path(), &tree).await,
        FsOutcome::Applied { touched: true }
    );
    assert!(dir.path().join("b/a2").is_dir());
    assert_eq!(
        op.apply_to_filesystem(dir.path(), &tree).await,
        FsOutcome::Applied { touched: false }
    );
}

#[test]
fn io_errors_map_to_manual_actions() {
    let denied = io::Error::from(io::ErrorKind::PermissionDenied);
    assert_eq!(
        ManualAction::from_io("x", &denied),
        ManualAction::Close { path: "x".into() }
    );
    let exists = io::Error::from(io::ErrorKind::AlreadyExists);
    assert_eq!(
        ManualAction::from_io("x", &exists),
        ManualAction::Rename { path: "x".into() }
    );
}

#[test]
fn events_convert_with_local_op_id() {
    let event = ServerEvent {
        event_id: 90,
        commit_id: 4,
        user_id: 2,
        date: 5,
        kind: EventKind::Delete { inode: 8 },
    };
    let op = ServerOp::from_event(3, event);
    assert_eq!(op.header.op_id, 3);
    assert_eq!(op.header.event_id, 90);
    assert_eq!(op.kind, OpKind::Delete { inode: 8 });
    assert_eq!(op.name(), "delete");
}
