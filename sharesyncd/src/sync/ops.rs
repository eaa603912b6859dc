//! Server operations: validated mutations of the server tree and their
//! best-effort mirror on the local filesystem.

use std::io;
use std::path::{Path, PathBuf};

use sharesync_core::{CommitEntry, EventKind, ServerEvent};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, warn};

use super::local;
use super::paths::{join, local_path};
use super::store::{StateStore, StoreError};
use super::tree::{
    FileVersion, LocalStatus, ObjectKind, ROOT_INODE, ServerObject, ServerTree, UploaderKey,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OpError {
    #[error("object {0} already exists")]
    DuplicateInode(u64),
    #[error("directory {parent} already contains {name}")]
    DuplicateName { parent: u64, name: String },
    #[error("parent directory {0} does not exist")]
    MissingParent(u64),
    #[error("object {0} does not exist")]
    MissingObject(u64),
    #[error("object {0} is not a directory")]
    NotADirectory(u64),
    #[error("object {0} is not a file")]
    NotAFile(u64),
    #[error("object name is empty or contains a slash")]
    InvalidName,
    #[error("the root directory cannot be modified")]
    RootObject,
    #[error("making directory child of itself")]
    SelfParent,
    #[error("file {inode} is not being uploaded by user {user_id} under commit {commit_id}")]
    WrongUploader {
        inode: u64,
        user_id: u64,
        commit_id: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpHeader {
    pub op_id: u64,
    pub event_id: u64,
    pub commit_id: u64,
    pub date: i64,
    pub user_id: u64,
}

impl OpHeader {
    fn uploader_key(&self) -> UploaderKey {
        UploaderKey {
            user_id: self.user_id,
            commit_id: self.commit_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpKind {
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

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerOp {
    pub header: OpHeader,
    pub kind: OpKind,
}

/// What would unblock a filesystem effect that could not be applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManualAction {
    /// Something is in the way at `path`; the user should rename it.
    Rename { path: String },
    /// `path` is locked by another program; the user should close it.
    Close { path: String },
    Unexpected { path: String, message: String },
}

impl ManualAction {
    pub fn path(&self) -> &str {
        match self {
            ManualAction::Rename { path }
            | ManualAction::Close { path }
            | ManualAction::Unexpected { path, .. } => path,
        }
    }

    fn from_io(path: &str, err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::PermissionDenied => ManualAction::Close {
                path: path.to_string(),
            },
            io::ErrorKind::AlreadyExists => ManualAction::Rename {
                path: path.to_string(),
            },
            _ => ManualAction::Unexpected {
                path: path.to_string(),
                message: err.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsOutcome {
    /// Already applied in an earlier session.
    Skipped,
    Applied { touched: bool },
    Blocked(ManualAction),
}

impl FsOutcome {
    pub fn touched(&self) -> bool {
        matches!(self, FsOutcome::Applied { touched: true })
    }
}

fn check_name(name: &str) -> Result<(), OpError> {
    if name.is_empty() || name.contains('/') || name == "." || name == ".." {
        return Err(OpError::InvalidName);
    }
    Ok(())
}

/// Fails unless `name` is free in `parent` or held by a ghost (or by
/// `moving` itself).
fn check_free_name(
    tree: &ServerTree,
    parent: u64,
    name: &str,
    moving: Option<u64>,
) -> Result<(), OpError> {
    match tree.child(parent, name) {
        Some(existing) if Some(existing) == moving || tree.is_ghost(existing) => Ok(()),
        Some(_) => Err(OpError::DuplicateName {
            parent,
            name: name.to_string(),
        }),
        None => Ok(()),
    }
}

fn check_parent(tree: &ServerTree, parent: u64) -> Result<(), OpError> {
    match tree.get(parent) {
        None => Err(OpError::MissingParent(parent)),
        Some(object) if !object.is_dir() => Err(OpError::NotADirectory(parent)),
        Some(_) => Ok(()),
    }
}

impl ServerOp {
    pub fn from_event(op_id: u64, event: ServerEvent) -> Self {
        let header = OpHeader {
            op_id,
            event_id: event.event_id,
            commit_id: event.commit_id,
            date: event.date,
            user_id: event.user_id,
        };
        let kind = match event.kind {
            EventKind::Create {
                inode,
                parent_inode,
                name,
                is_dir,
            } => OpKind::Create {
                inode,
                parent_inode,
                name,
                is_dir,
            },
            EventKind::Update { inode } => OpKind::Update { inode },
            EventKind::Delete { inode } => OpKind::Delete { inode },
            EventKind::Move {
                inode,
                new_parent_inode,
                new_name,
            } => OpKind::Move {
                inode,
                new_parent_inode,
                new_name,
            },
            EventKind::Phase2Commit { files } => OpKind::Phase2Commit { files },
        };
        Self { header, kind }
    }

    pub fn name(&self) -> &'static str {
        match self.kind {
            OpKind::Create { .. } => "create",
            OpKind::Update { .. } => "update",
            OpKind::Delete { .. } => "delete",
            OpKind::Move { .. } => "move",
            OpKind::Phase2Commit { .. } => "phase2-commit",
        }
    }

    /// Checks the operation against the current tree without changing it.
    pub fn validate(&self, tree: &ServerTree) -> Result<(), OpError> {
        match &self.kind {
            OpKind::Create {
                inode,
                parent_inode,
                name,
                ..
            } => {
                if tree.contains(*inode) {
                    return Err(OpError::DuplicateInode(*inode));
                }
                check_name(name)?;
                check_parent(tree, *parent_inode)?;
                check_free_name(tree, *parent_inode, name, None)
            }
            OpKind::Update { inode } => match tree.get(*inode) {
                None => Err(OpError::MissingObject(*inode)),
                Some(object) if object.is_dir() => Err(OpError::NotAFile(*inode)),
                Some(_) => Ok(()),
            },
            OpKind::Delete { inode } => {
                if *inode == ROOT_INODE {
                    return Err(OpError::RootObject);
                }
                if !tree.contains(*inode) {
                    return Err(OpError::MissingObject(*inode));
                }
                Ok(())
            }
            OpKind::Move {
                inode,
                new_parent_inode,
                new_name,
            } => {
                if *inode == ROOT_INODE {
                    return Err(OpError::RootObject);
                }
                let object = tree.get(*inode).ok_or(OpError::MissingObject(*inode))?;
                check_name(new_name)?;
                check_parent(tree, *new_parent_inode)?;
                if object.is_dir() && tree.is_ancestor(*inode, *new_parent_inode) {
                    return Err(OpError::SelfParent);
                }
                check_free_name(tree, *new_parent_inode, new_name, Some(*inode))
            }
            OpKind::Phase2Commit { files } => {
                let key = self.header.uploader_key();
                for entry in files {
                    let object = tree
                        .get(entry.inode)
                        .ok_or(OpError::MissingObject(entry.inode))?;
                    let file = object.as_file().ok_or(OpError::NotAFile(entry.inode))?;
                    let created_by_commit = object.creator_id == key.user_id
                        && object.commit_id == key.commit_id;
                    if !file.uploaders.contains(&key) && !created_by_commit {
                        return Err(OpError::WrongUploader {
                            inode: entry.inode,
                            user_id: key.user_id,
                            commit_id: key.commit_id,
                        });
                    }
                }
                Ok(())
            }
        }
    }

    /// Mutates the tree. Must only be called after [`ServerOp::validate`]
    /// succeeded against the same tree.
    pub fn apply_to_tree(&self, tree: &mut ServerTree) {
        let header = &self.header;
        match &self.kind {
            OpKind::Create {
                inode,
                parent_inode,
                name,
                is_dir,
            } => {
                if let Some(ghost) = tree.child(*parent_inode, name)
                    && tree.is_ghost(ghost)
                {
                    debug!(ghost, name = %name, "replacing ghost file");
                    tree.remove_subtree(ghost);
                }
                let mut object = if *is_dir {
                    ServerObject::new_dir(*inode, *parent_inode, name.clone())
                } else {
                    ServerObject::new_file(*inode, *parent_inode, name.clone())
                };
                object.commit_id = header.commit_id;
                object.creator_id = header.user_id;
                object.creation_date = OffsetDateTime::from_unix_timestamp(header.date)
                    .unwrap_or(OffsetDateTime::UNIX_EPOCH);
                if !tree.insert(object) {
                    warn!(inode, parent_inode, "create applied under a missing parent");
                }
            }
            OpKind::Update { inode } => {
                tree.add_uploader(header.uploader_key(), *inode);
            }
            OpKind::Delete { inode } => {
                tree.remove_subtree(*inode);
            }
            OpKind::Move {
                inode,
                new_parent_inode,
                new_name,
            } => {
                if let Some(ghost) = tree.child(*new_parent_inode, new_name)
                    && ghost != *inode
                    && tree.is_ghost(ghost)
                {
                    tree.remove_subtree(ghost);
                }
                tree.relocate(*inode, *new_parent_inode, new_name);
                if let Some(object) = tree.get_mut(*inode) {
                    object.commit_id = header.commit_id;
                }
            }
            OpKind::Phase2Commit { files } => {
                for entry in files {
                    if let Some(object) = tree.get_mut(entry.inode) {
                        object.commit_id = header.commit_id;
                        if let ObjectKind::File(file) = &mut object.kind {
                            file.current_version = Some(FileVersion {
                                inode: entry.inode,
                                commit_id: header.commit_id,
                                user_id: header.user_id,
                                date: header.date,
                                size: entry.size,
                                hash: entry.hash.clone(),
                            });
                        }
                    }
                }
                tree.remove_uploader(&header.uploader_key());
            }
        }
    }

    /// Mirrors the operation on disk. Called before [`ServerOp::apply_to_tree`]
    /// so the tree still holds the pre-operation paths.
    pub async fn apply_to_filesystem(&self, root: &Path, tree: &ServerTree) -> FsOutcome {
        match &self.kind {
            OpKind::Create {
                parent_inode,
                name,
                is_dir: true,
                ..
            } => {
                let Some(parent) = tree.path_of(*parent_inode) else {
                    return FsOutcome::Applied { touched: false };
                };
                create_dir(root, &join(&parent, name)).await
            }
            OpKind::Create { .. } | OpKind::Update { .. } | OpKind::Phase2Commit { .. } => {
                FsOutcome::Applied { touched: false }
            }
            OpKind::Delete { inode } => delete_subtree(root, tree, *inode).await,
            OpKind::Move {
                inode,
                new_parent_inode,
                new_name,
            } => {
                let (Some(old), Some(parent)) = (tree.path_of(*inode), tree.path_of(*new_parent_inode))
                else {
                    return FsOutcome::Applied { touched: false };
                };
                move_path(root, &old, &join(&parent, new_name)).await
            }
        }
    }

    /// [`ServerOp::apply_to_filesystem`] guarded by the persisted applied-op
    /// marker, so a replayed operation never touches the disk twice.
    pub async fn apply_to_filesystem_once(
        &self,
        root: &Path,
        tree: &ServerTree,
        store: &StateStore,
    ) -> Result<FsOutcome, StoreError> {
        if self.header.op_id <= store.last_applied_op().await? {
            return Ok(FsOutcome::Skipped);
        }
        let outcome = self.apply_to_filesystem(root, tree).await;
        if !matches!(outcome, FsOutcome::Blocked(_)) {
            store.advance_applied_op(self.header.op_id).await?;
        }
        Ok(outcome)
    }
}

async fn create_dir(root: &Path, relative: &str) -> FsOutcome {
    let path = local_path(root, relative);
    match tokio::fs::metadata(&path).await {
        Ok(metadata) if metadata.is_dir() => return FsOutcome::Applied { touched: false },
        Ok(_) => {
            return FsOutcome::Blocked(ManualAction::Rename {
                path: relative.to_string(),
            });
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return FsOutcome::Blocked(ManualAction::from_io(relative, &err)),
    }
    match tokio::fs::create_dir_all(&path).await {
        Ok(()) => FsOutcome::Applied { touched: true },
        Err(err) => FsOutcome::Blocked(ManualAction::from_io(relative, &err)),
    }
}

/// Removes local files that still match their downloaded version, then
/// every directory of the subtree that ended up empty. Local edits survive.
async fn delete_subtree(root: &Path, tree: &ServerTree, inode: u64) -> FsOutcome {
    let mut touched = false;
    let mut dirs = Vec::new();
    for member in tree.subtree(inode) {
        let Some(relative) = tree.path_of(member) else {
            continue;
        };
        let Some(object) = tree.get(member) else {
            continue;
        };
        match &object.kind {
            ObjectKind::Dir(_) => dirs.push(relative),
            ObjectKind::File(file) => {
                if file.comparison_status() != LocalStatus::Unmodified {
                    continue;
                }
                let expected = file.download_version.as_ref().map(|v| v.hash.clone());
                if !still_downloaded(root, &relative, expected).await {
                    debug!(path = %relative, "keeping locally edited file of a deleted object");
                    continue;
                }
                match tokio::fs::remove_file(local_path(root, &relative)).await {
                    Ok(()) => touched = true,
                    Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                    Err(err) => return FsOutcome::Blocked(ManualAction::from_io(&relative, &err)),
                }
            }
        }
    }
    for relative in dirs.iter().rev() {
        match tokio::fs::remove_dir(local_path(root, relative)).await {
            Ok(()) => touched = true,
            Err(err) if err.kind() == io::ErrorKind::PermissionDenied => {
                return FsOutcome::Blocked(ManualAction::from_io(relative, &err));
            }
            Err(_) => {}
        }
    }
    FsOutcome::Applied { touched }
}

/// Re-hashes the file on disk: the recorded status may predate an edit the
/// scanner has not seen yet.
async fn still_downloaded(root: &Path, relative: &str, expected: Option<String>) -> bool {
    let Some(expected) = expected else {
        return false;
    };
    let path = local_path(root, relative);
    let hashed = tokio::task::spawn_blocking(move || local::hash_file(&path)).await;
    match hashed {
        Ok(Ok(hash)) => hash == expected,
        Ok(Err(err)) => {
            debug!(path = %relative, error = %err, "cannot hash file before delete");
            false
        }
        Err(err) => {
            warn!(path = %relative, error = %err, "hash task failed");
            false
        }
    }
}

async fn move_path(root: &Path, old: &str, new: &str) -> FsOutcome {
    if old == new {
        return FsOutcome::Applied { touched: false };
    }
    let from = local_path(root, old);
    let to: PathBuf = local_path(root, new);
    let source_exists = tokio::fs::symlink_metadata(&from).await.is_ok();
    let target_exists = tokio::fs::symlink_metadata(&to).await.is_ok();
    match (source_exists, target_exists) {
        (false, _) => FsOutcome::Applied { touched: false },
        (true, true) => FsOutcome::Blocked(ManualAction::Rename {
            path: new.to_string(),
        }),
        (true, false) => {
            if let Some(parent) = to.parent()
                && let Err(err) = tokio::fs::create_dir_all(parent).await
            {
                return FsOutcome::Blocked(ManualAction::from_io(new, &err));
            }
            match tokio::fs::rename(&from, &to).await {
                Ok(()) => FsOutcome::Applied { touched: true },
                Err(err) => FsOutcome::Blocked(ManualAction::from_io(old, &err)),
            }
        }
    }
}

#[cfg(test)]
#[path = "ops_tests.rs"]
mod tests;
