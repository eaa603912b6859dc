//! Three-way merge of the server tree, the local snapshot and the cached
//! per-file comparison results into one status per path.

use std::collections::{BTreeMap, BTreeSet};

use super::local::{LocalEntry, LocalTree};
use super::tree::{LocalStatus, ServerTree};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathStatus {
    Undetermined,
    ServerGhost,
    NotDownloaded,
    NotAdded,
    ModifiedCurrent,
    ModifiedStale,
    UnmodifiedCurrent,
    UnmodifiedStale,
    Directory,
    DirFileConflict,
    FileDirConflict,
}

impl PathStatus {
    pub fn is_type_conflict(&self) -> bool {
        matches!(self, PathStatus::DirFileConflict | PathStatus::FileDirConflict)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusPath {
    pub path: String,
    pub status: PathStatus,
    pub server_inode: Option<u64>,
    pub local: Option<LocalEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusView {
    pub paths: BTreeMap<String, StatusPath>,
    /// Files whose comparison status must be recomputed before they can be
    /// classified.
    pub recheck: BTreeSet<u64>,
    pub type_conflict: bool,
}

impl StatusView {
    pub fn get(&self, path: &str) -> Option<&StatusPath> {
        self.paths.get(path)
    }

    pub fn status(&self, path: &str) -> Option<PathStatus> {
        self.get(path).map(|entry| entry.status)
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StatusPath> {
        self.paths.values()
    }
}

pub fn reconcile(server: &ServerTree, local: &LocalTree) -> StatusView {
    let mut view = StatusView::default();
    let mut remote: BTreeMap<String, u64> = server.walk().into_iter().collect();

    for entry in local.iter() {
        let inode = remote.remove(&entry.path);
        let status = classify_local(server, entry, inode, &mut view.recheck);
        view.paths.insert(
            entry.path.clone(),
            StatusPath {
                path: entry.path.clone(),
                status,
                server_inode: inode,
                local: Some(entry.clone()),
            },
        );
    }

    for (path, inode) in remote {
        let status = match server.get(inode) {
            Some(object) if object.is_dir() => PathStatus::Directory,
            _ if server.is_ghost(inode) => PathStatus::ServerGhost,
            _ => PathStatus::NotDownloaded,
        };
        view.paths.insert(
            path.clone(),
            StatusPath {
                path,
                status,
                server_inode: Some(inode),
                local: None,
            },
        );
    }

    view.type_conflict = view.paths.values().any(|entry| entry.status.is_type_conflict());
    view
}

fn classify_local(
    server: &ServerTree,
    entry: &LocalEntry,
    inode: Option<u64>,
    recheck: &mut BTreeSet<u64>,
) -> PathStatus {
    let object = inode.and_then(|inode| server.get(inode));
    if entry.is_dir {
        return match object {
            Some(object) if !object.is_dir() && !server.is_ghost(object.inode) => {
                PathStatus::DirFileConflict
            }
            _ => PathStatus::Directory,
        };
    }
    let Some(object) = object else {
        return PathStatus::NotAdded;
    };
    let Some(file) = object.as_file() else {
        return PathStatus::FileDirConflict;
    };
    let Some(current) = &file.current_version else {
        return PathStatus::NotAdded;
    };
    let current_downloaded = file
        .download_version
        .as_ref()
        .is_some_and(|downloaded| downloaded.commit_id == current.commit_id);
    match file.comparison_status() {
        LocalStatus::Unmodified if current_downloaded => PathStatus::UnmodifiedCurrent,
        LocalStatus::Unmodified => PathStatus::UnmodifiedStale,
        LocalStatus::Modified if current_downloaded => PathStatus::ModifiedCurrent,
        LocalStatus::Modified => PathStatus::ModifiedStale,
        LocalStatus::None | LocalStatus::Absent | LocalStatus::Error => {
            recheck.insert(object.inode);
            PathStatus::Undetermined
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::local::{compare, hash_bytes};
    use crate::sync::tree::{FileVersion, ROOT_INODE, ServerObject};

    fn version(inode: u64, commit_id: u64, content: &[u8]) -> FileVersion {
        FileVersion {
            inode,
            commit_id,
            user_id: 2,
            date: 0,
            size: content.len() as u64,
            hash: hash_bytes(content),
        }
    }

    fn local_file(path: &str) -> LocalEntry {
        LocalEntry {
            path: path.into(),
            is_dir: false,
            size: 2,
            mtime: 0,
            local_id: 9,
        }
    }

    fn local_dir(path: &str) -> LocalEntry {
        LocalEntry {
            is_dir: true,
            ..local_file(path)
        }
    }

    #[test]
    fn local_edit_against_never_downloaded_server_file_is_stale_conflict() {
        let mut server = ServerTree::new();
        server.insert(ServerObject::new_file(1, ROOT_INODE, "x"));
        let file = server.file_mut(1).unwrap();
        file.current_version = Some(version(1, 3, b"H2"));
        file.transient_status = compare(file.download_version.as_ref(), &hash_bytes(b"H1"));

        let view = reconcile(&server, &LocalTree::from_entries([local_file("x")]));
        assert_eq!(view.status("x"), Some(PathStatus::ModifiedStale));
        assert!(!view.type_conflict);
    }

    #[test]
    fn classifies_every_combination() {
        let mut server = ServerTree::new();
        server.insert(ServerObject::new_dir(1, ROOT_INODE, "dir"));
        server.insert(ServerObject::new_file(2, ROOT_INODE, "ghost"));
        server.insert(ServerObject::new_file(3, ROOT_INODE, "remote"));
        server.insert(ServerObject::new_file(4, ROOT_INODE, "same"));
        server.insert(ServerObject::new_file(5, ROOT_INODE, "newer"));
        server.insert(ServerObject::new_file(6, ROOT_INODE, "unknown"));
        server.insert(ServerObject::new_file(7, ROOT_INODE, "edited"));
        for inode in 3..=7 {
            server.file_mut(inode).unwrap().current_version = Some(version(inode, 5, b"v5"));
        }
        {
            let same = server.file_mut(4).unwrap();
            same.download_version = Some(version(4, 5, b"v5"));
            same.persistent_status = LocalStatus::Unmodified;
        }
        {
            let newer = server.file_mut(5).unwrap();
            newer.download_version = Some(version(5, 4, b"v4"));
            newer.transient_status = LocalStatus::Unmodified;
        }
        {
            let edited = server.file_mut(7).unwrap();
            edited.download_version = Some(version(7, 5, b"v5"));
            edited.transient_status = LocalStatus::Modified;
        }

        let local = LocalTree::from_entries([
            local_file("same"),
            local_file("newer"),
            local_file("unknown"),
            local_file("edited"),
            local_file("fresh"),
            local_dir("ghost"),
        ]);
        let view = reconcile(&server, &local);

        assert_eq!(view.status("dir"), Some(PathStatus::Directory));
        assert_eq!(view.status("ghost"), Some(PathStatus::Directory));
        assert_eq!(view.status("remote"), Some(PathStatus::NotDownloaded));
        assert_eq!(view.status("same"), Some(PathStatus::UnmodifiedCurrent));
        assert_eq!(view.status("newer"), Some(PathStatus::UnmodifiedStale));
        assert_eq!(view.status("unknown"), Some(PathStatus::Undetermined));
        assert_eq!(view.status("edited"), Some(PathStatus::ModifiedCurrent));
        assert_eq!(view.status("fresh"), Some(PathStatus::NotAdded));
        assert_eq!(view.recheck, BTreeSet::from([6]));
    }

    #[test]
    fn ghost_without_local_copy_is_reported() {
        let mut server = ServerTree::new();
        server.insert(ServerObject::new_file(2, ROOT_INODE, "ghost"));
        let view = reconcile(&server, &LocalTree::new());
        assert_eq!(view.status("ghost"), Some(PathStatus::ServerGhost));
    }

    #[test]
    fn type_conflicts_raise_share_flag() {
        let mut server = ServerTree::new();
        server.insert(ServerObject::new_dir(1, ROOT_INODE, "a"));
        server.insert(ServerObject::new_file(2, ROOT_INODE, "b"));
        server.file_mut(2).unwrap().current_version = Some(version(2, 1, b"b"));

        let view = reconcile(
            &server,
            &LocalTree::from_entries([local_file("a"), local_dir("b")]),
        );
        assert_eq!(view.status("a"), Some(PathStatus::FileDirConflict));
        assert_eq!(view.status("b"), Some(PathStatus::DirFileConflict));
        assert!(view.type_conflict);
    }

    #[test]
    fn reconciling_twice_is_identical() {
        let mut server = ServerTree::new();
        server.insert(ServerObject::new_dir(1, ROOT_INODE, "docs"));
        server.insert(ServerObject::new_file(2, 1, "a.txt"));
        server.file_mut(2).unwrap().current_version = Some(version(2, 1, b"a"));
        let local = LocalTree::from_entries([local_dir("docs"), local_file("docs/a.txt")]);

        let first = reconcile(&server, &local);
        let second = reconcile(&server, &local);
        assert_eq!(first, second);
    }
}
