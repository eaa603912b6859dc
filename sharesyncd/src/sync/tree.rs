//! In-memory mirror of the server's directory tree.
//!
//! Objects are indexed by inode. Directories keep their children ordered by
//! name; names are unique within one directory. Inode 0 is the root, a
//! nameless directory without a parent.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use thiserror::Error;
use time::OffsetDateTime;

pub const ROOT_INODE: u64 = 0;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TreeError {
    #[error("object {0} does not exist")]
    NoSuchObject(u64),
    #[error("object {0} is not a directory")]
    NotADirectory(u64),
    #[error("root object is missing or malformed")]
    BadRoot,
    #[error("object {child} is not listed by its parent {parent}")]
    Orphan { parent: u64, child: u64 },
    #[error("directory {parent} lists {child} under the wrong name")]
    NameMismatch { parent: u64, child: u64 },
}

/// Result of comparing a local copy with the file's download version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LocalStatus {
    #[default]
    None,
    Modified,
    Unmodified,
    Absent,
    Error,
}

impl LocalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LocalStatus::None => "none",
            LocalStatus::Modified => "modified",
            LocalStatus::Unmodified => "unmodified",
            LocalStatus::Absent => "absent",
            LocalStatus::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "none" => Some(LocalStatus::None),
            "modified" => Some(LocalStatus::Modified),
            "unmodified" => Some(LocalStatus::Unmodified),
            "absent" => Some(LocalStatus::Absent),
            "error" => Some(LocalStatus::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileVersion {
    pub inode: u64,
    pub commit_id: u64,
    pub user_id: u64,
    pub date: i64,
    pub size: u64,
    pub hash: String,
}

/// Local file attributes recorded at the last content check, used to skip
/// re-hashing files that did not change.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LocalCache {
    pub size: u64,
    pub mtime: i64,
    pub local_id: u64,
    pub hash: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UploaderKey {
    pub user_id: u64,
    pub commit_id: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Uploader {
    pub files: BTreeSet<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerFile {
    pub uploaders: BTreeSet<UploaderKey>,
    pub current_version: Option<FileVersion>,
    pub download_version: Option<FileVersion>,
    pub persistent_status: LocalStatus,
    pub transient_status: LocalStatus,
    pub local_cache: Option<LocalCache>,
}

impl ServerFile {
    pub fn is_ghost(&self) -> bool {
        self.current_version.is_none() && self.uploaders.is_empty()
    }

    /// The status verified during this session, falling back to the one
    /// restored from the state store.
    pub fn comparison_status(&self) -> LocalStatus {
        match self.transient_status {
            LocalStatus::None => self.persistent_status,
            status => status,
        }
    }

    /// True when the local copy is known to hold the current server content.
    pub fn is_current(&self) -> bool {
        match (&self.current_version, &self.download_version) {
            (Some(current), Some(downloaded)) => current.commit_id == downloaded.commit_id,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerDirectory {
    pub expanded: bool,
    children: BTreeMap<String, u64>,
}

impl ServerDirectory {
    pub fn child(&self, name: &str) -> Option<u64> {
        self.children.get(name).copied()
    }

    pub fn children(&self) -> impl Iterator<Item = (&str, u64)> {
        self.children
            .iter()
            .map(|(name, inode)| (name.as_str(), *inode))
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectKind {
    Dir(ServerDirectory),
    File(ServerFile),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerObject {
    pub inode: u64,
    pub parent_inode: Option<u64>,
    pub commit_id: u64,
    pub creator_id: u64,
    pub creation_date: OffsetDateTime,
    pub name: String,
    pub kind: ObjectKind,
}

impl ServerObject {
    pub fn new_dir(inode: u64, parent_inode: u64, name: impl Into<String>) -> Self {
        Self {
            inode,
            parent_inode: Some(parent_inode),
            commit_id: 0,
            creator_id: 0,
            creation_date: OffsetDateTime::UNIX_EPOCH,
            name: name.into(),
            kind: ObjectKind::Dir(ServerDirectory::default()),
        }
    }

    pub fn new_file(inode: u64, parent_inode: u64, name: impl Into<String>) -> Self {
        Self {
            kind: ObjectKind::File(ServerFile::default()),
            ..Self::new_dir(inode, parent_inode, name)
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.kind, ObjectKind::Dir(_))
    }

    pub fn as_dir(&self) -> Option<&ServerDirectory> {
        match &self.kind {
            ObjectKind::Dir(dir) => Some(dir),
            ObjectKind::File(_) => None,
        }
    }

    pub fn as_file(&self) -> Option<&ServerFile> {
        match &self.kind {
            ObjectKind::File(file) => Some(file),
            ObjectKind::Dir(_) => None,
        }
    }

    pub fn as_file_mut(&mut self) -> Option<&mut ServerFile> {
        match &mut self.kind {
            ObjectKind::File(file) => Some(file),
            ObjectKind::Dir(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerTree {
    objects: HashMap<u64, ServerObject>,
    uploaders: BTreeMap<UploaderKey, Uploader>,
}

impl Default for ServerTree {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerTree {
    pub fn new() -> Self {
        let root = ServerObject {
            parent_inode: None,
            ..ServerObject::new_dir(ROOT_INODE, ROOT_INODE, "")
        };
        Self {
            objects: HashMap::from([(ROOT_INODE, root)]),
            uploaders: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.len() == 1
    }

    pub fn contains(&self, inode: u64) -> bool {
        self.objects.contains_key(&inode)
    }

    pub fn get(&self, inode: u64) -> Option<&ServerObject> {
        self.objects.get(&inode)
    }

    pub fn get_mut(&mut self, inode: u64) -> Option<&mut ServerObject> {
        self.objects.get_mut(&inode)
    }

    pub fn file(&self, inode: u64) -> Option<&ServerFile> {
        self.get(inode).and_then(ServerObject::as_file)
    }

    pub fn file_mut(&mut self, inode: u64) -> Option<&mut ServerFile> {
        self.get_mut(inode).and_then(ServerObject::as_file_mut)
    }

    pub fn dir(&self, inode: u64) -> Option<&ServerDirectory> {
        self.get(inode).and_then(ServerObject::as_dir)
    }

    pub fn is_dir(&self, inode: u64) -> bool {
        self.dir(inode).is_some()
    }

    pub fn is_ghost(&self, inode: u64) -> bool {
        self.file(inode).is_some_and(ServerFile::is_ghost)
    }

    pub fn set_expanded(&mut self, inode: u64, expanded: bool) -> bool {
        match self.get_mut(inode).map(|object| &mut object.kind) {
            Some(ObjectKind::Dir(dir)) => {
                dir.expanded = expanded;
                true
            }
            _ => false,
        }
    }

    pub fn child(&self, parent: u64, name: &str) -> Option<u64> {
        self.dir(parent).and_then(|dir| dir.child(name))
    }

    pub fn children(&self, inode: u64) -> Vec<u64> {
        self.dir(inode)
            .map(|dir| dir.children().map(|(_, child)| child).collect())
            .unwrap_or_default()
    }

    /// Slash-separated path relative to the share root; empty for the root.
    pub fn path_of(&self, inode: u64) -> Option<String> {
        let mut parts = Vec::new();
        let mut cursor = self.get(inode)?;
        while let Some(parent) = cursor.parent_inode {
            parts.push(cursor.name.as_str());
            cursor = self.get(parent)?;
        }
        parts.reverse();
        Some(parts.join("/"))
    }

    pub fn lookup(&self, path: &str) -> Option<u64> {
        let mut inode = ROOT_INODE;
        for part in path.split('/').filter(|part| !part.is_empty()) {
            inode = self.child(inode, part)?;
        }
        Some(inode)
    }

    /// Deepest existing directory on `path` and the unresolved remainder.
    pub fn deepest_dir(&self, path: &str) -> (u64, String) {
        let parts: Vec<&str> = path.split('/').filter(|part| !part.is_empty()).collect();
        let mut inode = ROOT_INODE;
        let mut consumed = 0;
        for part in &parts {
            match self.child(inode, part) {
                Some(child) if self.is_dir(child) => {
                    inode = child;
                    consumed += 1;
                }
                _ => break,
            }
        }
        (inode, parts[consumed..].join("/"))
    }

    /// True when `inode` is `ancestor` or lies below it.
    pub fn is_ancestor(&self, ancestor: u64, inode: u64) -> bool {
        let mut cursor = Some(inode);
        while let Some(current) = cursor {
            if current == ancestor {
                return true;
            }
            cursor = self.get(current).and_then(|object| object.parent_inode);
        }
        false
    }

    /// `inode` and all its descendants, parents before children.
    pub fn subtree(&self, inode: u64) -> Vec<u64> {
        let mut out = Vec::new();
        let mut stack = vec![inode];
        while let Some(current) = stack.pop() {
            if !self.contains(current) {
                continue;
            }
            out.push(current);
            let mut children = self.children(current);
            children.reverse();
            stack.extend(children);
        }
        out
    }

    /// Every object except the root with its relative path, in preorder.
    pub fn walk(&self) -> Vec<(String, u64)> {
        let mut out = Vec::with_capacity(self.objects.len());
        let mut stack: Vec<(String, u64)> = self
            .children(ROOT_INODE)
            .into_iter()
            .rev()
            .filter_map(|child| self.get(child).map(|object| (object.name.clone(), child)))
            .collect();
        while let Some((path, inode)) = stack.pop() {
            for child in self.children(inode).into_iter().rev() {
                if let Some(object) = self.get(child) {
                    stack.push((format!("{path}/{}", object.name), child));
                }
            }
            out.push((path, inode));
        }
        out
    }

    pub fn files(&self) -> impl Iterator<Item = (u64, &ServerFile)> {
        self.objects
            .iter()
            .filter_map(|(inode, object)| object.as_file().map(|file| (*inode, file)))
    }

    /// Links `object` under its parent. Callers validate first; an object
    /// whose parent is not a directory is dropped.
    pub fn insert(&mut self, object: ServerObject) -> bool {
        let Some(parent) = object.parent_inode else {
            return false;
        };
        let Some(ObjectKind::Dir(dir)) = self.objects.get_mut(&parent).map(|p| &mut p.kind) else {
            return false;
        };
        dir.children.insert(object.name.clone(), object.inode);
        self.objects.insert(object.inode, object);
        true
    }

    /// Unlinks and drops `inode` with its descendants. Returns the removed
    /// inodes, parents first.
    pub fn remove_subtree(&mut self, inode: u64) -> Vec<u64> {
        if inode == ROOT_INODE {
            return Vec::new();
        }
        let removed = self.subtree(inode);
        if let Some(object) = self.objects.get(&inode) {
            let name = object.name.clone();
            if let Some(parent) = object.parent_inode
                && let Some(ObjectKind::Dir(dir)) =
                    self.objects.get_mut(&parent).map(|p| &mut p.kind)
            {
                dir.children.remove(&name);
            }
        }
        for gone in &removed {
            if let Some(ServerObject {
                kind: ObjectKind::File(file),
                ..
            }) = self.objects.remove(gone)
            {
                for key in file.uploaders {
                    if let Some(uploader) = self.uploaders.get_mut(&key) {
                        uploader.files.remove(gone);
                    }
                }
            }
        }
        removed
    }

    /// Moves `inode` under `new_parent` as `new_name`.
    pub fn relocate(&mut self, inode: u64, new_parent: u64, new_name: &str) -> bool {
        if inode == ROOT_INODE || !self.is_dir(new_parent) {
            return false;
        }
        let Some((old_parent, old_name)) = self
            .get(inode)
            .and_then(|object| object.parent_inode.map(|p| (p, object.name.clone())))
        else {
            return false;
        };
        if let Some(ObjectKind::Dir(dir)) = self.objects.get_mut(&old_parent).map(|p| &mut p.kind)
        {
            dir.children.remove(&old_name);
        }
        if let Some(ObjectKind::Dir(dir)) = self.objects.get_mut(&new_parent).map(|p| &mut p.kind)
        {
            dir.children.insert(new_name.to_string(), inode);
        }
        if let Some(object) = self.objects.get_mut(&inode) {
            object.parent_inode = Some(new_parent);
            object.name = new_name.to_string();
        }
        true
    }

    pub fn uploader(&self, key: &UploaderKey) -> Option<&Uploader> {
        self.uploaders.get(key)
    }

    pub fn add_uploader(&mut self, key: UploaderKey, inode: u64) {
        let Some(file) = self.file_mut(inode) else {
            return;
        };
        file.uploaders.insert(key);
        self.uploaders.entry(key).or_default().files.insert(inode);
    }

    /// Drops the uploader and detaches it from every file it covered.
    pub fn remove_uploader(&mut self, key: &UploaderKey) -> Option<Uploader> {
        let uploader = self.uploaders.remove(key)?;
        for inode in &uploader.files {
            if let Some(file) = self.file_mut(*inode) {
                file.uploaders.remove(key);
            }
        }
        Some(uploader)
    }

    pub fn check_invariants(&self) -> Result<(), TreeError> {
        let root = self.get(ROOT_INODE).ok_or(TreeError::BadRoot)?;
        if root.parent_inode.is_some() || !root.name.is_empty() || !root.is_dir() {
            return Err(TreeError::BadRoot);
        }
        for (inode, object) in &self.objects {
            if *inode != object.inode {
                return Err(TreeError::NoSuchObject(*inode));
            }
            match object.parent_inode {
                None if *inode != ROOT_INODE => return Err(TreeError::BadRoot),
                None => {}
                Some(parent) => {
                    let dir = self
                        .get(parent)
                        .ok_or(TreeError::NoSuchObject(parent))?
                        .as_dir()
                        .ok_or(TreeError::NotADirectory(parent))?;
                    match dir.child(&object.name) {
                        Some(listed) if listed == *inode => {}
                        Some(_) => return Err(TreeError::NameMismatch { parent, child: *inode }),
                        None => return Err(TreeError::Orphan { parent, child: *inode }),
                    }
                }
            }
            if let Some(dir) = object.as_dir() {
                for (name, child) in dir.children() {
                    let listed = self.get(child).ok_or(TreeError::NoSuchObject(child))?;
                    if listed.name != name || listed.parent_inode != Some(*inode) {
                        return Err(TreeError::NameMismatch {
                            parent: *inode,
                            child,
                        });
                    }
                }
            }
        }
        Ok(())
    }
}
