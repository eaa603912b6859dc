//! Snapshot of the local share directory as seen by the last scan.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use sha2::{Digest, Sha256};
use thiserror::Error;
use walkdir::WalkDir;

use super::paths::relative_key;
use super::tree::{FileVersion, LocalStatus};

/// Files written into the share root to detect when the watcher has caught
/// up with our own filesystem changes. Never reported as share content.
pub const MARKER_PREFIX: &str = ".sharesync-marker-";

#[derive(Debug, Error)]
pub enum LocalError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("directory walk failed: {0}")]
    Walk(#[from] walkdir::Error),
    #[error("path is outside the share root or not valid UTF-8: {0}")]
    BadPath(PathBuf),
    #[error("scan worker stopped: {0}")]
    Worker(String),
}

impl LocalError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        LocalError::Io {
            path: path.into(),
            source,
        }
    }
}

pub fn is_marker(name: &str) -> bool {
    name.starts_with(MARKER_PREFIX)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalEntry {
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
    pub mtime: i64,
    pub local_id: u64,
}

impl LocalEntry {
    fn from_metadata(path: String, metadata: &fs::Metadata) -> Self {
        let mtime = metadata
            .modified()
            .ok()
            .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
            .map(|age| age.as_secs() as i64)
            .unwrap_or_default();
        Self {
            path,
            is_dir: metadata.is_dir(),
            size: if metadata.is_dir() { 0 } else { metadata.len() },
            mtime,
            local_id: local_id(metadata),
        }
    }
}

#[cfg(unix)]
fn local_id(metadata: &fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    metadata.ino()
}

#[cfg(not(unix))]
fn local_id(_metadata: &fs::Metadata) -> u64 {
    0
}

/// Local entries keyed by share-relative path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalTree {
    entries: BTreeMap<String, LocalEntry>,
}

impl LocalTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: impl IntoIterator<Item = LocalEntry>) -> Self {
        Self {
            entries: entries
                .into_iter()
                .map(|entry| (entry.path.clone(), entry))
                .collect(),
        }
    }

    pub fn get(&self, path: &str) -> Option<&LocalEntry> {
        self.entries.get(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LocalEntry> {
        self.entries.values()
    }

    pub fn insert(&mut self, entry: LocalEntry) {
        self.entries.insert(entry.path.clone(), entry);
    }

    /// Drops `path` and everything below it.
    pub fn remove_subtree(&mut self, path: &str) {
        let prefix = format!("{path}/");
        self.entries
            .retain(|key, _| key != path && !key.starts_with(&prefix));
    }

    /// Replaces what is known about `path` with a fresh partial scan.
    pub fn replace_subtree(&mut self, path: &str, entries: Vec<LocalEntry>) {
        self.remove_subtree(path);
        for entry in entries {
            self.insert(entry);
        }
    }
}

/// Walks the whole share root. Marker files are skipped.
pub fn scan(root: &Path) -> Result<LocalTree, LocalError> {
    Ok(LocalTree::from_entries(scan_below(root, root)?))
}

/// Rescans one share-relative path. A missing path yields no entries.
pub fn scan_subtree(root: &Path, relative: &str) -> Result<Vec<LocalEntry>, LocalError> {
    let start = root.join(relative);
    match fs::symlink_metadata(&start) {
        Ok(_) => scan_below(root, &start),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(err) => Err(LocalError::io(start, err)),
    }
}

fn scan_below(root: &Path, start: &Path) -> Result<Vec<LocalEntry>, LocalError> {
    let mut entries = Vec::new();
    let walker = WalkDir::new(start)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| !entry.file_name().to_str().is_some_and(is_marker));
    for entry in walker {
        let entry = entry?;
        if entry.path() == root || entry.path_is_symlink() {
            continue;
        }
        let relative = relative_key(root, entry.path())
            .ok_or_else(|| LocalError::BadPath(entry.path().to_path_buf()))?;
        let metadata = entry.metadata()?;
        entries.push(LocalEntry::from_metadata(relative, &metadata));
    }
    Ok(entries)
}

pub fn stat(root: &Path, relative: &str) -> Result<Option<LocalEntry>, LocalError> {
    let path = root.join(relative);
    match fs::metadata(&path) {
        Ok(metadata) => Ok(Some(LocalEntry::from_metadata(relative.to_string(), &metadata))),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(LocalError::io(path, err)),
    }
}

/// Lowercase hex SHA-256 of the file content.
pub fn hash_file(path: &Path) -> Result<String, LocalError> {
    let mut file = fs::File::open(path).map_err(|err| LocalError::io(path, err))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher).map_err(|err| LocalError::io(path, err))?;
    Ok(format!("{:x}", hasher.finalize()))
}

pub fn hash_bytes(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Local content compared with the last version known to be on disk.
pub fn compare(download_version: Option<&FileVersion>, local_hash: &str) -> LocalStatus {
    match download_version {
        Some(version) if version.hash == local_hash => LocalStatus::Unmodified,
        _ => LocalStatus::Modified,
    }
}
