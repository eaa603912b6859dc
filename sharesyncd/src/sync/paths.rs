use std::path::{Component, Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("path is empty")]
    Empty,
    #[error("path {0} contains an unsupported component")]
    UnsupportedComponent(String),
}

/// Normalizes a user-supplied share path into the slash-separated form used
/// as a key everywhere in the sync core ("docs/a.txt", no leading slash).
pub fn normalize(relative: &str) -> Result<String, PathError> {
    let mut parts = Vec::new();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => match part.to_str() {
                Some(part) => parts.push(part),
                None => return Err(PathError::UnsupportedComponent(relative.to_string())),
            },
            Component::RootDir | Component::CurDir => continue,
            Component::ParentDir | Component::Prefix(_) => {
                return Err(PathError::UnsupportedComponent(relative.to_string()));
            }
        }
    }
    if parts.is_empty() {
        return Err(PathError::Empty);
    }
    Ok(parts.join("/"))
}

/// Maps a share-relative key onto the local filesystem.
pub fn local_path(root: &Path, relative: &str) -> PathBuf {
    let mut out = root.to_path_buf();
    out.extend(relative.split('/').filter(|part| !part.is_empty()));
    out
}

/// Inverse of [`local_path`]; `None` for paths outside `root` or that are
/// not valid UTF-8.
pub fn relative_key(root: &Path, path: &Path) -> Option<String> {
    let stripped = path.strip_prefix(root).ok()?;
    let mut parts = Vec::new();
    for component in stripped.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?),
            _ => return None,
        }
    }
    Some(parts.join("/"))
}

pub fn join(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}/{name}")
    }
}

/// Splits "a/b/c" into ("a/b", "c").
pub fn split_parent(relative: &str) -> (&str, &str) {
    relative.rsplit_once('/').unwrap_or(("", relative))
}

/// True when `path` equals `ancestor` or lies below it.
pub fn is_within(ancestor: &str, path: &str) -> bool {
    ancestor.is_empty()
        || path == ancestor
        || (path.starts_with(ancestor) && path.as_bytes().get(ancestor.len()) == Some(&b'/'))
}
