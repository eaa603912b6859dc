//! User-triggered operations. Each one holds the gate for its whole
//! interaction, prompts included.

use std::path::{Path, PathBuf};

use tracing::{debug, info};
use walkdir::WalkDir;

use super::error::{Choice, DefaultAction, Prompt, SyncError};
use super::events::AllowedOps;
use super::local::{self, LocalEntry, LocalError};
use super::messages::OrderId;
use super::paths::{is_within, join, local_path, normalize, relative_key, split_parent};
use super::reconcile::PathStatus;
use super::share::Share;
use super::transfer::metadata::MetadataRequest;
use super::tree::{LocalStatus, ROOT_INODE};

/// How the user settled a content conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Upload the local copy over the server version.
    KeepLocal,
    /// Replace the local copy with the server version.
    TakeServer,
}

fn dest_key(dest_dir: &str) -> Result<String, SyncError> {
    if dest_dir.trim_matches('/').is_empty() {
        Ok(String::new())
    } else {
        Ok(normalize(dest_dir)?)
    }
}

fn cancelled_by(err: SyncError) -> SyncError {
    if err.is_silent() {
        err
    } else {
        SyncError::Cancelled
    }
}

impl Share {
    fn require(&self, level: AllowedOps) -> Result<(), SyncError> {
        if self.health.allowed >= level {
            Ok(())
        } else {
            Err(SyncError::IllegalOperation(format!(
                "the share does not accept this now (allowed: {:?})",
                self.health.allowed
            )))
        }
    }

    fn require_directory(&self, path: &str) -> Result<(), SyncError> {
        if path.is_empty() {
            return Ok(());
        }
        match self.view.status(path) {
            Some(PathStatus::Directory) => Ok(()),
            Some(_) => Err(SyncError::IllegalOperation(format!("{path} is not a directory"))),
            None => Err(SyncError::StaleView),
        }
    }

    /// Copies `sources` into `dest_dir` and queues them for upload. Sources
    /// already inside the share are queued where they are.
    pub async fn add_files(
        &mut self,
        sources: &[PathBuf],
        dest_dir: &str,
        prompt: &mut dyn Prompt,
    ) -> Result<Vec<OrderId>, SyncError> {
        self.gate_enter("add files");
        let result = self.add_files_gated(sources, dest_dir, prompt).await;
        self.gate_exit("add files").await;
        result
    }

    async fn add_files_gated(
        &mut self,
        sources: &[PathBuf],
        dest_dir: &str,
        prompt: &mut dyn Prompt,
    ) -> Result<Vec<OrderId>, SyncError> {
        self.require(AllowedOps::All)?;
        let dest = dest_key(dest_dir)?;
        self.require_directory(&dest)?;
        let mut defaults = DefaultAction::new();
        let mut orders = Vec::new();
        for source in sources {
            match self.add_one(source, &dest, &mut defaults, prompt).await {
                Ok(mut queued) => orders.append(&mut queued),
                Err(err) => {
                    let label = source.display().to_string();
                    if defaults.resolve(prompt, &label, &err) == Choice::Cancel {
                        return Err(cancelled_by(err));
                    }
                }
            }
        }
        info!(sources = sources.len(), queued = orders.len(), "files added to the share");
        Ok(orders)
    }

    async fn add_one(
        &mut self,
        source: &Path,
        dest: &str,
        defaults: &mut DefaultAction,
        prompt: &mut dyn Prompt,
    ) -> Result<Vec<OrderId>, SyncError> {
        if let Some(relative) = relative_key(&self.config.share_root, source) {
            return self.publish_local(&relative).await;
        }
        let name = source
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| LocalError::BadPath(source.to_path_buf()))?;
        if local::is_marker(name) {
            return Err(SyncError::IllegalOperation(format!("{name} is a reserved name")));
        }
        let target = join(dest, name);
        let target_path = local_path(&self.config.share_root, &target);
        if tokio::fs::symlink_metadata(&target_path).await.is_ok() {
            let exists = SyncError::IllegalOperation(format!("{target} already exists"));
            match defaults.resolve(prompt, &target, &exists) {
                Choice::Skip => return Ok(Vec::new()),
                Choice::Cancel => return Err(SyncError::Cancelled),
                Choice::Overwrite => self.ensure_not_transferring(&target)?,
            }
        }
        let from = source.to_path_buf();
        tokio::task::spawn_blocking(move || copy_tree(&from, &target_path))
            .await
            .map_err(|err| LocalError::Worker(err.to_string()))??;
        debug!(source = %source.display(), target = %target, "copied into the share");
        self.publish_local(&target).await
    }

    /// Rescans one share path right away and replaces what the local tree
    /// knows about it.
    async fn rescan_now(&mut self, relative: &str) -> Result<Vec<LocalEntry>, SyncError> {
        let root = self.config.share_root.clone();
        let path = relative.to_string();
        let entries = tokio::task::spawn_blocking(move || local::scan_subtree(&root, &path))
            .await
            .map_err(|err| LocalError::Worker(err.to_string()))??;
        self.local.replace_subtree(relative, entries.clone());
        self.mark_subtree_dirty(relative);
        self.ui.view_stale = true;
        Ok(entries)
    }

    /// Queues directory creations and uploads for everything at or below a
    /// local share path that the server lacks or holds in another version.
    async fn publish_local(&mut self, relative: &str) -> Result<Vec<OrderId>, SyncError> {
        let mut entries = self.rescan_now(relative).await?;
        if entries.is_empty() {
            return Err(SyncError::IllegalOperation(format!("{relative} does not exist")));
        }
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        let mut orders = Vec::new();
        for entry in entries {
            if entry.is_dir {
                if self.tree.lookup(&entry.path).is_none()
                    && !self.transfers.metadata.creates_dir(&entry.path)
                {
                    orders.push(self.enqueue_metadata(MetadataRequest::CreateDir { path: entry.path }));
                }
            } else if !self.is_in_sync(&entry) {
                orders.push(self.enqueue_upload(&entry.path).await?);
            }
        }
        Ok(orders)
    }

    fn is_in_sync(&self, entry: &LocalEntry) -> bool {
        let Some(file) = self.tree.lookup(&entry.path).and_then(|inode| self.tree.file(inode)) else {
            return false;
        };
        file.is_current()
            && file.comparison_status() == LocalStatus::Unmodified
            && file.local_cache.as_ref().is_some_and(|cache| {
                cache.size == entry.size
                    && cache.mtime == entry.mtime
                    && cache.local_id == entry.local_id
            })
    }

    /// Deletes server objects through the metadata manager and local-only
    /// items directly.
    pub async fn delete_paths(
        &mut self,
        paths: &[String],
        prompt: &mut dyn Prompt,
    ) -> Result<(), SyncError> {
        self.gate_enter("delete");
        let result = self.delete_gated(paths, prompt).await;
        self.gate_exit("delete").await;
        result
    }

    async fn delete_gated(&mut self, paths: &[String], prompt: &mut dyn Prompt) -> Result<(), SyncError> {
        self.require(AllowedOps::All)?;
        let mut defaults = DefaultAction::new();
        for path in paths {
            if let Err(err) = self.delete_one(path).await
                && defaults.resolve(prompt, path, &err) == Choice::Cancel
            {
                return Err(cancelled_by(err));
            }
        }
        Ok(())
    }

    async fn delete_one(&mut self, path: &str) -> Result<(), SyncError> {
        let path = normalize(path)?;
        let entry = self.view.get(&path).cloned().ok_or(SyncError::StaleView)?;
        self.ensure_not_transferring(&path)?;
        match entry.server_inode.filter(|inode| !self.tree.is_ghost(*inode)) {
            Some(inode) => {
                self.enqueue_metadata(MetadataRequest::Delete { inode });
            }
            None => {
                let target = local_path(&self.config.share_root, &path);
                let removed = if entry.local.as_ref().is_some_and(|local| local.is_dir) {
                    tokio::fs::remove_dir_all(&target).await
                } else {
                    tokio::fs::remove_file(&target).await
                };
                removed.map_err(|err| LocalError::io(&target, err))?;
                self.local.remove_subtree(&path);
                self.ui.view_stale = true;
                debug!(path = %path, "local-only item deleted");
            }
        }
        Ok(())
    }

    /// Moves `from` into the directory `dest_dir`, keeping its name.
    pub async fn move_path(&mut self, from: &str, dest_dir: &str) -> Result<(), SyncError> {
        self.gate_enter("move");
        let result = async {
            let from = normalize(from)?;
            let dest = dest_key(dest_dir)?;
            let (_, name) = split_parent(&from);
            let to = join(&dest, name);
            self.relocate(&from, &to).await
        }
        .await;
        self.gate_exit("move").await;
        result
    }

    /// Renames in place. A failed attempt keeps the edit session open so the
    /// user can retry; [`Share::end_label_edit`] closes it.
    pub async fn rename_path(&mut self, path: &str, new_name: &str) -> Result<(), SyncError> {
        self.begin_label_edit();
        let result = async {
            let path = normalize(path)?;
            if new_name.is_empty() || new_name.contains('/') || new_name == "." || new_name == ".." {
                return Err(SyncError::IllegalOperation(format!("{new_name:?} is not a valid name")));
            }
            if local::is_marker(new_name) {
                return Err(SyncError::IllegalOperation(format!("{new_name} is a reserved name")));
            }
            let (parent, _) = split_parent(&path);
            let to = join(parent, new_name);
            self.relocate(&path, &to).await
        }
        .await;
        if result.is_ok() {
            self.end_label_edit().await;
        }
        result
    }

    async fn relocate(&mut self, from: &str, to: &str) -> Result<(), SyncError> {
        self.require(AllowedOps::All)?;
        let entry = self.view.get(from).cloned().ok_or(SyncError::StaleView)?;
        if from == to {
            return Ok(());
        }
        if is_within(from, to) {
            return Err(SyncError::IllegalOperation(format!(
                "cannot move {from} into itself"
            )));
        }
        if self.view.get(to).is_some() {
            return Err(SyncError::IllegalOperation(format!("{to} already exists")));
        }
        let (parent, _) = split_parent(to);
        self.require_directory(parent)?;
        self.ensure_not_transferring(from)?;
        match entry.server_inode.filter(|inode| !self.tree.is_ghost(*inode)) {
            Some(inode) => {
                self.enqueue_metadata(MetadataRequest::Move {
                    inode,
                    new_path: to.to_string(),
                });
            }
            None => {
                let source = local_path(&self.config.share_root, from);
                let target = local_path(&self.config.share_root, to);
                tokio::fs::rename(&source, &target)
                    .await
                    .map_err(|err| LocalError::io(&source, err))?;
                self.local.remove_subtree(from);
                self.rescan_now(to).await?;
                debug!(from = %from, to = %to, "local-only item moved");
            }
        }
        Ok(())
    }

    /// Settles a content conflict on one file.
    pub async fn resolve_conflict(
        &mut self,
        path: &str,
        resolution: Resolution,
    ) -> Result<OrderId, SyncError> {
        self.gate_enter("resolve conflict");
        let result = self.resolve_gated(path, resolution).await;
        self.gate_exit("resolve conflict").await;
        result
    }

    async fn resolve_gated(&mut self, path: &str, resolution: Resolution) -> Result<OrderId, SyncError> {
        let path = normalize(path)?;
        let entry = self.view.get(&path).cloned().ok_or(SyncError::StaleView)?;
        match resolution {
            Resolution::KeepLocal => {
                self.require(AllowedOps::All)?;
                match entry.status {
                    PathStatus::ModifiedStale | PathStatus::ModifiedCurrent | PathStatus::NotAdded => {
                        self.enqueue_upload(&path).await
                    }
                    other => Err(SyncError::IllegalOperation(format!(
                        "{path} has nothing to upload ({other:?})"
                    ))),
                }
            }
            Resolution::TakeServer => {
                self.require(AllowedOps::DownloadOnly)?;
                match entry.status {
                    PathStatus::ModifiedStale
                    | PathStatus::ModifiedCurrent
                    | PathStatus::UnmodifiedStale
                    | PathStatus::NotDownloaded => {
                        let inode = entry.server_inode.ok_or(SyncError::StaleView)?;
                        self.enqueue_download(inode, true)
                    }
                    other => Err(SyncError::IllegalOperation(format!(
                        "{path} has no server version to take ({other:?})"
                    ))),
                }
            }
        }
    }

    /// Cancels a queued or running content transfer.
    pub async fn cancel_transfer(&mut self, order_id: OrderId) -> bool {
        self.gate_enter("cancel transfer");
        let cancelled = if self.transfers.download.items.contains_key(&order_id) {
            self.cancel_download(order_id)
        } else {
            self.cancel_upload(order_id).await
        };
        self.gate_exit("cancel transfer").await;
        cancelled
    }

    /// Persists whether a directory is shown expanded.
    pub async fn set_expanded(&mut self, path: &str, expanded: bool) -> Result<(), SyncError> {
        let inode = if path.trim_matches('/').is_empty() {
            ROOT_INODE
        } else {
            self.tree.lookup(&normalize(path)?).ok_or(SyncError::StaleView)?
        };
        if !self.tree.set_expanded(inode, expanded) {
            return Err(SyncError::IllegalOperation(format!("{path} is not a directory")));
        }
        self.store.save_expanded(inode, expanded).await?;
        Ok(())
    }
}

/// Copies a file or a directory tree, merging into existing directories.
fn copy_tree(from: &Path, to: &Path) -> Result<(), LocalError> {
    let metadata = std::fs::metadata(from).map_err(|err| LocalError::io(from, err))?;
    if !metadata.is_dir() {
        if let Some(parent) = to.parent() {
            std::fs::create_dir_all(parent).map_err(|err| LocalError::io(parent, err))?;
        }
        std::fs::copy(from, to).map_err(|err| LocalError::io(from, err))?;
        return Ok(());
    }
    for entry in WalkDir::new(from).follow_links(false) {
        let entry = entry?;
        let relative = entry
            .path()
            .strip_prefix(from)
            .map_err(|_| LocalError::BadPath(entry.path().to_path_buf()))?;
        let target = to.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target).map_err(|err| LocalError::io(&target, err))?;
        } else if entry.file_type().is_file() {
            std::fs::copy(entry.path(), &target).map_err(|err| LocalError::io(entry.path(), err))?;
        }
    }
    Ok(())
}

#[cfg(test)]
#[path = "foreground_tests.rs"]
mod tests;
