use std::path::Path;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::debug;

use super::local::{MARKER_PREFIX, is_marker};
use super::messages::Message;
use super::paths::relative_key;

/// Starts a recursive watcher on the share root that posts filesystem
/// callbacks into the share inbox. Dropping the watcher stops it.
pub fn start_notify_watcher(
    root: &Path,
    inbox: mpsc::Sender<Message>,
) -> notify::Result<RecommendedWatcher> {
    let watch_root = root.to_path_buf();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        let messages = match res {
            Ok(event) => map_event(&watch_root, event),
            Err(err) => vec![Message::WatcherFailed {
                reason: err.to_string(),
            }],
        };
        for message in messages {
            // Runs on the notify thread, outside the runtime.
            if inbox.blocking_send(message).is_err() {
                debug!("share inbox closed, dropping watcher event");
                return;
            }
        }
    })?;
    watcher.watch(root, RecursiveMode::Recursive)?;
    Ok(watcher)
}

fn map_event(root: &Path, event: Event) -> Vec<Message> {
    if event.need_rescan() {
        return vec![Message::WatcherFailed {
            reason: "watcher lost events".to_string(),
        }];
    }
    match event.kind {
        EventKind::Modify(notify::event::ModifyKind::Name(_)) if event.paths.len() >= 2 => {
            match (
                relative_key(root, &event.paths[0]),
                relative_key(root, &event.paths[1]),
            ) {
                (Some(from), Some(to)) => vec![Message::FsRenamed { from, to }],
                _ => Vec::new(),
            }
        }
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) => event
            .paths
            .into_iter()
            .filter_map(|path| relative_key(root, &path))
            .filter(|path| !path.is_empty())
            .filter_map(|path| match marker_id(&path) {
                Some(marker_id) => {
                    matches!(event.kind, EventKind::Create(_))
                        .then_some(Message::MarkerObserved { marker_id })
                }
                None if is_marker(&path) => None,
                None => Some(Message::FsChanged { path }),
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn marker_id(path: &str) -> Option<u64> {
    path.strip_prefix(MARKER_PREFIX)?.parse().ok()
}
