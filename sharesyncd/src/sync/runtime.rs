//! Drives one share: drains its inbox, runs the pipeline, arms the wake-up
//! timer, and feeds it server events.

use std::sync::Arc;
use std::time::Duration;

use sharesync_core::ShareTransport;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::backoff::Backoff;
use super::error::SyncError;
use super::messages::Message;
use super::share::Share;

pub const INBOX_CAPACITY: usize = 256;

const POLL_BACKOFF_BASE: Duration = Duration::from_secs(1);
const POLL_BACKOFF_MAX: Duration = Duration::from_secs(60);

pub fn channel() -> (mpsc::Sender<Message>, mpsc::Receiver<Message>) {
    mpsc::channel(INBOX_CAPACITY)
}

pub struct ShareRuntime {
    share: Share,
    inbox: mpsc::Receiver<Message>,
    shutdown: CancellationToken,
}

impl ShareRuntime {
    pub fn new(share: Share, inbox: mpsc::Receiver<Message>, shutdown: CancellationToken) -> Self {
        Self {
            share,
            inbox,
            shutdown,
        }
    }

    pub fn share(&self) -> &Share {
        &self.share
    }

    pub fn share_mut(&mut self) -> &mut Share {
        &mut self.share
    }

    /// Applies everything waiting in the inbox without blocking.
    pub async fn drain(&mut self) -> usize {
        let mut drained = 0;
        while let Ok(message) = self.inbox.try_recv() {
            self.share.handle(message).await;
            drained += 1;
        }
        drained
    }

    pub async fn run(mut self) -> Result<(), SyncError> {
        self.share.activate().await?;
        let mut wake = self.share.run_pipeline().await;
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                received = self.inbox.recv() => {
                    let Some(message) = received else {
                        debug!("share inbox closed");
                        break;
                    };
                    self.share.handle(message).await;
                    self.drain().await;
                }
                _ = sleep_until_wake(wake) => {}
            }
            wake = self.share.run_pipeline().await;
        }
        self.share.deactivate();
        Ok(())
    }
}

async fn sleep_until_wake(wake: Option<Instant>) {
    match wake {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Follows the server event log from the beginning and posts every batch to
/// the share. Failures back off with jitter.
pub fn spawn_event_poller(
    transport: Arc<dyn ShareTransport>,
    inbox: mpsc::Sender<Message>,
    shutdown: CancellationToken,
    poll_interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut cursor = 0u64;
        let mut backoff = Backoff::new(POLL_BACKOFF_BASE, POLL_BACKOFF_MAX, true);
        loop {
            let polled = tokio::select! {
                _ = shutdown.cancelled() => return,
                polled = transport.poll_events(cursor) => polled,
            };
            let delay = match polled {
                Ok(batch) => {
                    backoff.reset();
                    if let Some(last) = batch.events.last() {
                        cursor = cursor.max(last.event_id);
                    }
                    let caught_up = batch.caught_up;
                    let message = Message::ServerEvents {
                        events: batch.events,
                        caught_up,
                    };
                    if inbox.send(message).await.is_err() {
                        info!("share stopped, event poller exiting");
                        return;
                    }
                    if !caught_up {
                        continue;
                    }
                    poll_interval
                }
                Err(err) => {
                    let delay = backoff.next_delay();
                    warn!(attempt = backoff.attempt(), ?delay, "event poll failed: {err}");
                    delay
                }
            };
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::testing::FakeTransport;
    use sharesync_core::{EventKind, ServerEvent};

    #[tokio::test]
    async fn poller_advances_cursor_and_reports_catch_up() {
        let transport = Arc::new(FakeTransport::default());
        transport.push_event(ServerEvent {
            event_id: 1,
            commit_id: 1,
            user_id: 2,
            date: 0,
            kind: EventKind::Create {
                inode: 5,
                parent_inode: 0,
                name: "a".into(),
                is_dir: true,
            },
        });
        let (tx, mut rx) = channel();
        let shutdown = CancellationToken::new();
        let handle = spawn_event_poller(
            transport.clone(),
            tx,
            shutdown.clone(),
            Duration::from_secs(60),
        );

        let message = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match message {
            Message::ServerEvents { events, caught_up } => {
                assert_eq!(events.len(), 1);
                assert!(caught_up);
            }
            other => panic!("unexpected message {other:?}"),
        }
        shutdown.cancel();
        handle.await.unwrap();
        assert_eq!(transport.polled_cursors(), vec![0]);
    }
}
