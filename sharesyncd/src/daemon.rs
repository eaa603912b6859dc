use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use sharesync_core::{ShareClient, ShareTransport};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::sync::config::{DEFAULT_CACHE_MAX_BYTES, DEFAULT_REHASH_EXTENSIONS, ShareConfig};
use crate::sync::events::LogObserver;
use crate::sync::local_watcher::start_notify_watcher;
use crate::sync::runtime::{self, ShareRuntime, spawn_event_poller};
use crate::sync::share::Share;
use crate::sync::store::StateStore;

const DEFAULT_SHARE_DIR_NAME: &str = "Shared";
const DEFAULT_POLL_SECS: u64 = 15;

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub server_url: String,
    pub share_id: String,
    pub token: String,
    pub user_id: u64,
    pub share_root: PathBuf,
    pub state_dir: PathBuf,
    pub poll_interval: Duration,
    pub cache_max_bytes: u64,
    pub rehash_extensions: Vec<String>,
    pub enable_local_watcher: bool,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let home = dirs::home_dir().context("home directory is unavailable")?;
        Self::from_vars(&|name: &str| std::env::var(name).ok(), &home)
    }

    /// Builds the configuration from `SHARESYNC_*` variables resolved by
    /// `vars`.
    pub fn from_vars(vars: &dyn Fn(&str) -> Option<String>, home: &Path) -> anyhow::Result<Self> {
        let server_url = required_var(vars, "SHARESYNC_SERVER_URL")?;
        let share_id = required_var(vars, "SHARESYNC_SHARE_ID")?;
        let token = required_var(vars, "SHARESYNC_TOKEN")?;
        let user_id = required_var(vars, "SHARESYNC_USER_ID")?
            .trim()
            .parse::<u64>()
            .context("SHARESYNC_USER_ID must be a number")?;
        let share_root = vars("SHARESYNC_SHARE_DIR")
            .map(|value| expand_with_home(&value, home))
            .unwrap_or_else(|| home.join(DEFAULT_SHARE_DIR_NAME));
        let state_dir = vars("SHARESYNC_STATE_DIR")
            .map(|value| expand_with_home(&value, home))
            .unwrap_or_else(|| default_state_root().join(&share_id));
        let poll_interval =
            Duration::from_secs(read_u64_var(vars, "SHARESYNC_POLL_SECS", DEFAULT_POLL_SECS));
        let cache_max_bytes =
            read_u64_var(vars, "SHARESYNC_CACHE_MAX_BYTES", DEFAULT_CACHE_MAX_BYTES);
        let rehash_extensions = read_list_var(vars, "SHARESYNC_REHASH_EXTENSIONS").unwrap_or_else(
            || {
                DEFAULT_REHASH_EXTENSIONS
                    .iter()
                    .map(|ext| ext.to_string())
                    .collect()
            },
        );
        let enable_local_watcher = read_bool_var(vars, "SHARESYNC_ENABLE_WATCHER", true);

        Ok(Self {
            server_url,
            share_id,
            token,
            user_id,
            share_root,
            state_dir,
            poll_interval,
            cache_max_bytes,
            rehash_extensions,
            enable_local_watcher,
        })
    }

    pub fn share_config(&self) -> ShareConfig {
        let mut config = ShareConfig::new(
            self.share_root.clone(),
            self.state_dir.clone(),
            self.user_id,
        );
        config.download_cache_max_bytes = self.cache_max_bytes;
        config.rehash_extensions = self.rehash_extensions.clone();
        config
    }
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    transport: Arc<dyn ShareTransport>,
    store: StateStore,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&config.share_root)
            .await
            .with_context(|| format!("failed to create share root at {:?}", config.share_root))?;
        tokio::fs::create_dir_all(&config.state_dir)
            .await
            .with_context(|| format!("failed to create state dir at {:?}", config.state_dir))?;

        let client = ShareClient::new(&config.server_url, config.share_id.clone(), config.token.clone())
            .context("invalid share server configuration")?;
        let store = StateStore::open(&config.share_config().database_path())
            .await
            .context("failed to open share state store")?;

        Ok(Self {
            config,
            transport: Arc::new(client),
            store,
        })
    }

    /// Runs until Ctrl-C.
    pub async fn run(self) -> anyhow::Result<()> {
        let shutdown = CancellationToken::new();
        let signal_token = shutdown.clone();
        let signal_handle = tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("shutdown requested");
                    signal_token.cancel();
                }
                Err(err) => warn!("failed waiting for shutdown signal: {err}"),
            }
        });
        let result = self.run_until(shutdown).await;
        signal_handle.abort();
        result
    }

    pub async fn run_until(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        info!(
            share_id = %self.config.share_id,
            share_root = %self.config.share_root.display(),
            local_watcher = self.config.enable_local_watcher,
            "sharesyncd started"
        );

        let (inbox, rx) = runtime::channel();
        let mut share = Share::new(
            self.config.share_config(),
            Arc::clone(&self.transport),
            self.store,
            LogObserver::shared(),
            inbox.clone(),
        );

        let watcher = if self.config.enable_local_watcher {
            match start_notify_watcher(&self.config.share_root, inbox.clone()) {
                Ok(watcher) => {
                    share.set_watching(true);
                    Some(watcher)
                }
                Err(err) => {
                    warn!("failed to start local watcher, relying on scans: {err}");
                    None
                }
            }
        } else {
            None
        };

        let poller = spawn_event_poller(
            Arc::clone(&self.transport),
            inbox,
            shutdown.clone(),
            self.config.poll_interval,
        );

        let result = ShareRuntime::new(share, rx, shutdown.clone()).run().await;
        shutdown.cancel();
        if let Err(err) = poller.await {
            warn!("event poller ended abnormally: {err}");
        }
        drop(watcher);
        result.context("share stopped with an error")
    }
}

include!("daemon_helpers.rs");

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
