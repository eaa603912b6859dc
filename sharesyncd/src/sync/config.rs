use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_CACHE_MAX_BYTES: u64 = 512 * 1024 * 1024;
pub const DEFAULT_REHASH_EXTENSIONS: &[&str] = &["xls", "ppt"];

const STAGING_DIR_NAME: &str = "upload-staging";
const CACHE_DIR_NAME: &str = "download-cache";
const DB_FILE_NAME: &str = "share.db";

/// Delays driving the pipeline's scheduling decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tuning {
    pub scan_retry_delay: Duration,
    pub server_op_delay: Duration,
    pub blocked_op_retry_delay: Duration,
    pub marker_timeout: Duration,
    pub partial_scan_quiet: Duration,
    pub min_scan_interval: Duration,
    pub ui_refresh_interval: Duration,
    pub local_retry_delay: Duration,
    pub upload_echo_timeout: Duration,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            scan_retry_delay: Duration::from_secs(30),
            server_op_delay: Duration::from_millis(200),
            blocked_op_retry_delay: Duration::from_secs(10),
            marker_timeout: Duration::from_secs(5),
            partial_scan_quiet: Duration::from_secs(2),
            min_scan_interval: Duration::from_secs(1),
            ui_refresh_interval: Duration::from_millis(500),
            local_retry_delay: Duration::from_secs(15),
            upload_echo_timeout: Duration::from_secs(300),
        }
    }
}

impl Tuning {
    /// Every delay at zero; used by tests that drive the pipeline by hand.
    pub fn immediate() -> Self {
        Self {
            scan_retry_delay: Duration::ZERO,
            server_op_delay: Duration::ZERO,
            blocked_op_retry_delay: Duration::ZERO,
            marker_timeout: Duration::ZERO,
            partial_scan_quiet: Duration::ZERO,
            min_scan_interval: Duration::ZERO,
            ui_refresh_interval: Duration::ZERO,
            local_retry_delay: Duration::ZERO,
            upload_echo_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ShareConfig {
    pub share_root: PathBuf,
    pub state_dir: PathBuf,
    pub user_id: u64,
    pub rehash_extensions: Vec<String>,
    pub download_cache_max_bytes: u64,
    pub tuning: Tuning,
}

impl ShareConfig {
    pub fn new(share_root: PathBuf, state_dir: PathBuf, user_id: u64) -> Self {
        Self {
            share_root,
            state_dir,
            user_id,
            rehash_extensions: DEFAULT_REHASH_EXTENSIONS
                .iter()
                .map(|ext| ext.to_string())
                .collect(),
            download_cache_max_bytes: DEFAULT_CACHE_MAX_BYTES,
            tuning: Tuning::default(),
        }
    }

    pub fn with_tuning(mut self, tuning: Tuning) -> Self {
        self.tuning = tuning;
        self
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.state_dir.join(STAGING_DIR_NAME)
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.state_dir.join(CACHE_DIR_NAME)
    }

    pub fn database_path(&self) -> PathBuf {
        self.state_dir.join(DB_FILE_NAME)
    }

    /// Files with these extensions are re-hashed on every check even when
    /// size and timestamp are unchanged.
    pub fn always_rehash(&self, relative_path: &str) -> bool {
        let name = relative_path.rsplit('/').next().unwrap_or(relative_path);
        let Some((stem, ext)) = name.rsplit_once('.') else {
            return false;
        };
        !stem.is_empty()
            && self
                .rehash_extensions
                .iter()
                .any(|candidate| candidate.eq_ignore_ascii_case(ext))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rehash_extension_match_is_case_insensitive() {
        let config = ShareConfig::new("/share".into(), "/state".into(), 1);
        assert!(config.always_rehash("reports/Q1.XLS"));
        assert!(config.always_rehash("deck.ppt"));
        assert!(!config.always_rehash("notes.txt"));
        assert!(!config.always_rehash(".xls"));
    }

    #[test]
    fn private_dirs_live_under_state_dir() {
        let config = ShareConfig::new("/share".into(), "/state".into(), 1);
        assert_eq!(config.cache_dir(), PathBuf::from("/state/download-cache"));
        assert_eq!(config.staging_dir(), PathBuf::from("/state/upload-staging"));
    }
}
