use std::path::Path;

use sqlx::{Row, SqlitePool, migrate::Migrator, sqlite::SqliteConnectOptions};
use thiserror::Error;

use super::tree::{FileVersion, LocalCache, LocalStatus, ServerFile};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const LAST_APPLIED_OP: &str = "last_applied_op";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid local status: {0}")]
    InvalidStatus(String),
}

/// What survives a restart for one server file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileCacheRecord {
    pub download_version: Option<FileVersion>,
    pub status: LocalStatus,
    pub local_cache: Option<LocalCache>,
}

impl FileCacheRecord {
    pub fn from_file(file: &ServerFile) -> Self {
        Self {
            download_version: file.download_version.clone(),
            status: file.comparison_status(),
            local_cache: file.local_cache.clone(),
        }
    }

    /// Restores the record into a freshly created tree file.
    pub fn restore_into(self, file: &mut ServerFile) {
        file.download_version = self.download_version;
        file.persistent_status = self.status;
        file.local_cache = self.local_cache;
    }
}

#[derive(Debug, Clone)]
pub struct StateStore {
    pool: SqlitePool,
}

impl StateStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    /// Highest operation id whose filesystem effect has been applied.
    pub async fn last_applied_op(&self) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT value FROM share_state WHERE key = ?1")
            .bind(LAST_APPLIED_OP)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(0);
        };
        let value: i64 = row.try_get("value")?;
        Ok(value.max(0) as u64)
    }

    /// Moves the marker forward; never backwards.
    pub async fn advance_applied_op(&self, op_id: u64) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO share_state (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = MAX(value, excluded.value)",
        )
        .bind(LAST_APPLIED_OP)
        .bind(op_id as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load_file_cache(&self, inode: u64) -> Result<Option<FileCacheRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT dv_commit_id, dv_user_id, dv_date, dv_size, dv_hash, status,
                    local_size, local_mtime, local_id, local_hash
             FROM file_cache WHERE inode = ?1",
        )
        .bind(inode as i64)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let status: String = row.try_get("status")?;
        let status = LocalStatus::parse(&status).ok_or(StoreError::InvalidStatus(status))?;

        let dv_commit_id: Option<i64> = row.try_get("dv_commit_id")?;
        let dv_hash: Option<String> = row.try_get("dv_hash")?;
        let download_version = match (dv_commit_id, dv_hash) {
            (Some(commit_id), Some(hash)) => Some(FileVersion {
                inode,
                commit_id: commit_id as u64,
                user_id: row.try_get::<Option<i64>, _>("dv_user_id")?.unwrap_or(0) as u64,
                date: row.try_get::<Option<i64>, _>("dv_date")?.unwrap_or(0),
                size: row.try_get::<Option<i64>, _>("dv_size")?.unwrap_or(0) as u64,
                hash,
            }),
            _ => None,
        };

        let local_hash: Option<String> = row.try_get("local_hash")?;
        let local_cache = match local_hash {
            Some(hash) => Some(LocalCache {
                size: row.try_get::<Option<i64>, _>("local_size")?.unwrap_or(0) as u64,
                mtime: row.try_get::<Option<i64>, _>("local_mtime")?.unwrap_or(0),
                local_id: row.try_get::<Option<i64>, _>("local_id")?.unwrap_or(0) as u64,
                hash,
            }),
            None => None,
        };

        Ok(Some(FileCacheRecord {
            download_version,
            status,
            local_cache,
        }))
    }

    pub async fn save_file_cache(
        &self,
        inode: u64,
        record: &FileCacheRecord,
    ) -> Result<(), StoreError> {
        let version = record.download_version.as_ref();
        let cache = record.local_cache.as_ref();
        sqlx::query(
            "INSERT INTO file_cache (
                inode, dv_commit_id, dv_user_id, dv_date, dv_size, dv_hash, status,
                local_size, local_mtime, local_id, local_hash
             )
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(inode) DO UPDATE SET
                dv_commit_id = excluded.dv_commit_id,
                dv_user_id = excluded.dv_user_id,
                dv_date = excluded.dv_date,
                dv_size = excluded.dv_size,
                dv_hash = excluded.dv_hash,
                status = excluded.status,
                local_size = excluded.local_size,
                local_mtime = excluded.local_mtime,
                local_id = excluded.local_id,
                local_hash = excluded.local_hash",
        )
        .bind(inode as i64)
        .bind(version.map(|v| v.commit_id as i64))
        .bind(version.map(|v| v.user_id as i64))
        .bind(version.map(|v| v.date))
        .bind(version.map(|v| v.size as i64))
        .bind(version.map(|v| v.hash.clone()))
        .bind(record.status.as_str())
        .bind(cache.map(|c| c.size as i64))
        .bind(cache.map(|c| c.mtime))
        .bind(cache.map(|c| c.local_id as i64))
        .bind(cache.map(|c| c.hash.clone()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_file_cache(&self, inode: u64) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM file_cache WHERE inode = ?1")
            .bind(inode as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn load_expanded(&self, inode: u64) -> Result<Option<bool>, StoreError> {
        let row = sqlx::query("SELECT expanded FROM dir_state WHERE inode = ?1")
            .bind(inode as i64)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let expanded: i64 = row.try_get("expanded")?;
        Ok(Some(expanded != 0))
    }

    pub async fn save_expanded(&self, inode: u64, expanded: bool) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO dir_state (inode, expanded) VALUES (?1, ?2)
             ON CONFLICT(inode) DO UPDATE SET expanded = excluded.expanded",
        )
        .bind(inode as i64)
        .bind(if expanded { 1 } else { 0 })
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_dir_state(&self, inode: u64) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM dir_state WHERE inode = ?1")
            .bind(inode as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) async fn memory_store() -> StateStore {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let store = StateStore::from_pool(pool);
    store.init().await.unwrap();
    store
}
