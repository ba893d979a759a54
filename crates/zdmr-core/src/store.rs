//! SQLite-backed persistence store.
//!
//! Generalizes the old two-table (`downloads`/`segments`) layout into the
//! five tables the engine needs: downloads, their segments, batches,
//! key/value settings, and hostname-matched rules. All multi-row writes
//! go through a transaction so a crash never leaves a download with a
//! stale segment plan.

use crate::error::EngineError;
use chrono::{DateTime, Utc};
use rand::RngCore;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePool},
    Row,
};
use std::path::Path;
use uuid::Uuid;
use zdmr_types::{Batch, Download, DownloadStatus, ErrorCode, Rule, RuleKind, Segment, Settings, SupportsRanges};

/// Connection pool plus the schema migrations that created it.
#[derive(Clone, Debug)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn open<P: AsRef<Path>>(db_path: P) -> Result<Self, EngineError> {
        let path = db_path.as_ref();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS downloads (
                id TEXT PRIMARY KEY,
                url TEXT NOT NULL,
                final_url TEXT,
                filename TEXT NOT NULL,
                destination TEXT NOT NULL,
                size INTEGER,
                downloaded INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL,
                supports_ranges TEXT NOT NULL DEFAULT 'unknown',
                batch_id TEXT,
                speed_limit INTEGER,
                mirror_used TEXT,
                etag TEXT,
                last_modified TEXT,
                error_code TEXT,
                error_message TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT
            );

            CREATE TABLE IF NOT EXISTS download_segments (
                download_id TEXT NOT NULL,
                segment_index INTEGER NOT NULL,
                start_byte INTEGER NOT NULL,
                end_byte INTEGER NOT NULL,
                downloaded_bytes INTEGER NOT NULL DEFAULT 0,
                complete INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (download_id, segment_index),
                FOREIGN KEY (download_id) REFERENCES downloads(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS batches (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                destination TEXT NOT NULL,
                force_proxy INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS rules (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                host_pattern TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                kind TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_downloads_status ON downloads(status);
            CREATE INDEX IF NOT EXISTS idx_downloads_batch ON downloads(batch_id);
            CREATE INDEX IF NOT EXISTS idx_segments_download ON download_segments(download_id);
            CREATE INDEX IF NOT EXISTS idx_rules_enabled ON rules(enabled);
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    #[cfg(test)]
    pub async fn open_in_memory() -> Result<Self, EngineError> {
        Self::open(":memory:").await
    }

    // -- downloads -----------------------------------------------------

    pub async fn upsert_download(&self, download: &Download) -> Result<(), EngineError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO downloads (
                id, url, final_url, filename, destination, size, downloaded,
                status, supports_ranges, batch_id, speed_limit, mirror_used,
                etag, last_modified, error_code, error_message, retry_count,
                created_at, updated_at, started_at, completed_at
            ) VALUES (?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?)
            ON CONFLICT(id) DO UPDATE SET
                url = excluded.url,
                final_url = excluded.final_url,
                filename = excluded.filename,
                destination = excluded.destination,
                size = excluded.size,
                downloaded = excluded.downloaded,
                status = excluded.status,
                supports_ranges = excluded.supports_ranges,
                batch_id = excluded.batch_id,
                speed_limit = excluded.speed_limit,
                mirror_used = excluded.mirror_used,
                etag = excluded.etag,
                last_modified = excluded.last_modified,
                error_code = excluded.error_code,
                error_message = excluded.error_message,
                retry_count = excluded.retry_count,
                updated_at = excluded.updated_at,
                started_at = excluded.started_at,
                completed_at = excluded.completed_at
            "#,
        )
        .bind(download.id.to_string())
        .bind(&download.url)
        .bind(download.final_url.as_ref())
        .bind(&download.filename)
        .bind(download.destination.to_string_lossy().to_string())
        .bind(download.size.map(|s| s as i64))
        .bind(download.downloaded as i64)
        .bind(status_to_str(download.status))
        .bind(supports_ranges_to_str(download.supports_ranges))
        .bind(download.batch_id.map(|id| id.to_string()))
        .bind(download.speed_limit.map(|s| s as i64))
        .bind(download.mirror_used.as_ref())
        .bind(download.etag.as_ref())
        .bind(download.last_modified.as_ref())
        .bind(download.error_code.map(|c| c.to_string()))
        .bind(download.error_message.as_ref())
        .bind(download.retry_count as i64)
        .bind(download.created_at.to_rfc3339())
        .bind(download.updated_at.to_rfc3339())
        .bind(download.started_at.map(|d| d.to_rfc3339()))
        .bind(download.completed_at.map(|d| d.to_rfc3339()))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Replace a download's segment plan atomically. Called once per
    /// probe/resume, not on every progress checkpoint.
    pub async fn replace_segments(
        &self,
        download_id: Uuid,
        segments: &[Segment],
    ) -> Result<(), EngineError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM download_segments WHERE download_id = ?")
            .bind(download_id.to_string())
            .execute(&mut *tx)
            .await?;

        for segment in segments {
            sqlx::query(
                r#"
                INSERT INTO download_segments (
                    download_id, segment_index, start_byte, end_byte,
                    downloaded_bytes, complete
                ) VALUES (?,?,?,?,?,?)
                "#,
            )
            .bind(download_id.to_string())
            .bind(segment.index as i64)
            .bind(segment.start as i64)
            .bind(segment.end as i64)
            .bind(segment.downloaded as i64)
            .bind(segment.complete as i64)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn checkpoint_segment_progress(
        &self,
        download_id: Uuid,
        segment_index: u32,
        downloaded_bytes: u64,
        complete: bool,
    ) -> Result<(), EngineError> {
        sqlx::query(
            r#"
            UPDATE download_segments
            SET downloaded_bytes = ?, complete = ?
            WHERE download_id = ? AND segment_index = ?
            "#,
        )
        .bind(downloaded_bytes as i64)
        .bind(complete as i64)
        .bind(download_id.to_string())
        .bind(segment_index as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn checkpoint_download_progress(
        &self,
        download_id: Uuid,
        downloaded: u64,
    ) -> Result<(), EngineError> {
        sqlx::query("UPDATE downloads SET downloaded = ?, updated_at = ? WHERE id = ?")
            .bind(downloaded as i64)
            .bind(Utc::now().to_rfc3339())
            .bind(download_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_status(
        &self,
        download_id: Uuid,
        status: DownloadStatus,
        error_code: Option<ErrorCode>,
        error_message: Option<String>,
    ) -> Result<(), EngineError> {
        let now = Utc::now();
        sqlx::query(
            r#"
            UPDATE downloads
            SET status = ?, error_code = ?, error_message = ?, updated_at = ?,
                started_at = CASE WHEN ? = 'DOWNLOADING' AND started_at IS NULL THEN ? ELSE started_at END,
                completed_at = CASE WHEN ? = 'COMPLETED' THEN ? ELSE completed_at END
            WHERE id = ?
            "#,
        )
        .bind(status_to_str(status))
        .bind(error_code.map(|c| c.to_string()))
        .bind(error_message)
        .bind(now.to_rfc3339())
        .bind(status_to_str(status))
        .bind(now.to_rfc3339())
        .bind(status_to_str(status))
        .bind(now.to_rfc3339())
        .bind(download_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load_download(&self, id: Uuid) -> Result<Option<Download>, EngineError> {
        let row = sqlx::query("SELECT * FROM downloads WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else { return Ok(None) };
        let segments = self.load_segments(id).await?;
        Ok(Some(row_to_download(row, segments)?))
    }

    pub async fn load_all_downloads(&self) -> Result<Vec<Download>, EngineError> {
        let rows = sqlx::query("SELECT * FROM downloads ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await?;

        let mut downloads = Vec::with_capacity(rows.len());
        for row in rows {
            let id = Uuid::parse_str(row.get::<String, _>("id").as_str())
                .map_err(|e| EngineError::Unknown(e.to_string()))?;
            let segments = self.load_segments(id).await?;
            downloads.push(row_to_download(row, segments)?);
        }
        Ok(downloads)
    }

    async fn load_segments(&self, download_id: Uuid) -> Result<Vec<Segment>, EngineError> {
        let rows = sqlx::query(
            "SELECT * FROM download_segments WHERE download_id = ? ORDER BY segment_index",
        )
        .bind(download_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| Segment {
                index: row.get::<i64, _>("segment_index") as u32,
                start: row.get::<i64, _>("start_byte") as u64,
                end: row.get::<i64, _>("end_byte") as u64,
                downloaded: row.get::<i64, _>("downloaded_bytes") as u64,
                complete: row.get::<i64, _>("complete") != 0,
            })
            .collect())
    }

    pub async fn delete_download(&self, download_id: Uuid) -> Result<(), EngineError> {
        sqlx::query("DELETE FROM downloads WHERE id = ?")
            .bind(download_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Remove every download in the `Completed` state.
    pub async fn clear_completed(&self) -> Result<u64, EngineError> {
        let result = sqlx::query("DELETE FROM downloads WHERE status = 'COMPLETED'")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    // -- batches ---------------------------------------------------------

    pub async fn upsert_batch(&self, batch: &Batch) -> Result<(), EngineError> {
        sqlx::query(
            r#"
            INSERT INTO batches (id, name, destination, force_proxy, created_at)
            VALUES (?,?,?,?,?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                destination = excluded.destination,
                force_proxy = excluded.force_proxy
            "#,
        )
        .bind(batch.id.to_string())
        .bind(&batch.name)
        .bind(batch.destination.to_string_lossy().to_string())
        .bind(batch.force_proxy as i64)
        .bind(batch.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_batches(&self) -> Result<Vec<Batch>, EngineError> {
        let rows = sqlx::query("SELECT * FROM batches ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(row_to_batch).collect()
    }

    // -- settings ----------------------------------------------------------

    pub async fn get_setting(&self, key: &str) -> Result<Option<String>, EngineError> {
        let row = sqlx::query("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>("value")))
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> Result<(), EngineError> {
        sqlx::query(
            "INSERT INTO settings (key, value) VALUES (?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Load persisted `Settings`, falling back to the default on first run.
    pub async fn load_settings(&self) -> Result<Settings, EngineError> {
        match self.get_setting("settings_json").await? {
            Some(json) => serde_json::from_str(&json).map_err(|e| EngineError::Unknown(e.to_string())),
            None => Ok(Settings::default()),
        }
    }

    pub async fn save_settings(&self, settings: &Settings) -> Result<(), EngineError> {
        let json = serde_json::to_string(settings).map_err(|e| EngineError::Unknown(e.to_string()))?;
        self.set_setting("settings_json", &json).await
    }

    /// Fetch the Control API bearer token, generating and persisting a
    /// fresh 32-byte random one on first run.
    pub async fn get_or_create_api_token(&self) -> Result<String, EngineError> {
        if let Some(token) = self.get_setting("api_token").await? {
            return Ok(token);
        }
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let token = bytes.iter().map(|b| format!("{:02x}", b)).collect::<String>();
        self.set_setting("api_token", &token).await?;
        Ok(token)
    }

    // -- rules ---------------------------------------------------------

    pub async fn upsert_rule(&self, rule: &Rule) -> Result<i64, EngineError> {
        let kind_json = serde_json::to_string(&rule.kind).map_err(|e| EngineError::Unknown(e.to_string()))?;
        if rule.id < 0 {
            return Err(EngineError::InvalidOperation("rule id must not be negative".into()));
        }
        if rule.id == 0 {
            let result = sqlx::query("INSERT INTO rules (host_pattern, enabled, kind) VALUES (?,?,?)")
                .bind(&rule.host_pattern)
                .bind(rule.enabled as i64)
                .bind(kind_json)
                .execute(&self.pool)
                .await?;
            Ok(result.last_insert_rowid())
        } else {
            sqlx::query(
                r#"
                UPDATE rules SET host_pattern = ?, enabled = ?, kind = ?
                WHERE id = ?
                "#,
            )
            .bind(&rule.host_pattern)
            .bind(rule.enabled as i64)
            .bind(kind_json)
            .bind(rule.id)
            .execute(&self.pool)
            .await?;
            Ok(rule.id)
        }
    }

    pub async fn delete_rule(&self, id: i64) -> Result<(), EngineError> {
        sqlx::query("DELETE FROM rules WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn list_rules(&self) -> Result<Vec<Rule>, EngineError> {
        let rows = sqlx::query("SELECT * FROM rules ORDER BY id ASC").fetch_all(&self.pool).await?;
        rows.into_iter().map(row_to_rule).collect()
    }

    pub async fn list_enabled_rules(&self) -> Result<Vec<Rule>, EngineError> {
        let rows = sqlx::query("SELECT * FROM rules WHERE enabled = 1 ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(row_to_rule).collect()
    }
}

fn status_to_str(status: DownloadStatus) -> &'static str {
    match status {
        DownloadStatus::Queued => "QUEUED",
        DownloadStatus::Downloading => "DOWNLOADING",
        DownloadStatus::Paused => "PAUSED",
        DownloadStatus::Completed => "COMPLETED",
        DownloadStatus::Error => "ERROR",
    }
}

fn str_to_status(s: &str) -> DownloadStatus {
    match s {
        "DOWNLOADING" => DownloadStatus::Downloading,
        "PAUSED" => DownloadStatus::Paused,
        "COMPLETED" => DownloadStatus::Completed,
        "ERROR" => DownloadStatus::Error,
        _ => DownloadStatus::Queued,
    }
}

fn supports_ranges_to_str(s: SupportsRanges) -> &'static str {
    match s {
        SupportsRanges::Unknown => "unknown",
        SupportsRanges::Yes => "yes",
        SupportsRanges::No => "no",
    }
}

fn str_to_supports_ranges(s: &str) -> SupportsRanges {
    match s {
        "yes" => SupportsRanges::Yes,
        "no" => SupportsRanges::No,
        _ => SupportsRanges::Unknown,
    }
}

fn str_to_error_code(s: &str) -> Option<ErrorCode> {
    serde_json::from_value(serde_json::Value::String(s.to_string())).ok()
}

fn row_to_download(row: sqlx::sqlite::SqliteRow, segments: Vec<Segment>) -> Result<Download, EngineError> {
    use std::path::PathBuf;

    let parse_ts = |s: String| -> Result<DateTime<Utc>, EngineError> {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| EngineError::Unknown(e.to_string()))
    };

    Ok(Download {
        id: Uuid::parse_str(row.get::<String, _>("id").as_str())
            .map_err(|e| EngineError::Unknown(e.to_string()))?,
        url: row.get("url"),
        final_url: row.get("final_url"),
        filename: row.get("filename"),
        destination: PathBuf::from(row.get::<String, _>("destination")),
        size: row.get::<Option<i64>, _>("size").map(|s| s as u64),
        downloaded: row.get::<i64, _>("downloaded") as u64,
        status: str_to_status(&row.get::<String, _>("status")),
        supports_ranges: str_to_supports_ranges(&row.get::<String, _>("supports_ranges")),
        segments,
        batch_id: row
            .get::<Option<String>, _>("batch_id")
            .and_then(|s| Uuid::parse_str(&s).ok()),
        speed_limit: row.get::<Option<i64>, _>("speed_limit").map(|s| s as u64),
        mirror_used: row.get("mirror_used"),
        etag: row.get("etag"),
        last_modified: row.get("last_modified"),
        error_code: row
            .get::<Option<String>, _>("error_code")
            .and_then(|s| str_to_error_code(&s)),
        error_message: row.get("error_message"),
        retry_count: row.get::<i64, _>("retry_count") as u32,
        created_at: parse_ts(row.get::<String, _>("created_at"))?,
        updated_at: parse_ts(row.get::<String, _>("updated_at"))?,
        started_at: row
            .get::<Option<String>, _>("started_at")
            .map(parse_ts)
            .transpose()?,
        completed_at: row
            .get::<Option<String>, _>("completed_at")
            .map(parse_ts)
            .transpose()?,
    })
}

fn row_to_batch(row: sqlx::sqlite::SqliteRow) -> Result<Batch, EngineError> {
    use std::path::PathBuf;
    Ok(Batch {
        id: Uuid::parse_str(row.get::<String, _>("id").as_str())
            .map_err(|e| EngineError::Unknown(e.to_string()))?,
        name: row.get("name"),
        destination: PathBuf::from(row.get::<String, _>("destination")),
        force_proxy: row.get::<i64, _>("force_proxy") != 0,
        created_at: DateTime::parse_from_rfc3339(row.get::<String, _>("created_at").as_str())
            .map_err(|e| EngineError::Unknown(e.to_string()))?
            .with_timezone(&Utc),
    })
}

fn row_to_rule(row: sqlx::sqlite::SqliteRow) -> Result<Rule, EngineError> {
    let kind: RuleKind = serde_json::from_str(&row.get::<String, _>("kind"))
        .map_err(|e| EngineError::Unknown(e.to_string()))?;
    Ok(Rule {
        id: row.get("id"),
        host_pattern: row.get("host_pattern"),
        enabled: row.get::<i64, _>("enabled") != 0,
        kind,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[tokio::test]
    async fn upsert_and_load_round_trip() {
        let store = Store::open_in_memory().await.unwrap();
        let download = Download::new("https://example.com/f.bin".into(), PathBuf::from("/tmp"), None);
        store.upsert_download(&download).await.unwrap();

        let loaded = store.load_download(download.id).await.unwrap().unwrap();
        assert_eq!(loaded.url, download.url);
        assert_eq!(loaded.status, DownloadStatus::Queued);
    }

    #[tokio::test]
    async fn clear_completed_only_removes_completed() {
        let store = Store::open_in_memory().await.unwrap();
        let mut d1 = Download::new("https://example.com/a".into(), PathBuf::from("/tmp"), None);
        d1.status = DownloadStatus::Completed;
        let d2 = Download::new("https://example.com/b".into(), PathBuf::from("/tmp"), None);
        store.upsert_download(&d1).await.unwrap();
        store.upsert_download(&d2).await.unwrap();

        let removed = store.clear_completed().await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.load_download(d1.id).await.unwrap().is_none());
        assert!(store.load_download(d2.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn settings_round_trip_falls_back_to_default() {
        let store = Store::open_in_memory().await.unwrap();
        let loaded = store.load_settings().await.unwrap();
        assert_eq!(loaded.max_concurrent_downloads, Settings::default().max_concurrent_downloads);

        let mut custom = loaded;
        custom.max_concurrent_downloads = 9;
        store.save_settings(&custom).await.unwrap();
        let reloaded = store.load_settings().await.unwrap();
        assert_eq!(reloaded.max_concurrent_downloads, 9);
    }

    #[tokio::test]
    async fn api_token_is_generated_once_and_stable() {
        let store = Store::open_in_memory().await.unwrap();
        let first = store.get_or_create_api_token().await.unwrap();
        let second = store.get_or_create_api_token().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
    }
}
