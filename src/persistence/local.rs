use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, warn};

use super::{
    ImportOutcome, LocalStatus, LocalStore, PendingSync, ProductionStatus, SyncRecord,
    UnreadableStory,
};
use crate::error::StoreError;
use crate::state_machine::EpisodeId;
use crate::story::Story;

/// Row counts shown by `storyforge status`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreTotals {
    pub stories: i64,
    pub synced: i64,
    pub failed: i64,
}

/// Local story store backed by SQLite.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| StoreError::Backend(e.to_string()))?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA foreign_keys=ON;
        ",
        )?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS stories (
                fingerprint TEXT PRIMARY KEY,
                story_id TEXT NOT NULL,
                episode_id TEXT NOT NULL,
                title TEXT NOT NULL,
                quality_score REAL NOT NULL,
                payload TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_stories_episode ON stories(episode_id);

            CREATE TABLE IF NOT EXISTS sync_records (
                fingerprint TEXT PRIMARY KEY REFERENCES stories(fingerprint),
                local_status TEXT NOT NULL DEFAULT 'committed',
                production_status TEXT NOT NULL DEFAULT 'pending',
                last_error TEXT,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_sync_production ON sync_records(production_status);
        "#,
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn totals(&self) -> Result<StoreTotals, StoreError> {
        let conn = self.lock();
        let stories: i64 = conn.query_row("SELECT COUNT(*) FROM stories", [], |r| r.get(0))?;
        let by_status = |status: ProductionStatus| {
            conn.query_row(
                "SELECT COUNT(*) FROM sync_records WHERE production_status = ?1",
                params![status.as_str()],
                |r| r.get::<_, i64>(0),
            )
        };
        Ok(StoreTotals {
            stories,
            synced: by_status(ProductionStatus::Synced)?,
            failed: by_status(ProductionStatus::Failed)?,
        })
    }

    fn set_production_status(
        &self,
        fingerprint: &str,
        status: ProductionStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let conn = self.lock();
        let updated = conn.execute(
            "UPDATE sync_records SET production_status = ?1, last_error = ?2, updated_at = ?3
             WHERE fingerprint = ?4 AND local_status = 'committed'",
            params![status.as_str(), error, Utc::now().to_rfc3339(), fingerprint],
        )?;
        if updated == 0 {
            return Err(StoreError::Rejected(format!(
                "no committed story with fingerprint {fingerprint}"
            )));
        }
        Ok(())
    }
}

fn parse_story(payload: String) -> Result<Story, StoreError> {
    serde_json::from_str(&payload).map_err(|e| StoreError::Backend(format!("corrupt story payload: {e}")))
}

impl LocalStore for SqliteStore {
    async fn import_story(&self, story: &Story) -> Result<ImportOutcome, StoreError> {
        if story.title.trim().is_empty() || story.full_content.trim().is_empty() {
            return Err(StoreError::Rejected(format!("story {} has no content", story.id)));
        }
        let payload = serde_json::to_string(story)?;
        let now = Utc::now().to_rfc3339();

        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO stories
                (fingerprint, story_id, episode_id, title, quality_score, payload, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                story.fingerprint,
                story.id,
                story.source.episode_id.as_str(),
                story.title,
                story.quality_score,
                payload,
                now
            ],
        )?;
        if inserted == 0 {
            debug!(fingerprint = %story.fingerprint, "story already stored");
            return Ok(ImportOutcome::Duplicate);
        }
        tx.execute(
            "INSERT INTO sync_records (fingerprint, local_status, production_status, updated_at)
             VALUES (?1, 'committed', 'pending', ?2)",
            params![story.fingerprint, now],
        )?;
        tx.commit()?;
        Ok(ImportOutcome::Committed)
    }

    async fn get_story(&self, fingerprint: &str) -> Result<Option<Story>, StoreError> {
        let payload: Option<String> = self
            .lock()
            .query_row(
                "SELECT payload FROM stories WHERE fingerprint = ?1",
                params![fingerprint],
                |r| r.get(0),
            )
            .optional()?;
        payload.map(parse_story).transpose()
    }

    async fn pending_sync(&self) -> Result<PendingSync, StoreError> {
        let rows: Vec<(String, String, String)> = {
            let conn = self.lock();
            let mut stmt = conn.prepare(
                "SELECT s.fingerprint, s.episode_id, s.payload FROM stories s
                 JOIN sync_records r ON r.fingerprint = s.fingerprint
                 WHERE r.local_status = 'committed' AND r.production_status != 'synced'
                 ORDER BY s.created_at, s.fingerprint",
            )?;
            let rows = stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))?;
            rows.collect::<Result<_, _>>()?
        };

        let mut pending = PendingSync::default();
        for (fingerprint, episode_id, payload) in rows {
            match parse_story(payload) {
                Ok(story) => pending.stories.push(story),
                Err(error) => {
                    warn!(%fingerprint, %error, "skipping unreadable story");
                    pending.unreadable.push(UnreadableStory {
                        fingerprint,
                        episode_id: EpisodeId::from(episode_id.as_str()),
                        error,
                    });
                }
            }
        }
        Ok(pending)
    }

    async fn sync_record(&self, fingerprint: &str) -> Result<Option<SyncRecord>, StoreError> {
        let row: Option<(String, String, Option<String>, String)> = self
            .lock()
            .query_row(
                "SELECT local_status, production_status, last_error, updated_at
                 FROM sync_records WHERE fingerprint = ?1",
                params![fingerprint],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
            )
            .optional()?;
        let Some((local, status, last_error, updated_at)) = row else {
            return Ok(None);
        };
        let local_status = LocalStatus::parse(&local)
            .ok_or_else(|| StoreError::Backend(format!("unknown local status {local:?}")))?;
        let production_status = ProductionStatus::parse(&status)
            .ok_or_else(|| StoreError::Backend(format!("unknown production status {status:?}")))?;
        let updated_at = DateTime::parse_from_rfc3339(&updated_at)
            .map_err(|e| StoreError::Backend(e.to_string()))?
            .with_timezone(&Utc);
        Ok(Some(SyncRecord {
            fingerprint: fingerprint.to_string(),
            local_status,
            production_status,
            last_error,
            updated_at,
        }))
    }

    async fn mark_synced(&self, fingerprint: &str) -> Result<(), StoreError> {
        self.set_production_status(fingerprint, ProductionStatus::Synced, None)
    }

    async fn mark_sync_failed(&self, fingerprint: &str, error: &str) -> Result<(), StoreError> {
        self.set_production_status(fingerprint, ProductionStatus::Failed, Some(error))
    }
}
