use chrono::Utc;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::str::FromStr;

use crate::error::PersistenceError;
use crate::schema::{GenerationJob, StageState};

const DEFAULT_DATABASE_URL: &str = "sqlite://dreamscene.db";

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS history (
    id TEXT PRIMARY KEY NOT NULL,
    scene_prompt TEXT NOT NULL,
    image_url TEXT,
    image_state TEXT NOT NULL,
    video_state TEXT NOT NULL,
    error TEXT,
    used_reference INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL
)
"#;

/// Durable record of past jobs, keyed by job id.
#[async_trait::async_trait]
pub trait HistoryStore: Send + Sync {
    /// Upsert; the session-local video handle is never written.
    async fn save(&self, job: &GenerationJob) -> Result<(), PersistenceError>;
    /// Newest first (descending id).
    async fn get_all(&self) -> Result<Vec<GenerationJob>, PersistenceError>;
    async fn delete(&self, id: &str) -> Result<(), PersistenceError>;
    async fn clear(&self) -> Result<(), PersistenceError>;
}

pub struct SqliteHistoryStore {
    url: String,
    pool: tokio::sync::OnceCell<SqlitePool>,
}

#[derive(sqlx::FromRow)]
struct HistoryRow {
    id: String,
    scene_prompt: String,
    image_url: Option<String>,
    image_state: String,
    video_state: String,
    error: Option<String>,
    used_reference: bool,
}

impl TryFrom<HistoryRow> for GenerationJob {
    type Error = PersistenceError;

    fn try_from(row: HistoryRow) -> Result<Self, Self::Error> {
        let parse = |raw: &str| {
            StageState::from_str(raw).map_err(|reason| PersistenceError::Corrupt {
                id: row.id.clone(),
                reason,
            })
        };
        let image_state = parse(&row.image_state)?;
        let video_state = parse(&row.video_state)?;
        Ok(GenerationJob::restore(
            row.id,
            row.scene_prompt,
            row.image_url,
            image_state,
            video_state,
            row.error,
            row.used_reference,
        ))
    }
}

impl SqliteHistoryStore {
    /// Nothing is opened until the first operation.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            pool: tokio::sync::OnceCell::new(),
        }
    }

    pub fn from_env() -> Self {
        let url = std::env::var("DREAMSCENE_DATABASE_URL")
            .unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string());
        Self::new(url)
    }

    async fn pool(&self) -> Result<&SqlitePool, PersistenceError> {
        let pool = self.pool.get_or_try_init(|| open_pool(&self.url)).await?;
        Ok(pool)
    }
}

async fn open_pool(url: &str) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
    // a single connection serializes writes and keeps `sqlite::memory:` databases alive
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;
    sqlx::query(SCHEMA).execute(&pool).await?;
    tracing::info!(url, "history: store opened");
    Ok(pool)
}

#[async_trait::async_trait]
impl HistoryStore for SqliteHistoryStore {
    async fn save(&self, job: &GenerationJob) -> Result<(), PersistenceError> {
        let record = job.durable();
        let pool = self.pool().await?;
        sqlx::query(
            r#"
            INSERT INTO history
                (id, scene_prompt, image_url, image_state, video_state, error, used_reference, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                scene_prompt = excluded.scene_prompt,
                image_url = excluded.image_url,
                image_state = excluded.image_state,
                video_state = excluded.video_state,
                error = excluded.error,
                used_reference = excluded.used_reference,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(record.id.as_str())
        .bind(record.scene_prompt())
        .bind(record.image_url.as_deref())
        .bind(record.image_state.as_str())
        .bind(record.video_state.as_str())
        .bind(record.error.as_deref())
        .bind(record.used_reference)
        .bind(Utc::now())
        .execute(pool)
        .await?;
        tracing::debug!(job_id = %record.id, "history: saved");
        Ok(())
    }

    async fn get_all(&self) -> Result<Vec<GenerationJob>, PersistenceError> {
        let pool = self.pool().await?;
        let rows = sqlx::query_as::<_, HistoryRow>(
            r#"
            SELECT id, scene_prompt, image_url, image_state, video_state, error, used_reference
            FROM history
            ORDER BY id DESC
            "#,
        )
        .fetch_all(pool)
        .await?;
        rows.into_iter().map(GenerationJob::try_from).collect()
    }

    async fn delete(&self, id: &str) -> Result<(), PersistenceError> {
        let pool = self.pool().await?;
        sqlx::query("DELETE FROM history WHERE id = ?")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    async fn clear(&self) -> Result<(), PersistenceError> {
        let pool = self.pool().await?;
        sqlx::query("DELETE FROM history").execute(pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::GenerationMode;

    fn memory_store() -> SqliteHistoryStore {
        SqliteHistoryStore::new("sqlite::memory:")
    }

    fn finished_job(id: &str) -> GenerationJob {
        let mut job = GenerationJob::new(
            id.to_string(),
            format!("scene {id}"),
            GenerationMode::ImageThenVideo,
            true,
        );
        job.complete_image("data:image/png;base64,AAAA".to_string());
        job.begin_video();
        job.complete_video("blob:5f0c4a1e-0000-4000-8000-000000000000".to_string());
        job
    }

    #[tokio::test]
    async fn round_trip_drops_only_the_video_handle() {
        let store = memory_store();
        let job = finished_job("1700000000000-0");
        store.save(&job).await.unwrap();

        let stored = store.get_all().await.unwrap();
        assert_eq!(stored.len(), 1);
        assert!(stored[0].video_url.is_none());
        assert_eq!(stored[0], job.durable());
        assert_eq!(stored[0].scene_prompt(), job.scene_prompt());
        assert_eq!(stored[0].image_url, job.image_url);
        assert!(stored[0].used_reference);
    }

    #[tokio::test]
    async fn save_overwrites_existing_record() {
        let store = memory_store();
        let mut job = GenerationJob::new(
            "1700000000000-0".to_string(),
            "scene".to_string(),
            GenerationMode::ImageOnly,
            false,
        );
        store.save(&job).await.unwrap();
        job.complete_image("data:image/png;base64,AAAA".to_string());
        store.save(&job).await.unwrap();

        let stored = store.get_all().await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].image_state, StageState::Done);
    }

    #[tokio::test]
    async fn lists_newest_first() {
        let store = memory_store();
        for id in ["1700000000000-1", "1700000009999-0", "1700000000000-0"] {
            store.save(&finished_job(id)).await.unwrap();
        }
        let ids: Vec<String> = store
            .get_all()
            .await
            .unwrap()
            .into_iter()
            .map(|j| j.id)
            .collect();
        assert_eq!(
            ids,
            vec!["1700000009999-0", "1700000000000-1", "1700000000000-0"]
        );
    }

    #[tokio::test]
    async fn delete_and_clear() {
        let store = memory_store();
        store.save(&finished_job("1-0")).await.unwrap();
        store.save(&finished_job("1-1")).await.unwrap();

        store.delete("1-0").await.unwrap();
        let remaining = store.get_all().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, "1-1");

        // deleting a missing id is not an error
        store.delete("nope").await.unwrap();

        store.clear().await.unwrap();
        assert!(store.get_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn usable_without_explicit_open() {
        let store = memory_store();
        assert!(store.get_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unreachable_database_is_a_persistence_error() {
        let store = SqliteHistoryStore::new("sqlite:///nonexistent-dir/for/dreamscene/history.db");
        let err = store.get_all().await.unwrap_err();
        assert!(matches!(err, PersistenceError::Database(_)));
    }
}
