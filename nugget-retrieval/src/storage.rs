//! On-disk cache of chunk vectors, keyed by content hash.
//!
//! Purely derived state: deleting the file only costs re-embedding. The
//! cache belongs to exactly one embedding model; opening it with another
//! model drops every stored vector.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use chrono::Utc;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tracing::info;

use crate::errors::RetrievalResult;

#[derive(Debug, Clone)]
pub struct EmbeddingCache {
    pool: SqlitePool,
    model_id: String,
}

impl EmbeddingCache {
    pub async fn open(db_path: &Path, model_id: &str) -> RetrievalResult<Self> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .after_connect(move |conn, _meta| {
                Box::pin(async move {
                    sqlx::query("PRAGMA journal_mode = WAL")
                        .execute(&mut *conn)
                        .await?;
                    sqlx::query("PRAGMA synchronous = NORMAL")
                        .execute(&mut *conn)
                        .await?;
                    Ok(())
                })
            })
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations/index").run(&pool).await?;

        let cache = Self {
            pool,
            model_id: model_id.to_string(),
        };
        cache.claim_model().await?;
        Ok(cache)
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// Record the model, clearing vectors written by a different one.
    async fn claim_model(&self) -> RetrievalResult<()> {
        let existing: Option<(String,)> =
            sqlx::query_as("SELECT value FROM meta WHERE key = 'embedding_model' LIMIT 1")
                .fetch_optional(&self.pool)
                .await?;

        if let Some((previous,)) = &existing
            && previous != &self.model_id
        {
            let cleared = sqlx::query("DELETE FROM chunk_vectors")
                .execute(&self.pool)
                .await?
                .rows_affected();
            info!(
                previous = %previous,
                model = %self.model_id,
                cleared,
                "embedding model changed, cached vectors invalidated"
            );
        }

        sqlx::query("INSERT OR REPLACE INTO meta (key, value) VALUES ('embedding_model', ?)")
            .bind(&self.model_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn lookup(&self, hashes: &[String]) -> RetrievalResult<HashMap<String, Vec<f32>>> {
        let mut found = HashMap::new();
        for hash in hashes {
            let row: Option<(Vec<u8>,)> =
                sqlx::query_as("SELECT vector FROM chunk_vectors WHERE content_hash = ?")
                    .bind(hash)
                    .fetch_optional(&self.pool)
                    .await?;
            if let Some((blob,)) = row {
                found.insert(hash.clone(), blob_to_vec(&blob));
            }
        }
        Ok(found)
    }

    pub async fn store(&self, entries: &[(String, Vec<f32>)]) -> RetrievalResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;
        for (hash, vector) in entries {
            sqlx::query(
                "INSERT OR REPLACE INTO chunk_vectors (content_hash, dims, vector, updated_at)
                 VALUES (?, ?, ?, ?)",
            )
            .bind(hash)
            .bind(vector.len() as i64)
            .bind(vec_to_blob(vector))
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Delete vectors whose chunk no longer exists. Returns rows removed.
    pub async fn retain(&self, live: &HashSet<String>) -> RetrievalResult<u64> {
        let stored: Vec<(String,)> = sqlx::query_as("SELECT content_hash FROM chunk_vectors")
            .fetch_all(&self.pool)
            .await?;
        let stale: Vec<String> = stored
            .into_iter()
            .map(|(hash,)| hash)
            .filter(|hash| !live.contains(hash))
            .collect();
        if stale.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        for hash in &stale {
            sqlx::query("DELETE FROM chunk_vectors WHERE content_hash = ?")
                .bind(hash)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(stale.len() as u64)
    }

    pub async fn len(&self) -> RetrievalResult<usize> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM chunk_vectors")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }
}

pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}
