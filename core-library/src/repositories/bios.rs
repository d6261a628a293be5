//! BIOS repository trait and implementation

use crate::error::Result;
use crate::models::{normalize_md5, Bios};
use crate::repositories::{invalid, Merge, Mutation, UpsertOutcome};
use async_trait::async_trait;
use sqlx::{query_as, SqliteConnection, SqlitePool};

#[async_trait]
pub trait BiosRepository: Send + Sync {
    async fn find_by_md5(&self, md5: &str) -> Result<Option<Bios>>;

    async fn find_by_record_id(&self, record_id: &str) -> Result<Option<Bios>>;

    async fn find_by_file_name(&self, expected_filename: &str) -> Result<Option<Bios>>;

    async fn insert(&self, bios: &Bios) -> Result<()>;

    async fn upsert(&self, incoming: Bios, merge: Merge<Bios>) -> Result<UpsertOutcome>;

    async fn update_with(&self, md5: &str, mutation: Mutation<Bios>) -> Result<bool>;

    async fn delete(&self, md5: &str) -> Result<bool>;

    async fn list_all(&self) -> Result<Vec<Bios>>;

    async fn count(&self) -> Result<i64>;

    async fn mark_synced(&self, md5: &str, record_id: &str, synced_at: i64) -> Result<bool> {
        let record_id = record_id.to_string();
        self.update_with(
            md5,
            Box::new(move |bios| {
                bios.remote_record_id = Some(record_id);
                bios.last_synced_at = Some(synced_at);
                true
            }),
        )
        .await
    }

    async fn set_downloaded(&self, md5: &str, downloaded: bool) -> Result<bool> {
        self.update_with(
            md5,
            Box::new(move |bios| {
                let changed = bios.is_downloaded != downloaded;
                bios.is_downloaded = downloaded;
                changed
            }),
        )
        .await
    }
}

/// SQLite implementation of BiosRepository
pub struct SqliteBiosRepository {
    pool: SqlitePool,
}

impl SqliteBiosRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn load(conn: &mut SqliteConnection, md5: &str) -> Result<Option<Bios>> {
        Ok(query_as::<_, Bios>("SELECT * FROM bios WHERE md5 = ?")
            .bind(md5)
            .fetch_optional(&mut *conn)
            .await?)
    }

    async fn insert_row(conn: &mut SqliteConnection, bios: &Bios) -> Result<()> {
        bios.validate().map_err(|msg| invalid("bios", msg))?;

        sqlx::query(
            r#"
            INSERT INTO bios (
                md5, expected_filename, expected_size, system_identifier,
                description_text, optional, remote_record_id, last_synced_at, is_downloaded
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&bios.md5)
        .bind(&bios.expected_filename)
        .bind(bios.expected_size)
        .bind(&bios.system_identifier)
        .bind(&bios.description_text)
        .bind(bios.optional)
        .bind(&bios.remote_record_id)
        .bind(bios.last_synced_at)
        .bind(bios.is_downloaded)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    async fn update_row(conn: &mut SqliteConnection, bios: &Bios) -> Result<()> {
        bios.validate().map_err(|msg| invalid("bios", msg))?;

        sqlx::query(
            r#"
            UPDATE bios SET
                expected_filename = ?, expected_size = ?, system_identifier = ?,
                description_text = ?, optional = ?, remote_record_id = ?,
                last_synced_at = ?, is_downloaded = ?
            WHERE md5 = ?
            "#,
        )
        .bind(&bios.expected_filename)
        .bind(bios.expected_size)
        .bind(&bios.system_identifier)
        .bind(&bios.description_text)
        .bind(bios.optional)
        .bind(&bios.remote_record_id)
        .bind(bios.last_synced_at)
        .bind(bios.is_downloaded)
        .bind(&bios.md5)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl BiosRepository for SqliteBiosRepository {
    async fn find_by_md5(&self, md5: &str) -> Result<Option<Bios>> {
        let mut conn = self.pool.acquire().await?;
        Self::load(&mut conn, &normalize_md5(md5)).await
    }

    async fn find_by_record_id(&self, record_id: &str) -> Result<Option<Bios>> {
        Ok(
            query_as::<_, Bios>("SELECT * FROM bios WHERE remote_record_id = ? LIMIT 1")
                .bind(record_id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn find_by_file_name(&self, expected_filename: &str) -> Result<Option<Bios>> {
        Ok(
            query_as::<_, Bios>("SELECT * FROM bios WHERE expected_filename = ? LIMIT 1")
                .bind(expected_filename)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn insert(&self, bios: &Bios) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        Self::insert_row(&mut conn, bios).await
    }

    async fn upsert(&self, incoming: Bios, merge: Merge<Bios>) -> Result<UpsertOutcome> {
        let mut tx = self.pool.begin().await?;

        let outcome = match Self::load(&mut tx, &incoming.md5).await? {
            None => {
                Self::insert_row(&mut tx, &incoming).await?;
                UpsertOutcome::Created
            }
            Some(mut current) => {
                if merge(&mut current, &incoming) {
                    Self::update_row(&mut tx, &current).await?;
                    UpsertOutcome::Updated
                } else {
                    UpsertOutcome::Unchanged
                }
            }
        };

        tx.commit().await?;
        Ok(outcome)
    }

    async fn update_with(&self, md5: &str, mutation: Mutation<Bios>) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let Some(mut current) = Self::load(&mut tx, &normalize_md5(md5)).await? else {
            return Ok(false);
        };
        if !mutation(&mut current) {
            return Ok(false);
        }
        Self::update_row(&mut tx, &current).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn delete(&self, md5: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM bios WHERE md5 = ?")
            .bind(normalize_md5(md5))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_all(&self) -> Result<Vec<Bios>> {
        Ok(
            query_as::<_, Bios>("SELECT * FROM bios ORDER BY system_identifier, expected_filename")
                .fetch_all(&self.pool)
                .await?,
        )
    }

    async fn count(&self) -> Result<i64> {
        let count: (i64,) = query_as("SELECT COUNT(*) FROM bios")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.0)
    }
}
