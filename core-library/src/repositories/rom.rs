//! ROM repository trait and implementation

use crate::error::{LibraryError, Result};
use crate::models::{normalize_md5, Rom, RomRow};
use crate::repositories::{invalid, now_millis, Merge, Mutation, UpsertOutcome};
use async_trait::async_trait;
use sqlx::{query_as, SqliteConnection, SqlitePool};
use tracing::debug;

/// ROM repository interface
#[async_trait]
pub trait RomRepository: Send + Sync {
    /// Find a ROM by content hash (case-insensitive)
    async fn find_by_md5(&self, md5: &str) -> Result<Option<Rom>>;

    /// Find a ROM linked to a remote record
    async fn find_by_record_id(&self, record_id: &str) -> Result<Option<Rom>>;

    /// Find a ROM by primary file name
    async fn find_by_file_name(&self, file_name: &str) -> Result<Option<Rom>>;

    /// Insert a new ROM
    ///
    /// # Errors
    /// Fails when a ROM with the same hash exists or validation fails.
    async fn insert(&self, rom: &Rom) -> Result<()>;

    /// Insert `incoming` when its hash is unseen, otherwise merge it into the
    /// stored row. Both branches run in one transaction.
    async fn upsert(&self, incoming: Rom, merge: Merge<Rom>) -> Result<UpsertOutcome>;

    /// Apply `mutation` to the stored row.
    ///
    /// # Returns
    /// - `Ok(true)` if the row existed and changed
    /// - `Ok(false)` if missing or unchanged
    async fn update_with(&self, md5: &str, mutation: Mutation<Rom>) -> Result<bool>;

    /// Delete a ROM; its save states cascade
    ///
    /// # Returns
    /// `Ok(false)` when nothing was deleted
    async fn delete(&self, md5: &str) -> Result<bool>;

    async fn list_all(&self) -> Result<Vec<Rom>>;

    /// ROMs with no remote counterpart yet
    async fn list_unsynced(&self) -> Result<Vec<Rom>>;

    async fn count(&self) -> Result<i64>;

    /// Record the remote record id and sync time
    async fn mark_synced(&self, md5: &str, record_id: &str, synced_at: i64) -> Result<bool> {
        let record_id = record_id.to_string();
        self.update_with(
            md5,
            Box::new(move |rom| {
                rom.remote_record_id = Some(record_id);
                rom.last_synced_at = Some(synced_at);
                true
            }),
        )
        .await
    }

    /// Flip the local payload flag, optionally recording the payload size
    async fn set_downloaded(&self, md5: &str, downloaded: bool, size: Option<i64>) -> Result<bool> {
        self.update_with(
            md5,
            Box::new(move |rom| {
                let changed = rom.is_downloaded != downloaded
                    || (size.is_some() && rom.file_size != size);
                rom.is_downloaded = downloaded;
                if size.is_some() {
                    rom.file_size = size;
                }
                changed
            }),
        )
        .await
    }
}

/// SQLite implementation of RomRepository
pub struct SqliteRomRepository {
    pool: SqlitePool,
}

impl SqliteRomRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn load(conn: &mut SqliteConnection, md5: &str) -> Result<Option<Rom>> {
        query_as::<_, RomRow>("SELECT * FROM roms WHERE md5 = ?")
            .bind(md5)
            .fetch_optional(&mut *conn)
            .await?
            .map(Rom::try_from)
            .transpose()
    }

    fn related_json(rom: &Rom) -> Result<String> {
        serde_json::to_string(&rom.related_files).map_err(|source| LibraryError::Corrupt {
            column: "roms.related_files",
            source,
        })
    }

    async fn insert_row(conn: &mut SqliteConnection, rom: &Rom) -> Result<()> {
        rom.validate().map_err(|msg| invalid("rom", msg))?;

        sqlx::query(
            r#"
            INSERT INTO roms (
                md5, title, file_name, system_identifier, related_files, file_size,
                description, developer, publisher, genres, rating,
                play_count, time_spent_in_game, last_played, is_favorite,
                remote_record_id, last_synced_at, is_downloaded,
                created_at, updated_at
            ) VALUES (
                ?, ?, ?, ?, ?, ?,
                ?, ?, ?, ?, ?,
                ?, ?, ?, ?,
                ?, ?, ?,
                ?, ?
            )
            "#,
        )
        .bind(&rom.md5)
        .bind(&rom.title)
        .bind(&rom.file_name)
        .bind(&rom.system_identifier)
        .bind(Self::related_json(rom)?)
        .bind(rom.file_size)
        .bind(&rom.description)
        .bind(&rom.developer)
        .bind(&rom.publisher)
        .bind(&rom.genres)
        .bind(rom.rating)
        .bind(rom.play_count)
        .bind(rom.time_spent_in_game)
        .bind(rom.last_played)
        .bind(rom.is_favorite)
        .bind(&rom.remote_record_id)
        .bind(rom.last_synced_at)
        .bind(rom.is_downloaded)
        .bind(rom.created_at)
        .bind(rom.updated_at)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    async fn update_row(conn: &mut SqliteConnection, rom: &Rom) -> Result<()> {
        rom.validate().map_err(|msg| invalid("rom", msg))?;

        sqlx::query(
            r#"
            UPDATE roms SET
                title = ?, file_name = ?, system_identifier = ?, related_files = ?,
                file_size = ?, description = ?, developer = ?, publisher = ?,
                genres = ?, rating = ?, play_count = ?, time_spent_in_game = ?,
                last_played = ?, is_favorite = ?, remote_record_id = ?,
                last_synced_at = ?, is_downloaded = ?, updated_at = ?
            WHERE md5 = ?
            "#,
        )
        .bind(&rom.title)
        .bind(&rom.file_name)
        .bind(&rom.system_identifier)
        .bind(Self::related_json(rom)?)
        .bind(rom.file_size)
        .bind(&rom.description)
        .bind(&rom.developer)
        .bind(&rom.publisher)
        .bind(&rom.genres)
        .bind(rom.rating)
        .bind(rom.play_count)
        .bind(rom.time_spent_in_game)
        .bind(rom.last_played)
        .bind(rom.is_favorite)
        .bind(&rom.remote_record_id)
        .bind(rom.last_synced_at)
        .bind(rom.is_downloaded)
        .bind(rom.updated_at)
        .bind(&rom.md5)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    async fn fetch_rows(&self, sql: &str) -> Result<Vec<Rom>> {
        query_as::<_, RomRow>(sql)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(Rom::try_from)
            .collect()
    }
}

#[async_trait]
impl RomRepository for SqliteRomRepository {
    async fn find_by_md5(&self, md5: &str) -> Result<Option<Rom>> {
        let mut conn = self.pool.acquire().await?;
        Self::load(&mut conn, &normalize_md5(md5)).await
    }

    async fn find_by_record_id(&self, record_id: &str) -> Result<Option<Rom>> {
        query_as::<_, RomRow>("SELECT * FROM roms WHERE remote_record_id = ? LIMIT 1")
            .bind(record_id)
            .fetch_optional(&self.pool)
            .await?
            .map(Rom::try_from)
            .transpose()
    }

    async fn find_by_file_name(&self, file_name: &str) -> Result<Option<Rom>> {
        query_as::<_, RomRow>("SELECT * FROM roms WHERE file_name = ? ORDER BY created_at LIMIT 1")
            .bind(file_name)
            .fetch_optional(&self.pool)
            .await?
            .map(Rom::try_from)
            .transpose()
    }

    async fn insert(&self, rom: &Rom) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        Self::insert_row(&mut conn, rom).await
    }

    async fn upsert(&self, incoming: Rom, merge: Merge<Rom>) -> Result<UpsertOutcome> {
        let mut tx = self.pool.begin().await?;

        let outcome = match Self::load(&mut tx, &incoming.md5).await? {
            None => {
                Self::insert_row(&mut tx, &incoming).await?;
                UpsertOutcome::Created
            }
            Some(mut current) => {
                if merge(&mut current, &incoming) {
                    current.updated_at = now_millis();
                    Self::update_row(&mut tx, &current).await?;
                    UpsertOutcome::Updated
                } else {
                    UpsertOutcome::Unchanged
                }
            }
        };

        tx.commit().await?;
        debug!(md5 = %incoming.md5, ?outcome, "Upserted ROM");
        Ok(outcome)
    }

    async fn update_with(&self, md5: &str, mutation: Mutation<Rom>) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let Some(mut current) = Self::load(&mut tx, &normalize_md5(md5)).await? else {
            return Ok(false);
        };

        if !mutation(&mut current) {
            return Ok(false);
        }

        current.updated_at = now_millis();
        Self::update_row(&mut tx, &current).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn delete(&self, md5: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM roms WHERE md5 = ?")
            .bind(normalize_md5(md5))
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_all(&self) -> Result<Vec<Rom>> {
        self.fetch_rows("SELECT * FROM roms ORDER BY title").await
    }

    async fn list_unsynced(&self) -> Result<Vec<Rom>> {
        self.fetch_rows("SELECT * FROM roms WHERE remote_record_id IS NULL ORDER BY created_at")
            .await
    }

    async fn count(&self) -> Result<i64> {
        let count: (i64,) = query_as("SELECT COUNT(*) FROM roms")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_test_pool;

    fn sample(md5: &str, title: &str) -> Rom {
        let mut rom = Rom::new(md5, title, format!("{title}.sfc"), "snes");
        rom.related_files = vec!["extra.bin".into()];
        rom
    }

    fn keep_larger_play_count() -> Merge<Rom> {
        Box::new(|current, incoming| {
            let merged = current.play_count.max(incoming.play_count);
            let changed = merged != current.play_count;
            current.play_count = merged;
            changed
        })
    }

    #[tokio::test]
    async fn test_insert_and_find() {
        let repo = SqliteRomRepository::new(create_test_pool().await.unwrap());
        let rom = sample("abc123", "Chrono");

        repo.insert(&rom).await.unwrap();

        let found = repo.find_by_md5("ABC123").await.unwrap().unwrap();
        assert_eq!(found.title, "Chrono");
        assert_eq!(found.related_files, vec!["extra.bin".to_string()]);
        assert!(repo.find_by_file_name("Chrono.sfc").await.unwrap().is_some());
        assert_eq!(repo.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_insert_rejects_invalid() {
        let repo = SqliteRomRepository::new(create_test_pool().await.unwrap());
        let mut rom = sample("abc", "X");
        rom.file_name.clear();

        assert!(matches!(
            repo.insert(&rom).await,
            Err(LibraryError::InvalidInput { .. })
        ));
    }

    #[tokio::test]
    async fn test_upsert_creates_then_merges() {
        let repo = SqliteRomRepository::new(create_test_pool().await.unwrap());

        let mut first = sample("abc", "Chrono");
        first.play_count = 5;
        assert_eq!(
            repo.upsert(first, keep_larger_play_count()).await.unwrap(),
            UpsertOutcome::Created
        );

        let mut lower = sample("abc", "Chrono");
        lower.play_count = 3;
        assert_eq!(
            repo.upsert(lower, keep_larger_play_count()).await.unwrap(),
            UpsertOutcome::Unchanged
        );

        let mut higher = sample("abc", "Chrono");
        higher.play_count = 9;
        assert_eq!(
            repo.upsert(higher, keep_larger_play_count()).await.unwrap(),
            UpsertOutcome::Updated
        );
        assert_eq!(repo.find_by_md5("abc").await.unwrap().unwrap().play_count, 9);
    }

    #[tokio::test]
    async fn test_mark_synced_and_lookup_by_record() {
        let repo = SqliteRomRepository::new(create_test_pool().await.unwrap());
        repo.insert(&sample("abc", "Chrono")).await.unwrap();
        assert_eq!(repo.list_unsynced().await.unwrap().len(), 1);

        assert!(repo.mark_synced("abc", "rom_ABC", 1_700_000_000_000).await.unwrap());

        let rom = repo.find_by_record_id("rom_ABC").await.unwrap().unwrap();
        assert_eq!(rom.last_synced_at, Some(1_700_000_000_000));
        assert!(repo.list_unsynced().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_set_downloaded_is_idempotent() {
        let repo = SqliteRomRepository::new(create_test_pool().await.unwrap());
        repo.insert(&sample("abc", "Chrono")).await.unwrap();

        assert!(repo.set_downloaded("abc", true, Some(4096)).await.unwrap());
        assert!(!repo.set_downloaded("abc", true, Some(4096)).await.unwrap());
        assert!(!repo.set_downloaded("missing", true, None).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_twice() {
        let repo = SqliteRomRepository::new(create_test_pool().await.unwrap());
        repo.insert(&sample("abc", "Chrono")).await.unwrap();

        assert!(repo.delete("abc").await.unwrap());
        assert!(!repo.delete("abc").await.unwrap());
    }
}
