//! Save state repository trait and implementation

use crate::error::Result;
use crate::models::{normalize_md5, SaveState};
use crate::repositories::{invalid, Merge, Mutation, UpsertOutcome};
use async_trait::async_trait;
use sqlx::{query_as, SqliteConnection, SqlitePool};

/// Save state repository interface
#[async_trait]
pub trait SaveStateRepository: Send + Sync {
    async fn find_by_id(&self, id: &str) -> Result<Option<SaveState>>;

    async fn find_by_record_id(&self, record_id: &str) -> Result<Option<SaveState>>;

    /// Natural key of a state: owning game plus file name
    async fn find_by_game_and_file_name(
        &self,
        game_md5: &str,
        file_name: &str,
    ) -> Result<Option<SaveState>>;

    /// Insert a new state; the owning ROM must exist
    async fn insert(&self, state: &SaveState) -> Result<()>;

    /// Insert or merge by id inside one transaction
    async fn upsert(&self, incoming: SaveState, merge: Merge<SaveState>) -> Result<UpsertOutcome>;

    async fn update_with(&self, id: &str, mutation: Mutation<SaveState>) -> Result<bool>;

    async fn delete(&self, id: &str) -> Result<bool>;

    async fn list_all(&self) -> Result<Vec<SaveState>>;

    async fn list_for_game(&self, game_md5: &str) -> Result<Vec<SaveState>>;

    async fn count(&self) -> Result<i64>;

    async fn mark_synced(&self, id: &str, record_id: &str, synced_at: i64) -> Result<bool> {
        let record_id = record_id.to_string();
        self.update_with(
            id,
            Box::new(move |state| {
                state.remote_record_id = Some(record_id);
                state.last_synced_at = Some(synced_at);
                true
            }),
        )
        .await
    }

    async fn set_downloaded(&self, id: &str, downloaded: bool) -> Result<bool> {
        self.update_with(
            id,
            Box::new(move |state| {
                let changed = state.is_downloaded != downloaded;
                state.is_downloaded = downloaded;
                changed
            }),
        )
        .await
    }
}

/// SQLite implementation of SaveStateRepository
pub struct SqliteSaveStateRepository {
    pool: SqlitePool,
}

impl SqliteSaveStateRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn load(conn: &mut SqliteConnection, id: &str) -> Result<Option<SaveState>> {
        let state = query_as::<_, SaveState>("SELECT * FROM save_states WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;
        Ok(state)
    }

    async fn write(conn: &mut SqliteConnection, state: &SaveState, is_new: bool) -> Result<()> {
        state.validate().map_err(|msg| invalid("save_state", msg))?;

        let sql = if is_new {
            r#"
            INSERT INTO save_states (
                game_md5, system_identifier, file_name, file_size, is_auto_save,
                created_at, modified_at, last_modified_device, image_file_name,
                remote_record_id, last_synced_at, is_downloaded, id
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#
        } else {
            r#"
            UPDATE save_states SET
                game_md5 = ?, system_identifier = ?, file_name = ?, file_size = ?,
                is_auto_save = ?, created_at = ?, modified_at = ?,
                last_modified_device = ?, image_file_name = ?, remote_record_id = ?,
                last_synced_at = ?, is_downloaded = ?
            WHERE id = ?
            "#
        };

        sqlx::query(sql)
            .bind(&state.game_md5)
            .bind(&state.system_identifier)
            .bind(&state.file_name)
            .bind(state.file_size)
            .bind(state.is_auto_save)
            .bind(state.created_at)
            .bind(state.modified_at)
            .bind(&state.last_modified_device)
            .bind(&state.image_file_name)
            .bind(&state.remote_record_id)
            .bind(state.last_synced_at)
            .bind(state.is_downloaded)
            .bind(&state.id)
            .execute(&mut *conn)
            .await?;

        Ok(())
    }
}

#[async_trait]
impl SaveStateRepository for SqliteSaveStateRepository {
    async fn find_by_id(&self, id: &str) -> Result<Option<SaveState>> {
        let mut conn = self.pool.acquire().await?;
        Self::load(&mut conn, id).await
    }

    async fn find_by_record_id(&self, record_id: &str) -> Result<Option<SaveState>> {
        let state =
            query_as::<_, SaveState>("SELECT * FROM save_states WHERE remote_record_id = ? LIMIT 1")
                .bind(record_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(state)
    }

    async fn find_by_game_and_file_name(
        &self,
        game_md5: &str,
        file_name: &str,
    ) -> Result<Option<SaveState>> {
        let state = query_as::<_, SaveState>(
            "SELECT * FROM save_states WHERE game_md5 = ? AND file_name = ? LIMIT 1",
        )
        .bind(normalize_md5(game_md5))
        .bind(file_name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(state)
    }

    async fn insert(&self, state: &SaveState) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        Self::write(&mut conn, state, true).await
    }

    async fn upsert(&self, incoming: SaveState, merge: Merge<SaveState>) -> Result<UpsertOutcome> {
        let mut tx = self.pool.begin().await?;

        let outcome = match Self::load(&mut tx, &incoming.id).await? {
            None => {
                Self::write(&mut tx, &incoming, true).await?;
                UpsertOutcome::Created
            }
            Some(mut current) => {
                if merge(&mut current, &incoming) {
                    Self::write(&mut tx, &current, false).await?;
                    UpsertOutcome::Updated
                } else {
                    UpsertOutcome::Unchanged
                }
            }
        };

        tx.commit().await?;
        Ok(outcome)
    }

    async fn update_with(&self, id: &str, mutation: Mutation<SaveState>) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let mut changed = false;
        if let Some(mut current) = Self::load(&mut tx, id).await? {
            if mutation(&mut current) {
                Self::write(&mut tx, &current, false).await?;
                changed = true;
            }
        }

        tx.commit().await?;
        Ok(changed)
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM save_states WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_all(&self) -> Result<Vec<SaveState>> {
        let states = query_as::<_, SaveState>("SELECT * FROM save_states ORDER BY modified_at DESC")
            .fetch_all(&self.pool)
            .await?;
        Ok(states)
    }

    async fn list_for_game(&self, game_md5: &str) -> Result<Vec<SaveState>> {
        let states = query_as::<_, SaveState>(
            "SELECT * FROM save_states WHERE game_md5 = ? ORDER BY modified_at DESC",
        )
        .bind(normalize_md5(game_md5))
        .fetch_all(&self.pool)
        .await?;
        Ok(states)
    }

    async fn count(&self) -> Result<i64> {
        let count: (i64,) = query_as("SELECT COUNT(*) FROM save_states")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.0)
    }
}
