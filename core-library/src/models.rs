//! Domain models for the local library.
//!
//! All timestamps are Unix milliseconds. Keys are normalised on construction:
//! ROM and BIOS MD5 hashes are stored uppercased.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::error::LibraryError;

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Uppercase and trim a content hash.
pub fn normalize_md5(md5: &str) -> String {
    md5.trim().to_ascii_uppercase()
}

// =============================================================================
// ROM
// =============================================================================

/// Game ROM, keyed by content hash
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rom {
    /// Uppercased MD5 of the primary file
    pub md5: String,
    pub title: String,
    /// Primary payload file name inside `ROMs/<system>/`
    pub file_name: String,
    pub system_identifier: String,
    /// Companion files (e.g. `.bin` tracks of a `.cue`) stored beside the primary
    pub related_files: Vec<String>,
    pub file_size: Option<i64>,

    pub description: Option<String>,
    pub developer: Option<String>,
    pub publisher: Option<String>,
    pub genres: Option<String>,
    pub rating: Option<f64>,

    /// Monotonic counters; reconciliation keeps the larger value
    pub play_count: i64,
    /// Seconds
    pub time_spent_in_game: i64,
    pub last_played: Option<i64>,
    pub is_favorite: bool,

    pub remote_record_id: Option<String>,
    pub last_synced_at: Option<i64>,
    /// Whether the payload exists locally
    pub is_downloaded: bool,

    pub created_at: i64,
    pub updated_at: i64,
}

impl Rom {
    pub fn new(
        md5: &str,
        title: impl Into<String>,
        file_name: impl Into<String>,
        system_identifier: impl Into<String>,
    ) -> Self {
        let now = now_millis();
        Self {
            md5: normalize_md5(md5),
            title: title.into(),
            file_name: file_name.into(),
            system_identifier: system_identifier.into(),
            related_files: Vec::new(),
            file_size: None,
            description: None,
            developer: None,
            publisher: None,
            genres: None,
            rating: None,
            play_count: 0,
            time_spent_in_game: 0,
            last_played: None,
            is_favorite: false,
            remote_record_id: None,
            last_synced_at: None,
            is_downloaded: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.md5.is_empty() {
            return Err("ROM hash cannot be empty".to_string());
        }
        if self.file_name.trim().is_empty() {
            return Err("ROM file name cannot be empty".to_string());
        }
        if self.system_identifier.trim().is_empty() {
            return Err("ROM system identifier cannot be empty".to_string());
        }
        if self.play_count < 0 || self.time_spent_in_game < 0 {
            return Err("ROM counters cannot be negative".to_string());
        }
        Ok(())
    }

    /// Primary file plus companions
    pub fn all_file_names(&self) -> Vec<&str> {
        std::iter::once(self.file_name.as_str())
            .chain(self.related_files.iter().map(String::as_str))
            .collect()
    }
}

/// Row shape of the `roms` table; `related_files` is a JSON array.
#[derive(Debug, FromRow)]
pub(crate) struct RomRow {
    pub md5: String,
    pub title: String,
    pub file_name: String,
    pub system_identifier: String,
    pub related_files: String,
    pub file_size: Option<i64>,
    pub description: Option<String>,
    pub developer: Option<String>,
    pub publisher: Option<String>,
    pub genres: Option<String>,
    pub rating: Option<f64>,
    pub play_count: i64,
    pub time_spent_in_game: i64,
    pub last_played: Option<i64>,
    pub is_favorite: bool,
    pub remote_record_id: Option<String>,
    pub last_synced_at: Option<i64>,
    pub is_downloaded: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl TryFrom<RomRow> for Rom {
    type Error = LibraryError;

    fn try_from(row: RomRow) -> Result<Self, Self::Error> {
        let related_files = serde_json::from_str(&row.related_files).map_err(|source| {
            LibraryError::Corrupt {
                column: "roms.related_files",
                source,
            }
        })?;

        Ok(Self {
            md5: row.md5,
            title: row.title,
            file_name: row.file_name,
            system_identifier: row.system_identifier,
            related_files,
            file_size: row.file_size,
            description: row.description,
            developer: row.developer,
            publisher: row.publisher,
            genres: row.genres,
            rating: row.rating,
            play_count: row.play_count,
            time_spent_in_game: row.time_spent_in_game,
            last_played: row.last_played,
            is_favorite: row.is_favorite,
            remote_record_id: row.remote_record_id,
            last_synced_at: row.last_synced_at,
            is_downloaded: row.is_downloaded,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

// =============================================================================
// Save state
// =============================================================================

/// Emulator save state belonging to a ROM
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct SaveState {
    /// UUID string
    pub id: String,
    /// Owning game
    pub game_md5: String,
    pub system_identifier: String,
    /// File name inside `Save States/<system>/`
    pub file_name: String,
    pub file_size: Option<i64>,
    pub is_auto_save: bool,
    pub created_at: i64,
    pub modified_at: i64,
    pub last_modified_device: Option<String>,
    /// Screenshot stored next to the state
    pub image_file_name: Option<String>,
    pub remote_record_id: Option<String>,
    pub last_synced_at: Option<i64>,
    pub is_downloaded: bool,
}

impl SaveState {
    pub fn new(
        game_md5: &str,
        system_identifier: impl Into<String>,
        file_name: impl Into<String>,
    ) -> Self {
        let now = now_millis();
        Self {
            id: Uuid::new_v4().to_string(),
            game_md5: normalize_md5(game_md5),
            system_identifier: system_identifier.into(),
            file_name: file_name.into(),
            file_size: None,
            is_auto_save: false,
            created_at: now,
            modified_at: now,
            last_modified_device: None,
            image_file_name: None,
            remote_record_id: None,
            last_synced_at: None,
            is_downloaded: false,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if Uuid::parse_str(&self.id).is_err() {
            return Err(format!("Save state id {} is not a UUID", self.id));
        }
        if self.game_md5.is_empty() {
            return Err("Save state must reference a game".to_string());
        }
        if self.file_name.trim().is_empty() {
            return Err("Save state file name cannot be empty".to_string());
        }
        Ok(())
    }
}

// =============================================================================
// BIOS
// =============================================================================

/// System BIOS image, keyed by the MD5 the emulator expects
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Bios {
    pub md5: String,
    /// File name inside `BIOS/`
    pub expected_filename: String,
    pub expected_size: Option<i64>,
    pub system_identifier: String,
    pub description_text: Option<String>,
    /// Optional BIOS images are not required to boot the system
    pub optional: bool,
    pub remote_record_id: Option<String>,
    pub last_synced_at: Option<i64>,
    pub is_downloaded: bool,
}

impl Bios {
    pub fn new(
        md5: &str,
        expected_filename: impl Into<String>,
        system_identifier: impl Into<String>,
    ) -> Self {
        Self {
            md5: normalize_md5(md5),
            expected_filename: expected_filename.into(),
            expected_size: None,
            system_identifier: system_identifier.into(),
            description_text: None,
            optional: false,
            remote_record_id: None,
            last_synced_at: None,
            is_downloaded: false,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.md5.is_empty() {
            return Err("BIOS hash cannot be empty".to_string());
        }
        if self.expected_filename.trim().is_empty() {
            return Err("BIOS file name cannot be empty".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rom_key_is_uppercased() {
        let rom = Rom::new(" 0f1e2d3c4b5a69788796a5b4c3d2e1f0 ", "Metroid", "metroid.nes", "nes");
        assert_eq!(rom.md5, "0F1E2D3C4B5A69788796A5B4C3D2E1F0");
        assert!(rom.validate().is_ok());
    }

    #[test]
    fn test_rom_validation() {
        let mut rom = Rom::new("ABC", "Metroid", "", "nes");
        assert!(rom.validate().is_err());

        rom.file_name = "metroid.nes".into();
        rom.play_count = -1;
        assert!(rom.validate().is_err());
    }

    #[test]
    fn test_all_file_names_lists_primary_first() {
        let mut rom = Rom::new("ABC", "Disc", "game.cue", "psx");
        rom.related_files = vec!["game (Track 1).bin".into(), "game (Track 2).bin".into()];
        assert_eq!(
            rom.all_file_names(),
            vec!["game.cue", "game (Track 1).bin", "game (Track 2).bin"]
        );
    }

    #[test]
    fn test_save_state_requires_uuid() {
        let mut state = SaveState::new("abc", "gba", "slot1.svs");
        assert!(state.validate().is_ok());
        assert_eq!(state.game_md5, "ABC");

        state.id = "not-a-uuid".into();
        assert!(state.validate().is_err());
    }

    #[test]
    fn test_bios_validation() {
        let bios = Bios::new("924e392ed05558ffdb115408c263dccf", "scph1001.bin", "psx");
        assert!(bios.validate().is_ok());
        assert!(!bios.optional);
    }
}
