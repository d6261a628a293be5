//! Remote record schema: type tags and field names shared with other devices.

use bridge_traits::RemoteRecord;
use core_runtime::events::EntityKind;

pub mod record_type {
    pub const ROM: &str = "ROM";
    pub const SAVE_STATE: &str = "SaveState";
    pub const BIOS: &str = "BIOS";
    pub const FILE: &str = "File";
    /// Pre-prefix ROM records written by older clients
    pub const LEGACY_GAME: &str = "Game";
}

/// Binary payload asset key, common to every record type
pub const FILE_DATA: &str = "fileData";
/// Soft-delete tombstone flag, common to every record type
pub const IS_DELETED: &str = "isDeleted";
pub const LAST_MODIFIED_DEVICE: &str = "lastModifiedDevice";

/// Generic fields older clients wrote on every record
pub mod common {
    pub const DIRECTORY: &str = "directory";
    pub const FILENAME: &str = "filename";
    pub const SYSTEM: &str = "system";
    pub const MD5: &str = "md5";
    pub const LAST_MODIFIED: &str = "lastModified";
    pub const FILE_SIZE: &str = "fileSize";
}

pub mod rom {
    pub const MD5: &str = "md5";
    pub const TITLE: &str = "title";
    pub const SYSTEM_IDENTIFIER: &str = "systemIdentifier";
    pub const FILE_SIZE: &str = "fileSize";
    pub const ORIGINAL_FILENAME: &str = "originalFilename";
    pub const DESCRIPTION: &str = "gameDescription";
    pub const DEVELOPER: &str = "developer";
    pub const PUBLISHER: &str = "publisher";
    pub const GENRES: &str = "genres";
    pub const RATING: &str = "rating";
    pub const PLAY_COUNT: &str = "playCount";
    pub const TIME_SPENT: &str = "timeSpentInGame";
    pub const LAST_PLAYED: &str = "lastPlayed";
    pub const IS_FAVORITE: &str = "isFavorite";
    pub const IMPORT_DATE: &str = "importDate";
    pub const IS_ARCHIVE: &str = "isArchive";
    pub const RELATED_FILENAMES: &str = "relatedFilenames";

    /// Everything except the payload
    pub const METADATA_KEYS: &[&str] = &[
        MD5,
        TITLE,
        SYSTEM_IDENTIFIER,
        FILE_SIZE,
        ORIGINAL_FILENAME,
        DESCRIPTION,
        DEVELOPER,
        PUBLISHER,
        GENRES,
        RATING,
        PLAY_COUNT,
        TIME_SPENT,
        LAST_PLAYED,
        IS_FAVORITE,
        IMPORT_DATE,
        IS_ARCHIVE,
        RELATED_FILENAMES,
        super::IS_DELETED,
        super::LAST_MODIFIED_DEVICE,
        super::common::FILENAME,
        super::common::SYSTEM,
    ];
}

pub mod save_state {
    pub const GAME_ID: &str = "gameID";
    pub const SYSTEM_IDENTIFIER: &str = "systemIdentifier";
    pub const FILENAME: &str = "filename";
    pub const CREATION_DATE: &str = "creationDate";
    pub const FILE_SIZE: &str = "fileSize";
    pub const IS_AUTO_SAVE: &str = "isAutoSave";
    pub const IMAGE_ASSET: &str = "imageAsset";
    pub const IMAGE_FILENAME: &str = "imageFilename";

    pub const METADATA_KEYS: &[&str] = &[
        GAME_ID,
        SYSTEM_IDENTIFIER,
        FILENAME,
        CREATION_DATE,
        FILE_SIZE,
        IS_AUTO_SAVE,
        IMAGE_FILENAME,
        super::IS_DELETED,
        super::LAST_MODIFIED_DEVICE,
    ];
}

pub mod bios {
    pub const EXPECTED_FILENAME: &str = "expectedFilename";
    pub const MD5: &str = "md5";
    pub const EXPECTED_SIZE: &str = "expectedSize";
    pub const SYSTEM_IDENTIFIER: &str = "systemIdentifier";
    pub const DESCRIPTION_TEXT: &str = "descriptionText";
    pub const OPTIONAL: &str = "optional";

    pub const METADATA_KEYS: &[&str] = &[
        EXPECTED_FILENAME,
        MD5,
        EXPECTED_SIZE,
        SYSTEM_IDENTIFIER,
        DESCRIPTION_TEXT,
        OPTIONAL,
        super::IS_DELETED,
    ];
}

pub mod file {
    pub const DIRECTORY: &str = "directory";
    pub const FILENAME: &str = "filename";
    pub const RELATIVE_PATH: &str = "relativePath";
    pub const FILE_SIZE: &str = "fileSize";
    pub const LAST_MODIFIED: &str = "lastModified";

    pub const METADATA_KEYS: &[&str] = &[
        DIRECTORY,
        FILENAME,
        RELATIVE_PATH,
        FILE_SIZE,
        LAST_MODIFIED,
        super::IS_DELETED,
    ];
}

/// Whether the record carries the soft-delete tombstone.
pub fn is_tombstoned(record: &RemoteRecord) -> bool {
    record.get_bool(IS_DELETED).unwrap_or(false)
}

/// Field projection for metadata-only queries.
pub fn metadata_keys(keys: &[&str]) -> Vec<String> {
    keys.iter().map(|key| key.to_string()).collect()
}

/// Local entity kind for a record.
///
/// Falls back to the `directory` field for untyped or foreign records.
pub fn classify_record(record: &RemoteRecord, non_database_directories: &[String]) -> Option<EntityKind> {
    match record.record_type.as_str() {
        record_type::ROM | record_type::LEGACY_GAME => Some(EntityKind::Rom),
        record_type::SAVE_STATE => Some(EntityKind::SaveState),
        record_type::BIOS => Some(EntityKind::Bios),
        record_type::FILE => Some(EntityKind::File),
        _ => classify_directory(record.get_str(common::DIRECTORY)?, non_database_directories),
    }
}

fn classify_directory(directory: &str, non_database_directories: &[String]) -> Option<EntityKind> {
    let top = directory.split('/').next().unwrap_or(directory);
    match top {
        "ROMs" | "roms" => Some(EntityKind::Rom),
        "Save States" => Some(EntityKind::SaveState),
        "BIOS" => Some(EntityKind::Bios),
        other if non_database_directories.iter().any(|dir| dir == other) => Some(EntityKind::File),
        _ => None,
    }
}

/// Record type tag for a local entity kind.
pub fn record_type_for(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Rom => record_type::ROM,
        EntityKind::SaveState => record_type::SAVE_STATE,
        EntityKind::Bios => record_type::BIOS,
        EntityKind::File => record_type::FILE,
    }
}
