//! Deterministic remote record identifiers.
//!
//! New records are named `<prefix><stable key>`. Older clients used the bare
//! key (an MD5 for ROM/BIOS records, a UUID for save states). Parsing goes
//! through [`resolve_stable_key`], which tries each [`IdScheme`] in order;
//! dropping legacy support means removing one entry from `SCHEMES`.

use core_runtime::events::EntityKind;

const ROM_PREFIX: &str = "rom_";
const SAVE_STATE_PREFIX: &str = "savestate_";
const BIOS_PREFIX: &str = "bios_";
const FILE_PREFIX: &str = "file_";

pub fn rom_record_id(md5: &str) -> String {
    format!("{ROM_PREFIX}{}", md5.trim().to_ascii_uppercase())
}

pub fn save_state_record_id(id: &str) -> String {
    format!("{SAVE_STATE_PREFIX}{id}")
}

pub fn bios_record_id(md5: &str) -> String {
    format!("{BIOS_PREFIX}{}", md5.trim().to_ascii_uppercase())
}

/// `file_<directory>_<relative path>`; not reversible, file records carry
/// their location in fields.
pub fn file_record_id(directory: &str, relative_path: &str) -> String {
    format!("{FILE_PREFIX}{directory}_{relative_path}")
}

pub fn record_id_for(kind: EntityKind, key: &str) -> String {
    match kind {
        EntityKind::Rom => rom_record_id(key),
        EntityKind::SaveState => save_state_record_id(key),
        EntityKind::Bios => bios_record_id(key),
        EntityKind::File => key.to_string(),
    }
}

/// How a record id was parsed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdScheme {
    /// `rom_<MD5>`, `savestate_<uuid>`, `bios_<MD5>`
    Prefixed,
    /// Bare key written by older clients
    LegacyBare,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedKey {
    pub key: String,
    pub scheme: IdScheme,
}

const SCHEMES: [IdScheme; 2] = [IdScheme::Prefixed, IdScheme::LegacyBare];

/// Extract the local stable key (MD5 or save-state id) from a record id.
///
/// Returns `None` for file records and ids that match no scheme.
pub fn resolve_stable_key(kind: EntityKind, record_id: &str) -> Option<ResolvedKey> {
    SCHEMES.iter().find_map(|&scheme| {
        parse(kind, record_id, scheme).map(|key| ResolvedKey { key, scheme })
    })
}

fn parse(kind: EntityKind, record_id: &str, scheme: IdScheme) -> Option<String> {
    match (kind, scheme) {
        (EntityKind::Rom, IdScheme::Prefixed) => record_id
            .strip_prefix(ROM_PREFIX)
            .filter(|md5| is_md5(md5))
            .map(str::to_ascii_uppercase),
        (EntityKind::Bios, IdScheme::Prefixed) => record_id
            .strip_prefix(BIOS_PREFIX)
            .filter(|md5| is_md5(md5))
            .map(str::to_ascii_uppercase),
        (EntityKind::SaveState, IdScheme::Prefixed) => record_id
            .strip_prefix(SAVE_STATE_PREFIX)
            .filter(|id| uuid::Uuid::parse_str(id).is_ok())
            .map(str::to_string),
        (EntityKind::Rom | EntityKind::Bios, IdScheme::LegacyBare) => {
            is_md5(record_id).then(|| record_id.to_ascii_uppercase())
        }
        (EntityKind::SaveState, IdScheme::LegacyBare) => uuid::Uuid::parse_str(record_id)
            .ok()
            .map(|_| record_id.to_string()),
        (EntityKind::File, _) => None,
    }
}

fn is_md5(candidate: &str) -> bool {
    candidate.len() == 32 && candidate.chars().all(|c| c.is_ascii_hexdigit())
}
