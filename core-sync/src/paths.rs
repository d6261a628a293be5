//! On-disk layout of the local library.

use std::path::{Component, Path, PathBuf};

use crate::error::{Result, SyncError};

const ROMS_DIR: &str = "ROMs";
const SAVE_STATES_DIR: &str = "Save States";
const BIOS_DIR: &str = "BIOS";
const ROM_UPLOAD_STAGING: &str = "rom-uploads";

/// Resolves entity payload locations under the documents directory.
#[derive(Debug, Clone)]
pub struct LibraryPaths {
    documents: PathBuf,
    temp: PathBuf,
}

impl LibraryPaths {
    pub fn new(documents: impl Into<PathBuf>, temp: impl Into<PathBuf>) -> Self {
        Self {
            documents: documents.into(),
            temp: temp.into(),
        }
    }

    pub fn documents(&self) -> &Path {
        &self.documents
    }

    pub fn temp(&self) -> &Path {
        &self.temp
    }

    /// `ROMs/<system>`
    pub fn roms_dir(&self, system: &str) -> PathBuf {
        self.documents.join(ROMS_DIR).join(system)
    }

    pub fn rom_file(&self, system: &str, file_name: &str) -> PathBuf {
        self.roms_dir(system).join(file_name)
    }

    /// `Save States/<system>`
    pub fn save_states_dir(&self, system: &str) -> PathBuf {
        self.documents.join(SAVE_STATES_DIR).join(system)
    }

    pub fn save_state_file(&self, system: &str, file_name: &str) -> PathBuf {
        self.save_states_dir(system).join(file_name)
    }

    pub fn bios_dir(&self) -> PathBuf {
        self.documents.join(BIOS_DIR)
    }

    pub fn bios_file(&self, file_name: &str) -> PathBuf {
        self.bios_dir().join(file_name)
    }

    /// Top-level directory synced as plain files
    pub fn non_database_dir(&self, directory: &str) -> PathBuf {
        self.documents.join(directory)
    }

    /// Staging archive for a ROM with companion files
    pub fn rom_upload_archive(&self, md5: &str) -> PathBuf {
        self.temp
            .join(ROM_UPLOAD_STAGING)
            .join(format!("{}.zip", md5.to_ascii_uppercase()))
    }

    /// `relative` with `/` separators, or `None` when `path` is outside `base`
    pub fn relative_to(base: &Path, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(base).ok()?;
        let parts: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        (!parts.is_empty()).then(|| parts.join("/"))
    }
}

/// `value` as a single file or directory name that stays inside its parent.
///
/// Names come from remote records, so separators, `..` and absolute paths
/// are rejected.
pub fn checked_name<'a>(record_id: &str, field: &str, value: &'a str) -> Result<&'a str> {
    let mut components = Path::new(value).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(part)), None) if part.to_str() == Some(value) => Ok(value),
        _ => Err(unsafe_path(record_id, field, value)),
    }
}

/// `/`-separated path made only of plain names
pub fn checked_relative_path<'a>(record_id: &str, field: &str, value: &'a str) -> Result<&'a str> {
    if value
        .split('/')
        .all(|part| checked_name(record_id, field, part).is_ok())
    {
        Ok(value)
    } else {
        Err(unsafe_path(record_id, field, value))
    }
}

fn unsafe_path(record_id: &str, field: &str, value: &str) -> SyncError {
    SyncError::InvalidData(format!(
        "Record {record_id} has unsafe {field} {value:?}"
    ))
}
