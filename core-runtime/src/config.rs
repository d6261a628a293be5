//! # Core Configuration Module
//!
//! `CoreConfig` holds the host capabilities and paths the sync engine needs.
//! It is assembled through [`CoreConfigBuilder`], which validates eagerly so
//! a misconfigured host fails at startup instead of mid-sync.
//!
//! ## Required Dependencies
//!
//! - `RemoteRecordStore` - the cloud record database adapter
//! - documents directory - root of the local library
//!
//! ## Optional Dependencies (with platform defaults)
//!
//! - `FileSystemAccess` - desktop default: `TokioFileSystem` (`desktop-shims`)
//! - `Clock` - default: `SystemClock`
//!
//! ## Usage
//!
//! ```ignore
//! use core_runtime::config::{CoreConfig, PlatformProfile};
//! use std::sync::Arc;
//!
//! let config = CoreConfig::builder()
//!     .documents_dir("/Users/me/Library/RomSync")
//!     .remote_store(Arc::new(MyCloudAdapter::new()))
//!     .platform(PlatformProfile::Desktop)
//!     .build()?;
//! ```

use crate::error::{Error, Result};
use bridge_traits::{
    remote::RemoteRecordStore,
    storage::FileSystemAccess,
    time::{Clock, SystemClock},
};
use std::path::PathBuf;
use std::sync::Arc;

const DEFAULT_DATABASE_FILE: &str = "library.db";

/// Device class, drives download policy and free-space buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlatformProfile {
    /// Desktop or phone with ample storage
    #[default]
    Desktop,
    /// Storage-constrained device (e.g. set-top box); large payloads are
    /// only fetched on explicit request
    Constrained,
}

impl PlatformProfile {
    pub fn is_constrained(self) -> bool {
        matches!(self, PlatformProfile::Constrained)
    }
}

/// Feature flags control optional functionality.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureFlags {
    /// Route remote change notifications into the syncers
    pub enable_subscriptions: bool,

    /// Let the download queue fetch payloads without an explicit request
    pub enable_background_downloads: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            enable_subscriptions: true,
            enable_background_downloads: true,
        }
    }
}

/// Main configuration structure for the sync core.
#[derive(Clone)]
pub struct CoreConfig {
    /// Root of the local library (`ROMs/`, `Save States/`, `BIOS/`, ...)
    pub documents_dir: PathBuf,

    /// SQLite database file for the local store
    pub database_path: PathBuf,

    /// Scratch space for staging archives
    pub temp_dir: PathBuf,

    pub platform: PlatformProfile,

    pub file_system: Arc<dyn FileSystemAccess>,

    pub remote_store: Arc<dyn RemoteRecordStore>,

    pub clock: Arc<dyn Clock>,

    pub features: FeatureFlags,
}

impl std::fmt::Debug for CoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreConfig")
            .field("documents_dir", &self.documents_dir)
            .field("database_path", &self.database_path)
            .field("temp_dir", &self.temp_dir)
            .field("platform", &self.platform)
            .field("file_system", &"FileSystemAccess { ... }")
            .field("remote_store", &"RemoteRecordStore { ... }")
            .field("features", &self.features)
            .finish()
    }
}

impl CoreConfig {
    pub fn builder() -> CoreConfigBuilder {
        CoreConfigBuilder::default()
    }

    /// Checks path sanity.
    pub fn validate(&self) -> Result<()> {
        if self.documents_dir.as_os_str().is_empty() {
            return Err(Error::Config("Documents directory cannot be empty".to_string()));
        }

        if self.database_path.as_os_str().is_empty() {
            return Err(Error::Config("Database path cannot be empty".to_string()));
        }

        if self.temp_dir.as_os_str().is_empty() {
            return Err(Error::Config("Temp directory cannot be empty".to_string()));
        }

        if self.temp_dir == self.documents_dir {
            return Err(Error::Config(
                "Temp directory must differ from the documents directory; \
                 staged archives are deleted after each upload"
                    .to_string(),
            ));
        }

        Ok(())
    }

    /// Creates the documents and temp directories if missing.
    pub async fn prepare_directories(&self) -> Result<()> {
        self.file_system.create_dir_all(&self.documents_dir).await?;
        self.file_system.create_dir_all(&self.temp_dir).await?;
        Ok(())
    }
}

fn remote_store_missing_error() -> Error {
    Error::CapabilityMissing {
        capability: "RemoteRecordStore".to_string(),
        message: "A RemoteRecordStore adapter is required; the core never talks to a \
                 cloud API directly. Inject the host's record database adapter."
            .to_string(),
    }
}

#[cfg(feature = "desktop-shims")]
fn provide_default_file_system(
    documents_dir: &std::path::Path,
    temp_dir: &std::path::Path,
) -> Result<Arc<dyn FileSystemAccess>> {
    use bridge_desktop::TokioFileSystem;

    let fs: Arc<dyn FileSystemAccess> = Arc::new(TokioFileSystem::with_directories(
        documents_dir.to_path_buf(),
        temp_dir.to_path_buf(),
    ));
    Ok(fs)
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_file_system(
    _documents_dir: &std::path::Path,
    _temp_dir: &std::path::Path,
) -> Result<Arc<dyn FileSystemAccess>> {
    Err(Error::CapabilityMissing {
        capability: "FileSystemAccess".to_string(),
        message: "FileSystemAccess implementation is required. \
                 Desktop: enable the 'desktop-shims' feature to use TokioFileSystem. \
                 Apple platforms: inject the sandboxed container file system."
            .to_string(),
    })
}

/// Builder for [`CoreConfig`].
#[derive(Default)]
pub struct CoreConfigBuilder {
    documents_dir: Option<PathBuf>,
    database_path: Option<PathBuf>,
    temp_dir: Option<PathBuf>,
    platform: PlatformProfile,
    file_system: Option<Arc<dyn FileSystemAccess>>,
    remote_store: Option<Arc<dyn RemoteRecordStore>>,
    clock: Option<Arc<dyn Clock>>,
    features: FeatureFlags,
}

impl CoreConfigBuilder {
    /// Sets the library root (required).
    pub fn documents_dir<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.documents_dir = Some(path.into());
        self
    }

    /// Sets the database file. Default: `<documents_dir>/library.db`.
    pub fn database_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.database_path = Some(path.into());
        self
    }

    /// Sets the scratch directory. Default: `<system temp>/romsync`.
    pub fn temp_dir<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.temp_dir = Some(path.into());
        self
    }

    pub fn platform(mut self, platform: PlatformProfile) -> Self {
        self.platform = platform;
        self
    }

    pub fn file_system(mut self, fs: Arc<dyn FileSystemAccess>) -> Self {
        self.file_system = Some(fs);
        self
    }

    /// Sets the remote record store adapter (required).
    pub fn remote_store(mut self, store: Arc<dyn RemoteRecordStore>) -> Self {
        self.remote_store = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn enable_subscriptions(mut self, enabled: bool) -> Self {
        self.features.enable_subscriptions = enabled;
        self
    }

    pub fn enable_background_downloads(mut self, enabled: bool) -> Self {
        self.features.enable_background_downloads = enabled;
        self
    }

    pub fn features(mut self, features: FeatureFlags) -> Self {
        self.features = features;
        self
    }

    /// Builds and validates the configuration.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] when the documents directory is missing or a path is empty
    /// - [`Error::CapabilityMissing`] when no remote store (or, without
    ///   `desktop-shims`, no file system) was injected
    pub fn build(self) -> Result<CoreConfig> {
        let documents_dir = self.documents_dir.ok_or_else(|| {
            Error::Config(
                "Documents directory is required. Use .documents_dir() to set it.".to_string(),
            )
        })?;

        let remote_store = self.remote_store.ok_or_else(remote_store_missing_error)?;

        let database_path = self
            .database_path
            .unwrap_or_else(|| documents_dir.join(DEFAULT_DATABASE_FILE));

        let temp_dir = self
            .temp_dir
            .unwrap_or_else(|| std::env::temp_dir().join("romsync"));

        let file_system = match self.file_system {
            Some(fs) => fs,
            None => provide_default_file_system(&documents_dir, &temp_dir)?,
        };

        let config = CoreConfig {
            documents_dir,
            database_path,
            temp_dir,
            platform: self.platform,
            file_system,
            remote_store,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            features: self.features,
        };

        config.validate()?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bridge_traits::error::Result as BridgeResult;
    use bridge_traits::remote::{
        ChangeTypes, QueryCursor, QueryPage, RecordQuery, RemoteRecord, SubscriptionHandle,
    };
    use bridge_traits::storage::FileMetadata;
    use bytes::Bytes;
    use mockall::mock;
    use std::path::Path;

    mock! {
        Store {}

        #[async_trait]
        impl RemoteRecordStore for Store {
            async fn query(&self, query: &RecordQuery, limit: usize) -> BridgeResult<QueryPage>;
            async fn continue_query(&self, cursor: &QueryCursor, limit: usize) -> BridgeResult<QueryPage>;
            async fn fetch(&self, record_id: &str) -> BridgeResult<RemoteRecord>;
            async fn save(&self, record: RemoteRecord) -> BridgeResult<RemoteRecord>;
            async fn delete(&self, record_id: &str) -> BridgeResult<()>;
            async fn subscribe(&self, record_type: &str, changes: ChangeTypes) -> BridgeResult<SubscriptionHandle>;
        }
    }

    mock! {
        Fs {}

        #[async_trait]
        impl FileSystemAccess for Fs {
            async fn get_documents_directory(&self) -> BridgeResult<PathBuf>;
            async fn get_temp_directory(&self) -> BridgeResult<PathBuf>;
            async fn exists(&self, path: &Path) -> BridgeResult<bool>;
            async fn metadata(&self, path: &Path) -> BridgeResult<FileMetadata>;
            async fn create_dir_all(&self, path: &Path) -> BridgeResult<()>;
            async fn read_file(&self, path: &Path) -> BridgeResult<Bytes>;
            async fn write_file(&self, path: &Path, data: Bytes) -> BridgeResult<()>;
            async fn copy_file(&self, from: &Path, to: &Path) -> BridgeResult<()>;
            async fn move_file(&self, from: &Path, to: &Path) -> BridgeResult<()>;
            async fn delete_file(&self, path: &Path) -> BridgeResult<()>;
            async fn delete_dir_all(&self, path: &Path) -> BridgeResult<()>;
            async fn list_directory(&self, path: &Path) -> BridgeResult<Vec<PathBuf>>;
            async fn available_space(&self, path: &Path) -> BridgeResult<u64>;
            async fn create_archive(&self, files: &[PathBuf], destination: &Path) -> BridgeResult<()>;
            async fn extract_archive(&self, archive: &Path, destination: &Path) -> BridgeResult<Vec<PathBuf>>;
        }
    }

    fn builder() -> CoreConfigBuilder {
        CoreConfig::builder()
            .documents_dir("/library")
            .temp_dir("/tmp/romsync-test")
            .file_system(Arc::new(MockFs::new()))
            .remote_store(Arc::new(MockStore::new()))
    }

    #[test]
    fn test_build_with_defaults() {
        let config = builder().build().unwrap();

        assert_eq!(config.database_path, PathBuf::from("/library/library.db"));
        assert_eq!(config.platform, PlatformProfile::Desktop);
        assert!(config.features.enable_subscriptions);
        assert!(config.features.enable_background_downloads);
    }

    #[test]
    fn test_missing_documents_dir() {
        let result = CoreConfig::builder()
            .remote_store(Arc::new(MockStore::new()))
            .build();
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_missing_remote_store() {
        let result = CoreConfig::builder()
            .documents_dir("/library")
            .file_system(Arc::new(MockFs::new()))
            .build();

        match result {
            Err(Error::CapabilityMissing { capability, .. }) => {
                assert_eq!(capability, "RemoteRecordStore")
            }
            other => panic!("expected CapabilityMissing, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_database_path_rejected() {
        let result = builder().database_path("").build();
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_temp_dir_must_differ_from_documents() {
        let result = builder().temp_dir("/library").build();
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_constrained_profile_and_flags() {
        let config = builder()
            .platform(PlatformProfile::Constrained)
            .enable_background_downloads(false)
            .build()
            .unwrap();

        assert!(config.platform.is_constrained());
        assert!(!config.features.enable_background_downloads);
    }

    #[tokio::test]
    async fn test_prepare_directories_creates_both() {
        let mut fs = MockFs::new();
        fs.expect_create_dir_all()
            .withf(|p| p == Path::new("/library") || p == Path::new("/tmp/romsync-test"))
            .times(2)
            .returning(|_| Ok(()));

        let config = builder().file_system(Arc::new(fs)).build().unwrap();
        config.prepare_directories().await.unwrap();
    }
}
