//! Engine tunables.

use core_runtime::config::PlatformProfile;
use std::time::Duration;

const MIB: u64 = 1024 * 1024;

/// Directories synced as opaque files, relative to the documents directory.
pub const DEFAULT_NON_DATABASE_DIRECTORIES: [&str; 3] = ["Battery States", "Screenshots", "DeltaSkins"];

/// Configuration for the sync engine
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Records requested per remote query page
    pub page_size: usize,

    /// Lower bound of the adaptive batch size
    pub min_batch_size: usize,

    /// Upper bound of the adaptive batch size
    pub max_batch_size: usize,

    /// Pause between consecutive batches
    pub batch_pause: Duration,

    pub rom_timeout: Duration,
    pub save_state_timeout: Duration,
    pub bios_timeout: Duration,
    pub non_database_timeout: Duration,

    /// Per-type budget for the "is a sync needed" lookup
    pub presence_check_timeout: Duration,

    pub max_concurrent_uploads: usize,
    pub max_concurrent_downloads: usize,

    /// Free space kept untouched by the download queue
    pub safety_buffer_bytes: u64,

    /// Payloads above this size are never fetched automatically when
    /// `block_large_automatic_downloads` is set
    pub large_file_threshold_bytes: u64,
    pub block_large_automatic_downloads: bool,

    /// Attempts per remote call before a transient error is surfaced
    pub transient_retry_attempts: u32,
    pub transient_retry_base_delay: Duration,

    pub non_database_directories: Vec<String>,

    /// Written to `lastModifiedDevice` on uploaded records
    pub device_name: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_size: 100,
            min_batch_size: 5,
            max_batch_size: 20,
            batch_pause: Duration::from_millis(100),
            rom_timeout: Duration::from_secs(300),
            save_state_timeout: Duration::from_secs(300),
            bios_timeout: Duration::from_secs(180),
            non_database_timeout: Duration::from_secs(300),
            presence_check_timeout: Duration::from_secs(10),
            max_concurrent_uploads: 2,
            max_concurrent_downloads: 2,
            safety_buffer_bytes: 100 * MIB,
            large_file_threshold_bytes: 50 * MIB,
            block_large_automatic_downloads: false,
            transient_retry_attempts: 3,
            transient_retry_base_delay: Duration::from_secs(1),
            non_database_directories: DEFAULT_NON_DATABASE_DIRECTORIES
                .iter()
                .map(|dir| dir.to_string())
                .collect(),
            device_name: "desktop".to_string(),
        }
    }
}

impl SyncConfig {
    /// Defaults adjusted for the device class.
    pub fn for_platform(platform: PlatformProfile) -> Self {
        let mut config = Self::default();
        if platform.is_constrained() {
            config.safety_buffer_bytes = 500 * MIB;
            config.block_large_automatic_downloads = true;
            config.device_name = "constrained".to_string();
        }
        config
    }

    /// `clamp(total / 10, min, max)`
    pub fn adaptive_batch_size(&self, total: usize) -> usize {
        (total / 10).clamp(self.min_batch_size, self.max_batch_size)
    }
}
