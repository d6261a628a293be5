//! # Sync Progress
//!
//! Per-category counters for a sync pass, published through a
//! `tokio::sync::watch` channel so UI layers always see the latest snapshot.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::watch;

/// Progress bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProgressCategory {
    Roms,
    SaveStates,
    Bios,
    BatteryStates,
    Screenshots,
    Skins,
}

impl ProgressCategory {
    /// Bucket for a non-database directory, if it is one of the known ones
    pub fn for_directory(directory: &str) -> Option<Self> {
        match directory {
            "Battery States" => Some(Self::BatteryStates),
            "Screenshots" => Some(Self::Screenshots),
            "DeltaSkins" | "Skins" => Some(Self::Skins),
            _ => None,
        }
    }
}

impl fmt::Display for ProgressCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Roms => "ROMs",
            Self::SaveStates => "Save States",
            Self::Bios => "BIOS",
            Self::BatteryStates => "Battery States",
            Self::Screenshots => "Screenshots",
            Self::Skins => "Skins",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryProgress {
    pub total: usize,
    pub completed: usize,
}

impl CategoryProgress {
    fn advance(&mut self, by: usize) {
        self.completed = self.completed.saturating_add(by);
        // A late-discovered item may complete before its total is known
        self.total = self.total.max(self.completed);
    }
}

/// Snapshot of a sync pass
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncProgress {
    pub roms: CategoryProgress,
    pub save_states: CategoryProgress,
    pub bios: CategoryProgress,
    pub battery_states: CategoryProgress,
    pub screenshots: CategoryProgress,
    pub skins: CategoryProgress,
    pub is_complete: bool,
}

impl SyncProgress {
    pub fn category(&self, category: ProgressCategory) -> &CategoryProgress {
        match category {
            ProgressCategory::Roms => &self.roms,
            ProgressCategory::SaveStates => &self.save_states,
            ProgressCategory::Bios => &self.bios,
            ProgressCategory::BatteryStates => &self.battery_states,
            ProgressCategory::Screenshots => &self.screenshots,
            ProgressCategory::Skins => &self.skins,
        }
    }

    fn category_mut(&mut self, category: ProgressCategory) -> &mut CategoryProgress {
        match category {
            ProgressCategory::Roms => &mut self.roms,
            ProgressCategory::SaveStates => &mut self.save_states,
            ProgressCategory::Bios => &mut self.bios,
            ProgressCategory::BatteryStates => &mut self.battery_states,
            ProgressCategory::Screenshots => &mut self.screenshots,
            ProgressCategory::Skins => &mut self.skins,
        }
    }

    fn all(&self) -> [&CategoryProgress; 6] {
        [
            &self.roms,
            &self.save_states,
            &self.bios,
            &self.battery_states,
            &self.screenshots,
            &self.skins,
        ]
    }

    pub fn total(&self) -> usize {
        self.all().iter().map(|c| c.total).sum()
    }

    pub fn completed(&self) -> usize {
        self.all().iter().map(|c| c.completed).sum()
    }

    /// Fraction in `0.0..=1.0`; `0.0` while nothing has been counted
    pub fn overall_progress(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        (self.completed() as f64 / total as f64).min(1.0)
    }
}

/// Single writer for [`SyncProgress`]; readers subscribe.
#[derive(Debug)]
pub struct ProgressTracker {
    tx: watch::Sender<SyncProgress>,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressTracker {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(SyncProgress::default());
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncProgress> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> SyncProgress {
        self.tx.borrow().clone()
    }

    pub fn reset(&self) {
        self.tx.send_replace(SyncProgress::default());
    }

    pub fn add_total(&self, category: ProgressCategory, count: usize) {
        if count == 0 {
            return;
        }
        self.tx
            .send_modify(|progress| progress.category_mut(category).total += count);
    }

    pub fn advance(&self, category: ProgressCategory, count: usize) {
        if count == 0 {
            return;
        }
        self.tx
            .send_modify(|progress| progress.category_mut(category).advance(count));
    }

    /// Mark a category done; used when it ends early
    pub fn finish_category(&self, category: ProgressCategory) {
        self.tx.send_modify(|progress| {
            let entry = progress.category_mut(category);
            entry.completed = entry.total;
        });
    }

    pub fn mark_complete(&self) {
        self.tx.send_modify(|progress| progress.is_complete = true);
    }
}
