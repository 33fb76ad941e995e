//! Refresh decision engine: which files must be cleared and which must be
//! (re)indexed for a requested refresh mode.
//!
//! A pure function of the requested mode, the stored file records and the
//! current source set; nothing here touches the filesystem or the store.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use crate::storage::StoredFileRecord;
use crate::storage::fragment::Fingerprint;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefreshMode {
    /// Nothing is selected.
    #[default]
    None,
    /// Files whose fingerprint changed or that are new, plus cleanup of files
    /// that vanished from disk.
    UpdatedFiles,
    /// Superset of updated: also retries files whose last run recorded a
    /// fatal error or partial completion, even with an unchanged fingerprint.
    UpdatedAndIncompleteFiles,
    /// Everything: the whole current source set is indexed and the whole
    /// previously persisted set is cleared, purging stale files left over
    /// from an earlier configuration.
    AllFiles,
}

/// The computed work set for one refresh request. Consumed once by the
/// orchestrating run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefreshInfo {
    pub mode: RefreshMode,
    pub files_to_index: BTreeSet<PathBuf>,
    pub files_to_clear: BTreeSet<PathBuf>,
}

impl RefreshInfo {
    /// True when the run would do no work at all.
    pub fn is_noop(&self) -> bool {
        self.files_to_index.is_empty() && self.files_to_clear.is_empty()
    }
}

/// Compute the refresh work set.
///
/// `stored` is what the persisted store knows; `current` maps every file the
/// source groups select right now to its on-disk fingerprint.
pub fn compute_refresh_info(
    mode: RefreshMode,
    stored: &[StoredFileRecord],
    current: &BTreeMap<PathBuf, Fingerprint>,
) -> RefreshInfo {
    match mode {
        RefreshMode::None => RefreshInfo {
            mode,
            ..RefreshInfo::default()
        },
        RefreshMode::AllFiles => RefreshInfo {
            mode,
            files_to_index: current.keys().cloned().collect(),
            files_to_clear: stored.iter().map(|r| r.path.clone()).collect(),
        },
        RefreshMode::UpdatedFiles => updated_files_info(mode, stored, current),
        RefreshMode::UpdatedAndIncompleteFiles => {
            let mut info = updated_files_info(mode, stored, current);
            for record in stored {
                if record.complete {
                    continue;
                }
                // Retry files whose last run ended in a fatal error or
                // partial completion, if they still exist on disk.
                if current.contains_key(&record.path)
                    && info.files_to_index.insert(record.path.clone())
                {
                    info.files_to_clear.insert(record.path.clone());
                }
            }
            info
        }
    }
}

fn updated_files_info(
    mode: RefreshMode,
    stored: &[StoredFileRecord],
    current: &BTreeMap<PathBuf, Fingerprint>,
) -> RefreshInfo {
    let stored_by_path: BTreeMap<&PathBuf, &StoredFileRecord> =
        stored.iter().map(|r| (&r.path, r)).collect();

    let mut files_to_index = BTreeSet::new();
    for (path, fingerprint) in current {
        let changed = match stored_by_path.get(path) {
            None => true, // new file
            Some(record) => fingerprint.differs_from(&record.fingerprint),
        };
        if changed {
            files_to_index.insert(path.clone());
        }
    }

    // Clear what gets re-indexed, plus previously persisted files that no
    // longer exist on disk.
    let mut files_to_clear = files_to_index.clone();
    for record in stored {
        if !current.contains_key(&record.path) {
            files_to_clear.insert(record.path.clone());
        }
    }

    RefreshInfo {
        mode,
        files_to_index,
        files_to_clear,
    }
}
