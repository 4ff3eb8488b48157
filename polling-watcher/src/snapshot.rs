//! Point-in-time views of a directory tree.

use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use bitflags::bitflags;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::config::CaseSensitivity;

bitflags! {
    /// Attribute bits observed on an entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct EntryAttributes: u32 {
        /// Entry is not writable.
        const READ_ONLY = 1;
        /// Entry is hidden (dot-prefixed on Unix, hidden bit on Windows).
        const HIDDEN = 1 << 1;
        /// Entry is a directory.
        const DIRECTORY = 1 << 2;
        /// Entry is a symbolic link or other reparse point.
        const SYMLINK = 1 << 3;
    }
}

impl EntryAttributes {
    /// Derive attributes from file system metadata.
    pub fn from_metadata(path: &Path, metadata: &Metadata, is_symlink: bool) -> Self {
        let mut attributes = Self::empty();
        if metadata.is_dir() {
            attributes |= Self::DIRECTORY;
        }
        if metadata.permissions().readonly() {
            attributes |= Self::READ_ONLY;
        }
        if is_symlink {
            attributes |= Self::SYMLINK;
        }
        if is_hidden(path, metadata) {
            attributes |= Self::HIDDEN;
        }
        attributes
    }
}

#[cfg(windows)]
fn is_hidden(_path: &Path, metadata: &Metadata) -> bool {
    use std::os::windows::fs::MetadataExt;

    const FILE_ATTRIBUTE_HIDDEN: u32 = 0x2;
    metadata.file_attributes() & FILE_ATTRIBUTE_HIDDEN != 0
}

#[cfg(not(windows))]
fn is_hidden(path: &Path, _metadata: &Metadata) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with('.'))
}

/// Metadata observed for one entry at scan time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntrySnapshot {
    /// Absolute path of the entry.
    pub path: PathBuf,

    /// Whether the entry is a directory.
    pub is_directory: bool,

    /// Size in bytes.
    pub length: u64,

    /// Last modification time.
    pub last_write_time: DateTime<Utc>,

    /// Attribute bits.
    pub attributes: EntryAttributes,
}

impl EntrySnapshot {
    /// Build a snapshot from metadata read during a walk.
    pub fn from_metadata(path: impl Into<PathBuf>, metadata: &Metadata, is_symlink: bool) -> Self {
        let path = path.into();
        let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);

        Self {
            attributes: EntryAttributes::from_metadata(&path, metadata, is_symlink),
            is_directory: metadata.is_dir(),
            length: metadata.len(),
            last_write_time: DateTime::<Utc>::from(modified),
            path,
        }
    }

    /// Whether any compared field differs: length, write time or attributes.
    pub fn metadata_differs(&self, other: &Self) -> bool {
        self.length != other.length
            || self.last_write_time != other.last_write_time
            || self.attributes != other.attributes
    }
}

/// Normalize a path into a state key under the given case policy.
pub fn path_key(path: &Path, case: CaseSensitivity) -> String {
    let key = path.to_string_lossy();
    if case.folds() {
        key.to_lowercase()
    } else {
        key.into_owned()
    }
}

/// Immutable mapping from normalized path to entry metadata.
///
/// Iteration follows enumeration order.
#[derive(Debug, Clone)]
pub struct DirectoryState {
    generation: u64,
    case: CaseSensitivity,
    entries: IndexMap<String, EntrySnapshot>,
}

impl DirectoryState {
    /// The generation-zero state used before the first scan.
    pub fn empty(case: CaseSensitivity) -> Self {
        Self {
            generation: 0,
            case,
            entries: IndexMap::new(),
        }
    }

    /// Build a state from entries in enumeration order.
    ///
    /// When two entries fold to the same key the first one is kept.
    pub fn from_entries(
        generation: u64,
        case: CaseSensitivity,
        entries: impl IntoIterator<Item = EntrySnapshot>,
    ) -> Self {
        let mut map = IndexMap::new();
        for entry in entries {
            let key = path_key(&entry.path, case);
            if map.contains_key(&key) {
                trace!("Duplicate key after case folding: {key}");
                continue;
            }
            map.insert(key, entry);
        }

        Self {
            generation,
            case,
            entries: map,
        }
    }

    /// Generation number of this state.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Case policy used for keys.
    pub fn case_sensitivity(&self) -> CaseSensitivity {
        self.case
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the state has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up an entry by path.
    pub fn get(&self, path: &Path) -> Option<&EntrySnapshot> {
        self.entries.get(&path_key(path, self.case))
    }

    /// Look up an entry by normalized key.
    pub fn get_key(&self, key: &str) -> Option<&EntrySnapshot> {
        self.entries.get(key)
    }

    /// Whether the path is present.
    pub fn contains(&self, path: &Path) -> bool {
        self.get(path).is_some()
    }

    /// Keys and entries in enumeration order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &EntrySnapshot)> {
        self.entries.iter().map(|(key, entry)| (key.as_str(), entry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn entry(path: &str, length: u64) -> EntrySnapshot {
        EntrySnapshot {
            path: PathBuf::from(path),
            is_directory: false,
            length,
            last_write_time: DateTime::<Utc>::from(SystemTime::UNIX_EPOCH),
            attributes: EntryAttributes::empty(),
        }
    }

    #[test]
    fn test_empty_state_is_generation_zero() {
        let state = DirectoryState::empty(CaseSensitivity::Sensitive);
        assert_eq!(state.generation(), 0);
        assert!(state.is_empty());
    }

    #[test]
    fn test_insensitive_keys_fold_and_dedupe() {
        let state = DirectoryState::from_entries(
            3,
            CaseSensitivity::Insensitive,
            vec![entry("/in/Report.CSV", 1), entry("/in/report.csv", 2)],
        );

        assert_eq!(state.len(), 1);
        assert_eq!(state.get(Path::new("/IN/REPORT.csv")).map(|e| e.length), Some(1));
    }

    #[test]
    fn test_sensitive_keys_are_distinct() {
        let state = DirectoryState::from_entries(
            1,
            CaseSensitivity::Sensitive,
            vec![entry("/in/A.txt", 1), entry("/in/a.txt", 2)],
        );

        assert_eq!(state.len(), 2);
        assert!(!state.contains(Path::new("/in/A.TXT")));
    }

    #[test]
    fn test_iteration_keeps_enumeration_order() {
        let state = DirectoryState::from_entries(
            1,
            CaseSensitivity::Sensitive,
            vec![entry("/in/z", 1), entry("/in/a", 1), entry("/in/m", 1)],
        );
        let keys: Vec<&str> = state.iter().map(|(key, _)| key).collect();
        assert_eq!(keys, vec!["/in/z", "/in/a", "/in/m"]);
    }

    #[test]
    fn test_metadata_differs() {
        let a = entry("/in/a", 10);
        let mut b = a.clone();
        assert!(!a.metadata_differs(&b));

        b.attributes = EntryAttributes::READ_ONLY;
        assert!(a.metadata_differs(&b));
    }
}
