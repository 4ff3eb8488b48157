//! Change records produced by diffing snapshots.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::snapshot::EntrySnapshot;

/// Kind of change between two snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// Path appeared.
    Created,

    /// Path disappeared.
    Deleted,

    /// Path exists in both snapshots with different metadata.
    Changed,

    /// A deleted file and a created file matched on length and write time.
    Renamed,
}

/// A single reported difference between consecutive snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// The kind of change.
    pub kind: ChangeKind,

    /// Affected path (the new path for renames).
    pub path: PathBuf,

    /// Previous path, set for renames only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_path: Option<PathBuf>,

    /// Entry metadata: the current entry, or the last seen one for deletions.
    pub snapshot: EntrySnapshot,

    /// When the cycle that produced this record started.
    pub observed_at: DateTime<Utc>,
}

impl ChangeRecord {
    /// Create a record for a kind other than rename.
    pub fn new(kind: ChangeKind, snapshot: EntrySnapshot, observed_at: DateTime<Utc>) -> Self {
        Self {
            kind,
            path: snapshot.path.clone(),
            old_path: None,
            snapshot,
            observed_at,
        }
    }

    /// Create a rename record.
    pub fn renamed(
        old_path: impl Into<PathBuf>,
        snapshot: EntrySnapshot,
        observed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            kind: ChangeKind::Renamed,
            path: snapshot.path.clone(),
            old_path: Some(old_path.into()),
            snapshot,
            observed_at,
        }
    }

    /// Previous path of a rename.
    pub fn old_path(&self) -> Option<&Path> {
        self.old_path.as_deref()
    }

    /// Check if this record is about a directory.
    pub fn is_directory(&self) -> bool {
        self.snapshot.is_directory
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::EntryAttributes;

    fn snapshot(path: &str) -> EntrySnapshot {
        EntrySnapshot {
            path: PathBuf::from(path),
            is_directory: false,
            length: 4,
            last_write_time: Utc::now(),
            attributes: EntryAttributes::empty(),
        }
    }

    #[test]
    fn test_record_creation() {
        let record = ChangeRecord::new(ChangeKind::Created, snapshot("/in/a.txt"), Utc::now());
        assert_eq!(record.kind, ChangeKind::Created);
        assert_eq!(record.path, Path::new("/in/a.txt"));
        assert_eq!(record.old_path(), None);
    }

    #[test]
    fn test_renamed_serializes_old_path() {
        let record = ChangeRecord::renamed("/in/a.txt", snapshot("/in/b.txt"), Utc::now());
        let json = serde_json::to_value(&record).unwrap();

        assert_eq!(json["kind"], "renamed");
        assert_eq!(json["old_path"], "/in/a.txt");
        assert_eq!(json["path"], "/in/b.txt");
    }
}
