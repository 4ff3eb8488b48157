//! Diffing of consecutive directory states.
//!
//! A path found only in the current state is `Created`, a path found only
//! in the previous state is `Deleted`, and a path found in both with a
//! different length, write time or attribute set is `Changed`.
//!
//! A deleted file and a created file with identical length and write time
//! are merged into one `Renamed` record. This is a heuristic: two unrelated
//! files sharing both values will be paired, and a file that was renamed
//! and modified in the same interval surfaces as a deletion plus a
//! creation. Candidates pair in enumeration order and each side pairs at
//! most once. Directories never pair.
//!
//! Output order: created and changed records by ascending key, then
//! deleted and renamed records by ascending key.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};

use crate::event::{ChangeKind, ChangeRecord};
use crate::snapshot::DirectoryState;

type RenameKey = (u64, DateTime<Utc>);

/// Compute the ordered change list from `previous` to `current`.
pub fn detect_changes(
    previous: &DirectoryState,
    current: &DirectoryState,
    observed_at: DateTime<Utc>,
) -> Vec<ChangeRecord> {
    let mut upserts: Vec<(&str, Option<ChangeRecord>)> = Vec::new();
    let mut rename_candidates: HashMap<RenameKey, VecDeque<usize>> = HashMap::new();

    for (key, entry) in current.iter() {
        match previous.get_key(key) {
            None => {
                if !entry.is_directory {
                    rename_candidates
                        .entry((entry.length, entry.last_write_time))
                        .or_default()
                        .push_back(upserts.len());
                }
                let record = ChangeRecord::new(ChangeKind::Created, entry.clone(), observed_at);
                upserts.push((key, Some(record)));
            }
            Some(old) if old.metadata_differs(entry) => {
                let record = ChangeRecord::new(ChangeKind::Changed, entry.clone(), observed_at);
                upserts.push((key, Some(record)));
            }
            Some(_) => {}
        }
    }

    let mut removals: Vec<(&str, ChangeRecord)> = Vec::new();
    for (key, old) in previous.iter() {
        if current.get_key(key).is_some() {
            continue;
        }

        let paired = if old.is_directory {
            None
        } else {
            rename_candidates
                .get_mut(&(old.length, old.last_write_time))
                .and_then(VecDeque::pop_front)
        };

        match paired.and_then(|idx| {
            let (new_key, slot) = &mut upserts[idx];
            slot.take().map(|created| (*new_key, created))
        }) {
            Some((new_key, created)) => {
                let record = ChangeRecord::renamed(old.path.clone(), created.snapshot, observed_at);
                removals.push((new_key, record));
            }
            None => {
                let record = ChangeRecord::new(ChangeKind::Deleted, old.clone(), observed_at);
                removals.push((key, record));
            }
        }
    }

    let mut upserts: Vec<(&str, ChangeRecord)> = upserts
        .into_iter()
        .filter_map(|(key, record)| record.map(|record| (key, record)))
        .collect();
    upserts.sort_by_key(|(key, _)| *key);
    removals.sort_by_key(|(key, _)| *key);

    upserts
        .into_iter()
        .chain(removals)
        .map(|(_, record)| record)
        .collect()
}
