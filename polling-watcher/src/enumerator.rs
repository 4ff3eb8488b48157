//! Snapshot enumeration over a directory tree.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use walkdir::{DirEntry, WalkDir};

use crate::config::{CaseSensitivity, WatcherConfig};
use crate::error::{Result, WatcherError};
use crate::filter::EntryFilter;
use crate::snapshot::{DirectoryState, EntryAttributes, EntrySnapshot};

/// Walks a root directory and produces [`DirectoryState`]s.
#[derive(Debug, Clone)]
pub struct Enumerator {
    root: PathBuf,
    filter: EntryFilter,
    recursive: bool,
    attributes_to_skip: EntryAttributes,
    follow_symlinks: bool,
    case: CaseSensitivity,
}

/// Result of a completed enumeration pass.
#[derive(Debug, Clone)]
pub struct Enumeration {
    /// The produced state.
    pub state: DirectoryState,

    /// Entries or subtrees skipped because they could not be read.
    pub error_count: u64,
}

impl Enumerator {
    /// Create an enumerator for a validated config.
    pub fn new(config: &WatcherConfig) -> Result<Self> {
        let filter = config.validate()?;

        Ok(Self {
            root: config.normalized_root()?,
            filter,
            recursive: config.include_subdirectories,
            attributes_to_skip: config.attributes_to_skip,
            follow_symlinks: config.follow_symlinks,
            case: config.case_sensitivity,
        })
    }

    /// The absolute root being walked.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Case policy for state keys.
    pub fn case_sensitivity(&self) -> CaseSensitivity {
        self.case
    }

    /// Fail if the root is missing or not a directory.
    pub fn check_root(&self) -> Result<()> {
        match std::fs::metadata(&self.root) {
            Ok(metadata) if metadata.is_dir() => Ok(()),
            Ok(_) => Err(WatcherError::RootUnavailable {
                path: self.root.clone(),
                source: None,
            }),
            Err(e) => Err(WatcherError::RootUnavailable {
                path: self.root.clone(),
                source: Some(e),
            }),
        }
    }

    /// Lazily walk the tree, yielding accepted entries in depth-first order.
    pub fn scan<'a>(&'a self, cancel: &'a CancellationToken) -> Scan<'a> {
        let walker = WalkDir::new(&self.root)
            .min_depth(1)
            .max_depth(if self.recursive { usize::MAX } else { 1 })
            .follow_links(self.follow_symlinks)
            .into_iter();

        Scan {
            enumerator: self,
            walker,
            cancel,
            pending_dir: None,
            ready: VecDeque::new(),
            error_count: 0,
            cancelled: false,
        }
    }

    /// Produce a full state for the given generation.
    ///
    /// Returns `Ok(None)` when cancelled before the walk finished.
    pub fn enumerate(
        &self,
        generation: u64,
        cancel: &CancellationToken,
    ) -> Result<Option<Enumeration>> {
        self.check_root()?;

        let start = Instant::now();
        let mut scan = self.scan(cancel);
        let entries: Vec<EntrySnapshot> = scan.by_ref().collect();
        if scan.was_cancelled() {
            debug!("Enumeration of {} cancelled", self.root.display());
            return Ok(None);
        }

        let error_count = scan.error_count();
        let state = DirectoryState::from_entries(generation, self.case, entries);
        debug!(
            "Enumerated {} entries under {} in {:?} ({} errors)",
            state.len(),
            self.root.display(),
            start.elapsed(),
            error_count
        );

        Ok(Some(Enumeration { state, error_count }))
    }
}

/// An in-progress walk. Yields entries as they are visited.
pub struct Scan<'a> {
    enumerator: &'a Enumerator,
    walker: walkdir::IntoIter,
    cancel: &'a CancellationToken,
    // A directory is held back until its listing opens; an unreadable
    // directory is dropped together with its subtree.
    pending_dir: Option<EntrySnapshot>,
    ready: VecDeque<EntrySnapshot>,
    error_count: u64,
    cancelled: bool,
}

impl Scan<'_> {
    /// Entries or subtrees skipped so far because of read errors.
    pub fn error_count(&self) -> u64 {
        self.error_count
    }

    /// Whether the walk stopped on cancellation.
    pub fn was_cancelled(&self) -> bool {
        self.cancelled
    }

    fn on_error(&mut self, err: walkdir::Error) {
        self.error_count += 1;

        match self.pending_dir.take() {
            Some(dir) if err.path() == Some(dir.path.as_path()) => {
                debug!("Skipping unreadable directory {}: {err}", dir.path.display());
            }
            Some(dir) => {
                debug!("Scan error: {err}");
                self.ready.push_back(dir);
            }
            None => debug!("Scan error: {err}"),
        }
    }

    fn visit(&mut self, entry: DirEntry) {
        if let Some(dir) = self.pending_dir.take() {
            self.ready.push_back(dir);
        }

        let descends = entry.file_type().is_dir();
        if descends && self.cancel.is_cancelled() {
            self.cancelled = true;
            return;
        }

        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(err) => {
                self.error_count += 1;
                debug!("Skipping {}: {err}", entry.path().display());
                if descends {
                    self.walker.skip_current_dir();
                }
                return;
            }
        };

        let snapshot =
            EntrySnapshot::from_metadata(entry.path(), &metadata, entry.path_is_symlink());
        let filter = &self.enumerator.filter;

        if snapshot.attributes.intersects(self.enumerator.attributes_to_skip) {
            trace!("Skipping by attributes: {}", entry.path().display());
            if descends {
                self.walker.skip_current_dir();
            }
            return;
        }

        if filter.is_excluded(entry.file_name()) {
            trace!("Excluded: {}", entry.path().display());
            if descends {
                self.walker.skip_current_dir();
            }
            return;
        }

        if !filter.is_included(entry.file_name()) {
            return;
        }

        if descends && self.enumerator.recursive {
            self.pending_dir = Some(snapshot);
        } else {
            self.ready.push_back(snapshot);
        }
    }
}

impl Iterator for Scan<'_> {
    type Item = EntrySnapshot;

    fn next(&mut self) -> Option<EntrySnapshot> {
        loop {
            if let Some(entry) = self.ready.pop_front() {
                return Some(entry);
            }
            if self.cancelled {
                return None;
            }

            match self.walker.next() {
                Some(Ok(entry)) => self.visit(entry),
                Some(Err(err)) => self.on_error(err),
                None => return self.pending_dir.take(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::fs;
    use tempfile::TempDir;

    fn names(state: &DirectoryState) -> Vec<String> {
        let mut names: Vec<String> = state
            .iter()
            .map(|(_, e)| e.path.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    fn enumerate(config: &WatcherConfig) -> Enumeration {
        Enumerator::new(config)
            .unwrap()
            .enumerate(1, &CancellationToken::new())
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_exclude_pattern() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("a.txt"), "a").unwrap();
        fs::write(temp_dir.path().join("a.tmp"), "a").unwrap();

        let config = WatcherConfig::new(temp_dir.path()).exclude("*.tmp");
        let result = enumerate(&config);

        assert_eq!(names(&result.state), vec!["a.txt"]);
        assert_eq!(result.error_count, 0);
    }

    #[test]
    fn test_include_pattern_still_recurses() {
        let temp_dir = TempDir::new().unwrap();
        fs::create_dir(temp_dir.path().join("sub")).unwrap();
        fs::write(temp_dir.path().join("sub/data.csv"), "1,2").unwrap();
        fs::write(temp_dir.path().join("notes.md"), "#").unwrap();

        let config = WatcherConfig::new(temp_dir.path()).include("*.csv");
        let result = enumerate(&config);

        assert_eq!(names(&result.state), vec!["data.csv"]);
    }

    #[test]
    fn test_excluded_directory_prunes_subtree() {
        let temp_dir = TempDir::new().unwrap();
        fs::create_dir(temp_dir.path().join("cache")).unwrap();
        fs::write(temp_dir.path().join("cache/blob.bin"), "x").unwrap();
        fs::write(temp_dir.path().join("keep.txt"), "k").unwrap();

        let config = WatcherConfig::new(temp_dir.path()).exclude("cache");
        let result = enumerate(&config);

        assert_eq!(names(&result.state), vec!["keep.txt"]);
    }

    #[test]
    fn test_non_recursive_lists_immediate_children() {
        let temp_dir = TempDir::new().unwrap();
        fs::create_dir(temp_dir.path().join("sub")).unwrap();
        fs::write(temp_dir.path().join("sub/deep.txt"), "d").unwrap();
        fs::write(temp_dir.path().join("top.txt"), "t").unwrap();

        let config = WatcherConfig::new(temp_dir.path()).recursive(false);
        let result = enumerate(&config);

        assert_eq!(names(&result.state), vec!["sub", "top.txt"]);
        let sub = result.state.get(&temp_dir.path().join("sub")).unwrap();
        assert!(sub.is_directory);
        assert!(sub.attributes.contains(EntryAttributes::DIRECTORY));
    }

    #[test]
    fn test_recursive_includes_nested_entries() {
        let temp_dir = TempDir::new().unwrap();
        fs::create_dir_all(temp_dir.path().join("a/b")).unwrap();
        fs::write(temp_dir.path().join("a/b/c.txt"), "c").unwrap();

        let config = WatcherConfig::new(temp_dir.path());
        let result = enumerate(&config);

        assert_eq!(names(&result.state), vec!["a", "b", "c.txt"]);
        assert_eq!(result.state.generation(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinked_directory_is_skipped() {
        let temp_dir = TempDir::new().unwrap();
        fs::create_dir(temp_dir.path().join("real")).unwrap();
        fs::write(temp_dir.path().join("real/file.txt"), "f").unwrap();
        std::os::unix::fs::symlink(temp_dir.path(), temp_dir.path().join("real/loop")).unwrap();

        let config = WatcherConfig::new(temp_dir.path());
        let result = enumerate(&config);

        assert_eq!(names(&result.state), vec!["file.txt", "real"]);
    }

    #[cfg(unix)]
    #[test]
    fn test_unreadable_directory_is_skipped_and_counted() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let locked = temp_dir.path().join("locked");
        fs::create_dir(&locked).unwrap();
        fs::write(locked.join("secret.txt"), "s").unwrap();
        fs::write(temp_dir.path().join("open.txt"), "o").unwrap();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();

        // Root ignores permission bits.
        if fs::read_dir(&locked).is_ok() {
            fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();
            return;
        }

        let config = WatcherConfig::new(temp_dir.path());
        let result = enumerate(&config);
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();

        assert_eq!(names(&result.state), vec!["open.txt"]);
        assert_eq!(result.error_count, 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_dangling_symlink_is_counted_and_skipped() {
        let temp_dir = TempDir::new().unwrap();
        fs::create_dir(temp_dir.path().join("sub")).unwrap();
        fs::write(temp_dir.path().join("sub/inner.txt"), "i").unwrap();
        fs::write(temp_dir.path().join("keep.txt"), "k").unwrap();
        std::os::unix::fs::symlink(temp_dir.path().join("missing"), temp_dir.path().join("broken"))
            .unwrap();

        let config = WatcherConfig::new(temp_dir.path())
            .follow_symlinks()
            .skip_attributes(EntryAttributes::empty());
        let result = enumerate(&config);

        assert_eq!(names(&result.state), vec!["inner.txt", "keep.txt", "sub"]);
        assert_eq!(result.error_count, 1);
    }

    #[test]
    fn test_missing_root_is_fatal() {
        let temp_dir = TempDir::new().unwrap();
        let config = WatcherConfig::new(temp_dir.path().join("gone"));

        let err = Enumerator::new(&config)
            .unwrap()
            .enumerate(1, &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, WatcherError::RootUnavailable { .. }));
    }

    #[test]
    fn test_cancelled_scan_stops_at_directory() {
        let temp_dir = TempDir::new().unwrap();
        fs::create_dir(temp_dir.path().join("sub")).unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();

        let config = WatcherConfig::new(temp_dir.path());
        let outcome = Enumerator::new(&config)
            .unwrap()
            .enumerate(1, &cancel)
            .unwrap();
        assert!(outcome.is_none());
    }

    #[test]
    fn test_scan_is_lazy() {
        let temp_dir = TempDir::new().unwrap();
        for i in 0..5 {
            fs::write(temp_dir.path().join(format!("f{i}.txt")), "x").unwrap();
        }

        let enumerator = Enumerator::new(&WatcherConfig::new(temp_dir.path())).unwrap();
        let cancel = CancellationToken::new();
        let first_two: Vec<EntrySnapshot> = enumerator.scan(&cancel).take(2).collect();
        assert_eq!(first_two.len(), 2);
    }
}
