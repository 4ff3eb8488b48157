//! Configuration types for polling watchers.

use std::path::{Path, PathBuf};
use std::time::Duration;

use path_absolutize::Absolutize;
use serde::{Deserialize, Serialize};
use serde_with::{DurationMilliSeconds, serde_as};

use crate::error::{Result, WatcherError};
use crate::filter::EntryFilter;
use crate::snapshot::EntryAttributes;

/// Default polling interval.
pub const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_secs(1);

/// Default capacity of the background dispatch queue.
pub const DEFAULT_BACKGROUND_QUEUE_CAPACITY: usize = 1000;

/// Configuration for a polled directory tree.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    /// Root directory of the watched tree.
    pub root_path: PathBuf,

    /// File name globs to include. Empty means everything.
    pub include_patterns: Vec<String>,

    /// File name globs to exclude. Exclusion wins over inclusion.
    pub exclude_patterns: Vec<String>,

    /// Whether to descend below the root's immediate children.
    pub include_subdirectories: bool,

    /// Time between the starts of two poll cycles.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "polling_interval_ms")]
    pub polling_interval: Duration,

    /// Entries carrying any of these attributes are omitted, and their
    /// subtree is not visited.
    pub attributes_to_skip: EntryAttributes,

    /// Path key folding and pattern matching policy.
    pub case_sensitivity: CaseSensitivity,

    /// Whether to follow symbolic links while walking.
    pub follow_symlinks: bool,

    /// Take a silent first snapshot on start instead of reporting every
    /// existing entry as created.
    pub baseline: bool,

    /// Where observers run.
    pub dispatch_mode: DispatchMode,

    /// Bound of the queue feeding the background dispatch task.
    pub background_queue_capacity: usize,
}

impl WatcherConfig {
    /// Create a new config with default values.
    pub fn new(root_path: impl Into<PathBuf>) -> Self {
        Self {
            root_path: root_path.into(),
            include_patterns: Vec::new(),
            exclude_patterns: Vec::new(),
            include_subdirectories: true,
            polling_interval: DEFAULT_POLLING_INTERVAL,
            attributes_to_skip: EntryAttributes::SYMLINK,
            case_sensitivity: CaseSensitivity::default(),
            follow_symlinks: false,
            baseline: false,
            dispatch_mode: DispatchMode::Inline,
            background_queue_capacity: DEFAULT_BACKGROUND_QUEUE_CAPACITY,
        }
    }

    /// Parse a config from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Load a config from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Set the polling interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.polling_interval = interval;
        self
    }

    /// Add an include pattern.
    pub fn include(mut self, pattern: impl Into<String>) -> Self {
        self.include_patterns.push(pattern.into());
        self
    }

    /// Add an exclude pattern.
    pub fn exclude(mut self, pattern: impl Into<String>) -> Self {
        self.exclude_patterns.push(pattern.into());
        self
    }

    /// Set whether subdirectories are walked.
    pub fn recursive(mut self, recursive: bool) -> Self {
        self.include_subdirectories = recursive;
        self
    }

    /// Set the attributes that cause an entry to be skipped.
    pub fn skip_attributes(mut self, attributes: EntryAttributes) -> Self {
        self.attributes_to_skip = attributes;
        self
    }

    /// Set the case sensitivity policy.
    pub fn with_case_sensitivity(mut self, case: CaseSensitivity) -> Self {
        self.case_sensitivity = case;
        self
    }

    /// Enable following symbolic links.
    pub fn follow_symlinks(mut self) -> Self {
        self.follow_symlinks = true;
        self
    }

    /// Enable baseline mode.
    pub fn baseline(mut self) -> Self {
        self.baseline = true;
        self
    }

    /// Set the dispatch mode.
    pub fn with_dispatch_mode(mut self, mode: DispatchMode) -> Self {
        self.dispatch_mode = mode;
        self
    }

    /// Check the config and compile its patterns.
    pub fn validate(&self) -> Result<EntryFilter> {
        if self.root_path.as_os_str().is_empty() {
            return Err(WatcherError::Config("root path is empty".to_string()));
        }
        if self.polling_interval.is_zero() {
            return Err(WatcherError::Config(
                "polling interval must be greater than zero".to_string(),
            ));
        }
        if self.dispatch_mode == DispatchMode::Background && self.background_queue_capacity == 0 {
            return Err(WatcherError::Config(
                "background queue capacity must be greater than zero".to_string(),
            ));
        }

        EntryFilter::new(
            &self.include_patterns,
            &self.exclude_patterns,
            self.case_sensitivity,
        )
    }

    /// Absolute, lexically normalized root path.
    pub fn normalized_root(&self) -> Result<PathBuf> {
        Ok(self.root_path.absolutize()?.into_owned())
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self::new(PathBuf::new())
    }
}

/// How path keys are compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseSensitivity {
    /// Keys are compared byte for byte.
    Sensitive,

    /// Keys are folded to lower case.
    Insensitive,
}

impl CaseSensitivity {
    /// Whether keys are folded.
    pub fn folds(self) -> bool {
        self == Self::Insensitive
    }
}

impl Default for CaseSensitivity {
    fn default() -> Self {
        if cfg!(any(windows, target_os = "macos")) {
            Self::Insensitive
        } else {
            Self::Sensitive
        }
    }
}

/// Where change records are delivered to observers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// On the polling task; a cycle's dispatch completes before the next scan.
    #[default]
    Inline,

    /// On a separate delivery task fed through a bounded queue.
    Background,
}
