//! # Polling Watcher
//!
//! Change detection for directory trees where native notifications are not
//! available or not trustworthy, such as network shares and some
//! virtualized file systems. The tree is re-scanned on a fixed cadence and
//! consecutive scans are diffed into created, changed, deleted and renamed
//! records that drive downstream automation.
//!
//! ## Features
//!
//! - **Lazy Enumeration**: Depth-first walk with include/exclude globs,
//!   attribute-based pruning and per-directory cancellation
//! - **Immutable Snapshots**: Each cycle publishes a new state by swapping a
//!   reference
//! - **Rename Heuristic**: Deleted/created file pairs with matching length and
//!   write time are merged
//! - **Drift Correction**: Slow scans shorten the following sleep
//! - **Isolated Observers**: A failing or panicking callback does not affect
//!   the others
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       Polling Watcher                           │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  WatcherConfig ──► Enumerator ──► DirectoryState               │
//! │                                        │                        │
//! │                                        ▼                        │
//! │  previous state ──────────────► detect_changes                 │
//! │                                        │                        │
//! │                                        ▼                        │
//! │                    Dispatcher ──► observers (ChangeRecord)      │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Transient files that appear and disappear within one interval are not
//! reported.

pub mod config;
pub mod detector;
pub mod dispatcher;
pub mod enumerator;
pub mod error;
pub mod event;
pub mod filter;
pub mod snapshot;
pub mod watcher;

pub use config::{CaseSensitivity, DispatchMode, WatcherConfig};
pub use detector::detect_changes;
pub use dispatcher::{Dispatcher, SubscriptionId};
pub use enumerator::{Enumeration, Enumerator};
pub use error::{Result, WatcherError};
pub use event::{ChangeKind, ChangeRecord};
pub use filter::EntryFilter;
pub use snapshot::{DirectoryState, EntryAttributes, EntrySnapshot};
pub use watcher::{CycleOutcome, CycleStats, PollingWatcher, WatcherState};
