//! File name filtering for enumeration.

use std::ffi::OsStr;

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};

use crate::config::CaseSensitivity;
use crate::error::{Result, WatcherError};

/// Compiled include and exclude patterns, matched against an entry's file
/// name only.
#[derive(Debug, Clone)]
pub struct EntryFilter {
    include: Option<GlobSet>,
    exclude: Option<GlobSet>,
}

impl EntryFilter {
    /// Compile the given patterns.
    pub fn new(include: &[String], exclude: &[String], case: CaseSensitivity) -> Result<Self> {
        Ok(Self {
            include: build_set(include, case)?,
            exclude: build_set(exclude, case)?,
        })
    }

    /// A filter that accepts everything.
    pub fn accept_all() -> Self {
        Self {
            include: None,
            exclude: None,
        }
    }

    /// Whether the name matches the include set. An empty set matches all.
    pub fn is_included(&self, name: &OsStr) -> bool {
        self.include.as_ref().is_none_or(|set| set.is_match(name))
    }

    /// Whether the name matches the exclude set.
    pub fn is_excluded(&self, name: &OsStr) -> bool {
        self.exclude.as_ref().is_some_and(|set| set.is_match(name))
    }

    /// Include check followed by exclude check; exclusion wins.
    pub fn matches(&self, name: &OsStr) -> bool {
        self.is_included(name) && !self.is_excluded(name)
    }
}

fn build_set(patterns: &[String], case: CaseSensitivity) -> Result<Option<GlobSet>> {
    if patterns.is_empty() {
        return Ok(None);
    }

    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = GlobBuilder::new(pattern)
            .case_insensitive(case.folds())
            .literal_separator(true)
            .build()
            .map_err(|source| WatcherError::InvalidPattern {
                pattern: pattern.clone(),
                source,
            })?;
        builder.add(glob);
    }

    let set = builder
        .build()
        .map_err(|source| WatcherError::InvalidPattern {
            pattern: patterns.join(", "),
            source,
        })?;
    Ok(Some(set))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(include: &[&str], exclude: &[&str], case: CaseSensitivity) -> EntryFilter {
        let include: Vec<String> = include.iter().map(|p| (*p).to_string()).collect();
        let exclude: Vec<String> = exclude.iter().map(|p| (*p).to_string()).collect();
        EntryFilter::new(&include, &exclude, case).unwrap()
    }

    #[test]
    fn test_empty_include_matches_all() {
        let f = filter(&[], &[], CaseSensitivity::Sensitive);
        assert!(f.matches(OsStr::new("a.txt")));
        assert!(f.matches(OsStr::new("anything")));
    }

    #[test]
    fn test_exclusion_wins() {
        let f = filter(&["a.*"], &["*.tmp"], CaseSensitivity::Sensitive);
        assert!(f.matches(OsStr::new("a.txt")));
        assert!(!f.matches(OsStr::new("a.tmp")));
        assert!(!f.matches(OsStr::new("b.txt")));
    }

    #[test]
    fn test_case_policy() {
        let sensitive = filter(&["*.csv"], &[], CaseSensitivity::Sensitive);
        assert!(!sensitive.matches(OsStr::new("REPORT.CSV")));

        let insensitive = filter(&["*.csv"], &[], CaseSensitivity::Insensitive);
        assert!(insensitive.matches(OsStr::new("REPORT.CSV")));
    }
}
