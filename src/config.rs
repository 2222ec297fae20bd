//! Collector configuration
//!
//! Configuration values arrive from the embedding layer (file/env parsing is
//! out of scope here). A malformed blacklist pattern is the one fatal
//! configuration error: it surfaces when the coordinator is constructed and
//! disables tracing for the process.

use crate::backend::AppContext;
use regex::{RegexSet, RegexSetBuilder};
use std::collections::HashMap;

/// Tunables of the trace coordinator.
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Worker threads for archive analysis.
    pub pool_size: usize,
    /// Back-pressure limit on pending usage records; `None` means unbounded.
    pub max_items: Option<usize>,
    /// Case-insensitive patterns of archive file names to ignore.
    pub archive_blacklist: Vec<String>,
    /// Application coordinates applied to records that were not stamped at
    /// the call site.
    pub app_context: Option<AppContext>,
    /// Whether path reconstruction stops at the first test-entry construct.
    pub stop_at_test_entry: bool,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            max_items: None,
            archive_blacklist: Vec::new(),
            app_context: None,
            stop_at_test_entry: true,
        }
    }
}

impl CollectorConfig {
    /// Silent back-pressure guard of `add_trace`.
    pub fn max_pending_reached(&self, pending: usize) -> bool {
        self.max_items.is_some_and(|max| pending >= max)
    }

    pub fn compile_blacklist(&self) -> Result<ArchiveBlacklist, regex::Error> {
        ArchiveBlacklist::compile(&self.archive_blacklist)
    }
}

/// Compiled archive-name blacklist with a per-file-name decision cache.
#[derive(Debug)]
pub struct ArchiveBlacklist {
    patterns: RegexSet,
    checked: HashMap<String, bool>,
}

impl ArchiveBlacklist {
    pub fn compile(patterns: &[String]) -> Result<Self, regex::Error> {
        let patterns = RegexSetBuilder::new(patterns)
            .case_insensitive(true)
            .build()?;
        Ok(Self {
            patterns,
            checked: HashMap::new(),
        })
    }

    /// Whether the archive file name is blacklisted. The verdict is cached
    /// per file name, so repeated callbacks from the same archive avoid the
    /// pattern scan.
    pub fn is_blacklisted(&mut self, file_name: &str) -> bool {
        if let Some(&hit) = self.checked.get(file_name) {
            return hit;
        }
        let hit = self.patterns.is_match(file_name);
        self.checked.insert(file_name.to_string(), hit);
        hit
    }
}
