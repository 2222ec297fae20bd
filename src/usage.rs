//! Usage records and path nodes
//!
//! A [`UsageRecord`] aggregates the observations of one construct within one
//! application context and origin resource. Records live only in memory:
//! they are created per callback, merged any number of times, and consumed
//! at upload time.

use crate::backend::AppContext;
use crate::construct::ConstructId;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

/// One element of a reconstructed call path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathNode {
    pub construct: ConstructId,
    /// Digest of the library the construct was loaded from, if known at
    /// capture time.
    pub library_digest: Option<String>,
}

impl PathNode {
    pub fn new(construct: ConstructId) -> Self {
        Self {
            construct,
            library_digest: None,
        }
    }

    pub fn with_digest(construct: ConstructId, digest: Option<String>) -> Self {
        Self {
            construct,
            library_digest: digest,
        }
    }
}

/// Identity of a usage record: two records describe the same logical entry
/// iff construct, application context and origin resource all match.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UsageKey {
    pub construct: ConstructId,
    pub app_context: Option<AppContext>,
    pub origin_resource: Option<PathBuf>,
}

/// Aggregated observation of one construct.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageRecord {
    construct: ConstructId,
    /// Milliseconds since the Unix epoch.
    first_observed_at_ms: u64,
    /// Call-site occurrence counter. The instrumented site reports a running
    /// total, so duplicates merge with max(), not a sum.
    occurrence_count: u32,
    origin_resource: Option<PathBuf>,
    origin_loader: Option<String>,
    archive_digest: Option<String>,
    archive_file_name: Option<String>,
    app_context: Option<AppContext>,
    execution_id: Option<String>,
    test_contexts: BTreeSet<ConstructId>,
}

impl UsageRecord {
    pub fn new(
        construct: ConstructId,
        origin_resource: Option<PathBuf>,
        origin_loader: Option<String>,
        observed_at_ms: u64,
        occurrence_count: u32,
    ) -> Self {
        Self {
            construct,
            first_observed_at_ms: observed_at_ms,
            occurrence_count: occurrence_count.max(1),
            origin_resource,
            origin_loader,
            archive_digest: None,
            archive_file_name: None,
            app_context: None,
            execution_id: None,
            test_contexts: BTreeSet::new(),
        }
    }

    /// Current wall-clock time in milliseconds since the Unix epoch.
    pub fn now_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    pub fn key(&self) -> UsageKey {
        UsageKey {
            construct: self.construct.clone(),
            app_context: self.app_context.clone(),
            origin_resource: self.origin_resource.clone(),
        }
    }

    /// Merge another observation of the same logical entry into this one.
    /// Counters merge as max, test contexts as union, the earlier timestamp
    /// wins, and missing archive data is filled in from the other side.
    /// Commutative and idempotent with respect to the serialized outcome.
    pub fn merge(&mut self, other: &UsageRecord) {
        debug_assert_eq!(self.key(), other.key());
        self.occurrence_count = self.occurrence_count.max(other.occurrence_count);
        self.first_observed_at_ms = self.first_observed_at_ms.min(other.first_observed_at_ms);
        self.test_contexts
            .extend(other.test_contexts.iter().cloned());
        if self.archive_digest.is_none() {
            self.archive_digest = other.archive_digest.clone();
        }
        if self.archive_file_name.is_none() {
            self.archive_file_name = other.archive_file_name.clone();
        }
    }

    pub fn add_test_context(&mut self, test_entry: ConstructId) {
        self.test_contexts.insert(test_entry);
    }

    pub fn construct(&self) -> &ConstructId {
        &self.construct
    }

    pub fn first_observed_at_ms(&self) -> u64 {
        self.first_observed_at_ms
    }

    pub fn occurrence_count(&self) -> u32 {
        self.occurrence_count
    }

    pub fn origin_resource(&self) -> Option<&PathBuf> {
        self.origin_resource.as_ref()
    }

    pub fn origin_loader(&self) -> Option<&str> {
        self.origin_loader.as_deref()
    }

    pub fn archive_digest(&self) -> Option<&str> {
        self.archive_digest.as_deref()
    }

    pub fn archive_file_name(&self) -> Option<&str> {
        self.archive_file_name.as_deref()
    }

    pub fn set_archive(&mut self, digest: impl Into<String>, file_name: Option<String>) {
        self.archive_digest = Some(digest.into());
        self.archive_file_name = file_name;
    }

    pub fn app_context(&self) -> Option<&AppContext> {
        self.app_context.as_ref()
    }

    pub fn set_app_context(&mut self, ctx: AppContext) {
        self.app_context = Some(ctx);
    }

    pub fn execution_id(&self) -> Option<&str> {
        self.execution_id.as_deref()
    }

    pub fn set_execution_id(&mut self, id: impl Into<String>) {
        self.execution_id = Some(id.into());
    }

    pub fn test_contexts(&self) -> &BTreeSet<ConstructId> {
        &self.test_contexts
    }
}
