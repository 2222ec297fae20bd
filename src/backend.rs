//! Backend collaborator seam
//!
//! The coordinator never talks to the remote store directly; it hands
//! serialized batches to an implementation of [`Backend`]. The REST client
//! itself lives outside this crate.

use crate::construct::ConstructId;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

/// Maven-style application coordinates of the monitored process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AppContext {
    pub group: String,
    pub artifact: String,
    pub version: String,
}

impl AppContext {
    pub fn new(
        group: impl Into<String>,
        artifact: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            artifact: artifact.into(),
            version: version.into(),
        }
    }
}

/// Identity of the goal execution on whose behalf an upload happens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionContext {
    pub execution_id: String,
}

impl ExecutionContext {
    pub fn new(execution_id: impl Into<String>) -> Self {
        Self {
            execution_id: execution_id.into(),
        }
    }
}

/// Transport or server-side failure reported by the backend collaborator.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend connection failed: {0}")]
    Connection(String),
    #[error("archive analysis failed for [{path}]: {reason}")]
    ArchiveAnalysis { path: String, reason: String },
}

/// Change lists of known vulnerabilities, keyed by vulnerability identifier.
pub type ChangeLists = HashMap<String, HashSet<ConstructId>>;

/// Remote store operations consumed by the coordinator. Bodies are passed as
/// serialized JSON; the payload schema is owned by the backend.
pub trait Backend: Send + Sync {
    /// Constructs modified by each vulnerability known for the application.
    fn get_vulnerability_change_lists(
        &self,
        ctx: &ExecutionContext,
        app: &AppContext,
    ) -> Result<ChangeLists, BackendError>;

    fn upload_usage_records(
        &self,
        ctx: &ExecutionContext,
        app: &AppContext,
        json: &str,
    ) -> Result<(), BackendError>;

    fn upload_paths(
        &self,
        ctx: &ExecutionContext,
        app: &AppContext,
        json: &str,
    ) -> Result<(), BackendError>;
}
