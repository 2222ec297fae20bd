//! Upload payload shapes
//!
//! The backend owns these schemas; this module only mirrors them. Usage
//! records and paths serialize into JSON arrays handed to the backend
//! collaborator as strings.

use crate::backend::AppContext;
use crate::construct::ConstructId;
use crate::usage::{PathNode, UsageRecord};
use serde::Serialize;

/// Marker of paths derived from runtime stack traces, as opposed to paths
/// found by static reachability analysis.
pub const PATH_SOURCE_TRACED: &str = "X2C";

/// Archive reference inside a usage payload.
#[derive(Debug, Clone, Serialize)]
pub struct LibRef {
    pub digest: String,
    pub filename: String,
}

/// One serialized usage record.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsagePayload {
    /// Milliseconds since the Unix epoch.
    pub traced_at: u64,
    pub count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app: Option<AppContext>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lib: Option<LibRef>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub junits: Vec<ConstructId>,
    pub construct_id: ConstructId,
}

impl UsagePayload {
    pub fn from_record(record: &UsageRecord) -> Self {
        let lib = match (record.archive_digest(), record.archive_file_name()) {
            (Some(digest), Some(filename)) => Some(LibRef {
                digest: digest.to_string(),
                filename: filename.to_string(),
            }),
            _ => None,
        };
        Self {
            traced_at: record.first_observed_at_ms(),
            count: record.occurrence_count(),
            execution_id: record.execution_id().map(str::to_string),
            app: record.app_context().cloned(),
            lib,
            junits: record.test_contexts().iter().cloned().collect(),
            construct_id: record.construct().clone(),
        }
    }
}

/// One node of a serialized path.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PathNodePayload {
    pub construct_id: ConstructId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lib: Option<String>,
}

impl PathNodePayload {
    pub fn from_node(node: &PathNode) -> Self {
        Self {
            construct_id: node.construct.clone(),
            lib: node.library_digest.clone(),
        }
    }
}

/// One serialized path, attributed to the vulnerability whose change list
/// contains the path's terminal construct.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PathPayload {
    pub app: AppContext,
    pub bug: String,
    pub execution_id: String,
    pub source: &'static str,
    pub path: Vec<PathNodePayload>,
}
