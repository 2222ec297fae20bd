//! Shared fixtures for integration tests
#![allow(dead_code)] // not every suite uses every helper

use calltrace::archive::{ArchiveAnalyzer, ArchiveInfo};
use calltrace::backend::{Backend, BackendError, ChangeLists};
use calltrace::loader::{DebugMetadataProvider, Loader, ResolveError, RoutineInfo, TypeInfo};
use calltrace::{AppContext, ConstructId, ConstructKind, ExecutionContext, Lang, RawFrame};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

pub fn method(qname: &str) -> ConstructId {
    ConstructId::new(Lang::Java, ConstructKind::Method, qname)
}

pub fn frame(type_name: &str, method_name: &str, line: u32) -> RawFrame {
    RawFrame::new(type_name, method_name).with_line(line)
}

pub fn app() -> AppContext {
    AppContext::new("com.acme", "shop", "1.0.0")
}

pub fn exe() -> ExecutionContext {
    ExecutionContext::new("exec-1")
}

/// Metadata provider over a fixed table of types.
pub struct TableProvider {
    types: HashMap<String, TypeInfo>,
    resources: HashMap<String, std::path::PathBuf>,
}

impl TableProvider {
    pub fn new(types: Vec<TypeInfo>) -> Self {
        Self {
            types: types.into_iter().map(|t| (t.name.clone(), t)).collect(),
            resources: HashMap::new(),
        }
    }

    pub fn with_resource(mut self, type_name: &str, resource: &Path) -> Self {
        self.resources
            .insert(type_name.to_string(), resource.to_path_buf());
        self
    }

    pub fn into_loader(self, id: &str) -> Arc<Loader> {
        Loader::new(id, None, Arc::new(self))
    }
}

impl DebugMetadataProvider for TableProvider {
    fn type_info(&self, type_name: &str) -> Result<TypeInfo, ResolveError> {
        self.types
            .get(type_name)
            .cloned()
            .ok_or_else(|| ResolveError::TypeNotFound(type_name.to_string()))
    }

    fn resource_of(&self, type_name: &str) -> Option<std::path::PathBuf> {
        self.resources.get(type_name).cloned()
    }
}

/// One type with plain (non-test) methods given as `(simple_name, first_line)`.
pub fn plain_type(type_name: &str, methods: &[(&str, u32)]) -> TypeInfo {
    TypeInfo {
        name: type_name.to_string(),
        routines: methods
            .iter()
            .map(|(name, line)| RoutineInfo {
                construct: method(&format!("{type_name}.{name}()")),
                first_line: Some(*line),
                test_entry: false,
            })
            .collect(),
    }
}

/// One type with a single test-entry method.
pub fn test_type(type_name: &str, method_name: &str, line: u32) -> TypeInfo {
    TypeInfo {
        name: type_name.to_string(),
        routines: vec![RoutineInfo {
            construct: method(&format!("{type_name}.{method_name}()")),
            first_line: Some(line),
            test_entry: true,
        }],
    }
}

/// Backend stub recording every upload; optionally failing transport calls.
#[derive(Default)]
pub struct RecordingBackend {
    pub change_lists: ChangeLists,
    pub fail_uploads: bool,
    pub usage_uploads: Mutex<Vec<String>>,
    pub path_uploads: Mutex<Vec<String>>,
}

impl RecordingBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_change_list(bug: &str, constructs: Vec<ConstructId>) -> Arc<Self> {
        let mut backend = Self::default();
        backend
            .change_lists
            .insert(bug.to_string(), constructs.into_iter().collect());
        Arc::new(backend)
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail_uploads: true,
            ..Self::default()
        })
    }

    pub fn usage_bodies(&self) -> Vec<serde_json::Value> {
        self.usage_uploads
            .lock()
            .unwrap()
            .iter()
            .map(|s| serde_json::from_str(s).unwrap())
            .collect()
    }

    pub fn path_bodies(&self) -> Vec<serde_json::Value> {
        self.path_uploads
            .lock()
            .unwrap()
            .iter()
            .map(|s| serde_json::from_str(s).unwrap())
            .collect()
    }
}

impl Backend for RecordingBackend {
    fn get_vulnerability_change_lists(
        &self,
        _ctx: &ExecutionContext,
        _app: &AppContext,
    ) -> Result<ChangeLists, BackendError> {
        Ok(self.change_lists.clone())
    }

    fn upload_usage_records(
        &self,
        _ctx: &ExecutionContext,
        _app: &AppContext,
        json: &str,
    ) -> Result<(), BackendError> {
        self.usage_uploads.lock().unwrap().push(json.to_string());
        if self.fail_uploads {
            return Err(BackendError::Connection("stub transport down".into()));
        }
        Ok(())
    }

    fn upload_paths(
        &self,
        _ctx: &ExecutionContext,
        _app: &AppContext,
        json: &str,
    ) -> Result<(), BackendError> {
        self.path_uploads.lock().unwrap().push(json.to_string());
        if self.fail_uploads {
            return Err(BackendError::Connection("stub transport down".into()));
        }
        Ok(())
    }
}

/// Analyzer stub yielding a deterministic digest without touching the disk.
pub struct StubAnalyzer;

impl ArchiveAnalyzer for StubAnalyzer {
    fn analyze_archive(&self, path: &Path) -> Result<ArchiveInfo, BackendError> {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(ArchiveInfo {
            digest: format!("digest-of-{file_name}"),
            file_name,
        })
    }
}

/// Analyzer stub that always fails, leaving digests unresolved.
pub struct BrokenAnalyzer;

impl ArchiveAnalyzer for BrokenAnalyzer {
    fn analyze_archive(&self, path: &Path) -> Result<ArchiveInfo, BackendError> {
        Err(BackendError::ArchiveAnalysis {
            path: path.display().to_string(),
            reason: "stub failure".into(),
        })
    }
}
