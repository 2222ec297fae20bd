//! Code-loading contexts and the debug-metadata seam
//!
//! A [`Loader`] stands for one code-loading context of the monitored
//! process. Loaders form a forest via parent links; type resolution walks up
//! to the parent when a loader cannot find a type, mirroring the delegation
//! behavior of the monitored runtime. Debug metadata access is abstracted
//! behind [`DebugMetadataProvider`] so the reconstructor never talks to a
//! concrete bytecode or DWARF facility directly.

use crate::construct::ConstructId;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Failure while resolving a type or its members. Each variant truncates
/// path construction at the failing frame; none of them is ever fatal.
#[derive(Debug, Clone, Error)]
pub enum ResolveError {
    #[error("type not found [{0}]")]
    TypeNotFound(String),
    #[error("no definition for type [{0}]")]
    NoDefinition(String),
    #[error("access denied while reading type [{0}]")]
    AccessDenied(String),
}

impl ResolveError {
    pub fn type_name(&self) -> &str {
        match self {
            ResolveError::TypeNotFound(t)
            | ResolveError::NoDefinition(t)
            | ResolveError::AccessDenied(t) => t,
        }
    }
}

/// One declared routine of a type, as read from compiled debug metadata.
#[derive(Debug, Clone)]
pub struct RoutineInfo {
    /// Full identity of the routine.
    pub construct: ConstructId,
    /// First source line of the routine body, if the metadata carries line
    /// tables. Used to disambiguate overloads.
    pub first_line: Option<u32>,
    /// Whether the routine is marked as a test-case entry point.
    pub test_entry: bool,
}

/// Declared members of one type.
#[derive(Debug, Clone, Default)]
pub struct TypeInfo {
    /// Qualified type name.
    pub name: String,
    /// All declared routines, in declaration order where the metadata
    /// preserves it.
    pub routines: Vec<RoutineInfo>,
}

impl TypeInfo {
    /// Routines whose simple name matches `method_name` (`<init>` selects
    /// constructors, `<clinit>` the static initializer).
    pub fn routines_named(&self, method_name: &str) -> Vec<&RoutineInfo> {
        self.routines
            .iter()
            .filter(|r| r.construct.simple_routine_name() == method_name)
            .collect()
    }
}

/// Access to compiled debug metadata of one loading context.
pub trait DebugMetadataProvider: Send + Sync {
    /// Declared routines of the given type, with first-line numbers.
    fn type_info(&self, type_name: &str) -> Result<TypeInfo, ResolveError>;

    /// Archive (or other on-disk resource) the type was loaded from, if
    /// known. Used to backfill library digests at upload time.
    fn resource_of(&self, type_name: &str) -> Option<PathBuf> {
        let _ = type_name;
        None
    }
}

/// One active code-loading context.
pub struct Loader {
    id: String,
    parent: Option<Arc<Loader>>,
    provider: Arc<dyn DebugMetadataProvider>,
}

impl Loader {
    pub fn new(
        id: impl Into<String>,
        parent: Option<Arc<Loader>>,
        provider: Arc<dyn DebugMetadataProvider>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            parent,
            provider,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn parent(&self) -> Option<&Arc<Loader>> {
        self.parent.as_ref()
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn provider(&self) -> &Arc<dyn DebugMetadataProvider> {
        &self.provider
    }

    /// Resolve a type through this loader, delegating to the parent chain on
    /// [`ResolveError::TypeNotFound`]. Other failures abort immediately.
    pub fn resolve_type(&self, type_name: &str) -> Result<TypeInfo, ResolveError> {
        let mut current = self;
        loop {
            match current.provider.type_info(type_name) {
                Ok(info) => return Ok(info),
                Err(ResolveError::TypeNotFound(_)) => match current.parent.as_deref() {
                    Some(parent) => {
                        debug!(
                            loader = current.id.as_str(),
                            type_name, "type not found, trying parent loader"
                        );
                        current = parent;
                    }
                    None => return Err(ResolveError::TypeNotFound(type_name.to_string())),
                },
                Err(e) => return Err(e),
            }
        }
    }

    /// Resource lookup along the same delegation chain as
    /// [`Loader::resolve_type`].
    pub fn resource_of(&self, type_name: &str) -> Option<PathBuf> {
        let mut current = self;
        loop {
            if let Some(p) = current.provider.resource_of(type_name) {
                return Some(p);
            }
            current = current.parent.as_deref()?;
        }
    }
}

impl std::fmt::Debug for Loader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Loader")
            .field("id", &self.id)
            .field("parent", &self.parent.as_ref().map(|p| p.id()))
            .finish()
    }
}

/// Registry of the loading contexts seen so far, keyed by loader identity.
/// Attaching is idempotent; parents are attached transitively so the whole
/// chain is known even when only a leaf loader ever triggers a callback.
#[derive(Default)]
pub struct LoaderHierarchy {
    nodes: HashMap<String, Arc<Loader>>,
}

impl LoaderHierarchy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&mut self, loader: &Arc<Loader>) {
        let mut current = Some(loader.clone());
        while let Some(l) = current {
            if self.nodes.contains_key(l.id()) {
                break;
            }
            current = l.parent().cloned();
            self.nodes.insert(l.id().to_string(), l);
        }
    }

    pub fn get(&self, id: &str) -> Option<&Arc<Loader>> {
        self.nodes.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Loader>> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
