//! Trace coordinator
//!
//! Process-wide receiver of instrumentation callbacks. Builds and queues
//! usage records, schedules archive analysis, reconstructs call paths, and
//! drains both queues to the backend collaborator in bounded batches.
//!
//! All mutating operations are serialized through one lock: contended
//! callers block but never fail due to contention. Tracing is secondary to
//! the application, so back-pressure (the max-items guard) and the pause
//! gate silently discard work instead of slowing the caller down.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

use thiserror::Error;
use tracing::{error, info, warn};

use crate::archive::{AnalysisPool, ArchiveAnalyzer};
use crate::backend::{AppContext, Backend, ChangeLists, ExecutionContext};
use crate::config::{ArchiveBlacklist, CollectorConfig};
use crate::construct::{ConstructId, ConstructKind, Lang};
use crate::gate::CollectionGate;
use crate::loader::{Loader, LoaderHierarchy};
use crate::reconstruct::PathReconstructor;
use crate::stack::RawFrame;
use crate::stats::TraceStatistics;
use crate::upload::{PathNodePayload, PathPayload, UsagePayload, PATH_SOURCE_TRACED};
use crate::usage::{PathNode, UsageKey, UsageRecord};

/// Paths are drained in small fixed batches in front of the (potentially
/// unbounded) usage record upload.
const PATH_BATCH_SIZE: usize = 10;

/// Construct kinds that may perform callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackKind {
    Method,
    Constructor,
    StaticInit,
}

impl CallbackKind {
    fn construct_kind(self) -> ConstructKind {
        match self {
            CallbackKind::Method => ConstructKind::Method,
            CallbackKind::Constructor => ConstructKind::Constructor,
            CallbackKind::StaticInit => ConstructKind::StaticInit,
        }
    }
}

/// Per-callback options, the typed rendition of the instrumentation
/// parameter bag.
#[derive(Debug, Clone, Default)]
pub struct TraceOptions {
    /// Captured stack, innermost frame first.
    pub stacktrace: Option<Vec<RawFrame>>,
    /// Build and queue a call path from the stack trace.
    pub build_path: bool,
    /// Attribute the record to test-entry constructs on the stack.
    pub test_context: bool,
    /// Occurrence counter reported by the call site (a running total).
    pub counter: u32,
}

/// Fatal initialization failure. Anything else in this crate degrades
/// gracefully; a coordinator that cannot be built disables tracing for the
/// whole process while the host process continues.
#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("invalid archive blacklist pattern: {0}")]
    Config(#[from] regex::Error),
    #[error("tracing disabled by an earlier initialization failure")]
    Disabled,
}

/// Mutable collector state, guarded by the coordinator lock.
struct CollectorState {
    hierarchy: LoaderHierarchy,
    blacklist: ArchiveBlacklist,
    reconstructor: PathReconstructor,
    usage_queue: VecDeque<UsageRecord>,
    path_queue: VecDeque<Vec<PathNode>>,
    /// Types and packages that already got their coverage record.
    context_constructs: HashSet<ConstructId>,
    /// Archives already handed to the analysis pool.
    submitted_archives: HashSet<PathBuf>,
    /// Lazily created on the first archive submission.
    pool: Option<Arc<AnalysisPool>>,
    stats: TraceStatistics,
}

/// Process-wide trace coordinator, the receiving end of the code
/// instrumentation layer.
pub struct TraceCoordinator {
    gate: Arc<CollectionGate>,
    config: CollectorConfig,
    backend: Arc<dyn Backend>,
    analyzer: Arc<dyn ArchiveAnalyzer>,
    state: Mutex<CollectorState>,
}

/// `None` marks a failed installation: tracing stays off for the process.
static GLOBAL: OnceLock<Option<TraceCoordinator>> = OnceLock::new();

impl TraceCoordinator {
    /// Build a standalone coordinator with its own gate. Used by embedders
    /// that manage the lifecycle themselves, and by tests.
    pub fn new(
        config: CollectorConfig,
        gate: Arc<CollectionGate>,
        backend: Arc<dyn Backend>,
        analyzer: Arc<dyn ArchiveAnalyzer>,
    ) -> Result<Self, CollectorError> {
        let blacklist = config.compile_blacklist()?;
        let mut reconstructor = PathReconstructor::new(Lang::Java);
        reconstructor.set_stop_at_test_entry(config.stop_at_test_entry);
        Ok(Self {
            gate,
            config,
            backend,
            analyzer,
            state: Mutex::new(CollectorState {
                hierarchy: LoaderHierarchy::new(),
                blacklist,
                reconstructor,
                usage_queue: VecDeque::new(),
                path_queue: VecDeque::new(),
                context_constructs: HashSet::new(),
                submitted_archives: HashSet::new(),
                pool: None,
                stats: TraceStatistics::default(),
            }),
        })
    }

    /// Install the process-wide coordinator. The gate is paused while the
    /// coordinator and its collaborators are constructed, so reentrant
    /// callbacks from instrumented dependencies no-op instead of recursing.
    /// A failed installation is permanent: later callbacks stay no-ops and
    /// later `install` calls report [`CollectorError::Disabled`].
    pub fn install(
        config: CollectorConfig,
        backend: Arc<dyn Backend>,
        analyzer: Arc<dyn ArchiveAnalyzer>,
    ) -> Result<&'static Self, CollectorError> {
        let mut first_error = None;
        let slot = GLOBAL.get_or_init(|| {
            let gate = Arc::new(CollectionGate::new());
            gate.set_paused(true);
            match Self::new(config, gate.clone(), backend, analyzer) {
                Ok(coordinator) => {
                    info!("trace coordinator installed");
                    gate.set_paused(false);
                    Some(coordinator)
                }
                Err(e) => {
                    error!("trace coordinator initialization failed: {e}");
                    first_error = Some(e);
                    None
                }
            }
        });
        match slot {
            Some(coordinator) => Ok(coordinator),
            None => Err(first_error.unwrap_or(CollectorError::Disabled)),
        }
    }

    /// The installed coordinator, if installation succeeded.
    pub fn global() -> Option<&'static Self> {
        GLOBAL.get().and_then(|slot| slot.as_ref())
    }

    /// Pause switch for this coordinator.
    pub fn gate(&self) -> &CollectionGate {
        &self.gate
    }

    /// Static callback entry point for instrumented call sites. Returns
    /// whether the event was collected: false while paused, before
    /// installation, or for an unparsable name.
    pub fn callback(
        kind: CallbackKind,
        qname: &str,
        loader: Option<&Arc<Loader>>,
        resource: Option<&Path>,
        archive_digest: Option<&str>,
        app: Option<AppContext>,
        options: TraceOptions,
    ) -> bool {
        match Self::global() {
            Some(c) => c.trace_callback(kind, qname, loader, resource, archive_digest, app, options),
            None => false,
        }
    }

    /// Instance-level callback; same contract as [`TraceCoordinator::callback`].
    #[allow(clippy::too_many_arguments)]
    pub fn trace_callback(
        &self,
        kind: CallbackKind,
        qname: &str,
        loader: Option<&Arc<Loader>>,
        resource: Option<&Path>,
        archive_digest: Option<&str>,
        app: Option<AppContext>,
        options: TraceOptions,
    ) -> bool {
        if self.gate.is_paused() {
            return false;
        }

        let parsed = match kind {
            CallbackKind::Method => ConstructId::parse_method_qname(Lang::Java, qname),
            CallbackKind::Constructor => ConstructId::parse_constructor_qname(Lang::Java, qname),
            CallbackKind::StaticInit => ConstructId::parse_static_init_qname(Lang::Java, qname),
        };
        let construct = match parsed {
            Ok(c) => c,
            Err(e) => {
                error!("callback rejected: {e}");
                return false;
            }
        };

        self.add_trace(kind, construct, loader, resource, archive_digest, app, options);
        true
    }

    #[allow(clippy::too_many_arguments)]
    fn add_trace(
        &self,
        kind: CallbackKind,
        construct: ConstructId,
        loader: Option<&Arc<Loader>>,
        resource: Option<&Path>,
        archive_digest: Option<&str>,
        app: Option<AppContext>,
        options: TraceOptions,
    ) {
        let mut state = self.state.lock().unwrap();

        // Silent back-pressure once the pending count hits the limit.
        if self.config.max_pending_reached(state.usage_queue.len()) {
            return;
        }

        if let Some(l) = loader {
            state.hierarchy.attach(l);
        }

        let archive_file_name = resource
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned());

        if let Some(name) = archive_file_name.as_deref() {
            if state.blacklist.is_blacklisted(name) {
                state.stats.count_blacklisted(kind.construct_kind());
                return;
            }
        }

        // Call site was not stamped with a digest at instrumentation time,
        // so the archive has to be analyzed in this process.
        if archive_digest.is_none() {
            if let Some(path) = resource {
                self.schedule_archive_analysis(&mut state, path);
            }
        }

        let now = UsageRecord::now_ms();
        let loader_id = loader.map(|l| l.id().to_string());
        let mut record = UsageRecord::new(
            construct.clone(),
            resource.map(Path::to_path_buf),
            loader_id.clone(),
            now,
            options.counter,
        );
        if let Some(digest) = archive_digest {
            record.set_archive(digest, archive_file_name.clone());
        }
        if let Some(app) = app.clone() {
            record.set_app_context(app);
        }

        // One coverage record each for the defining type and its package,
        // once per process lifetime.
        for ctx in [construct.definition_context(), construct.package_id()]
            .into_iter()
            .flatten()
        {
            if state.context_constructs.insert(ctx.clone()) {
                let mut ctx_record = UsageRecord::new(
                    ctx,
                    resource.map(Path::to_path_buf),
                    loader_id.clone(),
                    now,
                    1,
                );
                if let Some(digest) = archive_digest {
                    ctx_record.set_archive(digest, archive_file_name.clone());
                }
                if let Some(app) = app.clone() {
                    ctx_record.set_app_context(app);
                }
                state.usage_queue.push_back(ctx_record);
            }
        }

        // Reconstruct the stack into a path and/or test-context info. Static
        // initializers run outside any meaningful call chain.
        let want_stack = options.build_path || options.test_context;
        if want_stack && kind != CallbackKind::StaticInit {
            if let Some(frames) = options.stacktrace.as_deref() {
                let seed = PathNode::with_digest(
                    construct.clone(),
                    archive_digest.map(str::to_string),
                );
                let CollectorState {
                    reconstructor,
                    hierarchy,
                    ..
                } = &mut *state;
                let fallback = loader_id.as_deref().and_then(|id| hierarchy.get(id));
                let result = reconstructor.reconstruct(frames, Some(seed), loader.or(fallback));

                if options.build_path && !result.nodes.is_empty() {
                    info!(
                        length = result.nodes.len(),
                        entry_point = %result.nodes[0].construct,
                        terminal = %construct,
                        "path constructed from stack trace"
                    );
                    state.path_queue.push_back(result.nodes);
                }
                if options.test_context {
                    if let Some(test_entry) = result.test_entry {
                        record.add_test_context(test_entry);
                    }
                }
            }
        }

        state.usage_queue.push_back(record);
        state.stats.count_collected(kind.construct_kind());
    }

    fn schedule_archive_analysis(&self, state: &mut CollectorState, path: &Path) {
        if state.submitted_archives.contains(path) {
            return;
        }
        let pool = match &state.pool {
            Some(pool) => pool.clone(),
            None => {
                let pool = Arc::new(AnalysisPool::new(
                    self.config.pool_size,
                    self.analyzer.clone(),
                ));
                state.pool = Some(pool.clone());
                pool
            }
        };
        state.submitted_archives.insert(path.to_path_buf());
        pool.submit(path.to_path_buf());
    }

    /// Drain queued paths (small fixed batch) and usage records (given
    /// batch, or everything when `batch_size` is `None`) to the backend.
    /// Delivery is at most once: dequeued items are never restored.
    pub fn upload_information(&self, exe: &ExecutionContext, batch_size: Option<usize>) {
        match batch_size {
            Some(n) => {
                self.upload_paths(exe, Some(PATH_BATCH_SIZE));
                self.upload_usage_records(exe, Some(n));
            }
            None => {
                self.upload_paths(exe, None);
                self.upload_usage_records(exe, None);
            }
        }
    }

    fn upload_paths(&self, exe: &ExecutionContext, batch_size: Option<usize>) {
        let mut state = self.state.lock().unwrap();
        if state.path_queue.is_empty() {
            info!("no paths collected");
            return;
        }
        let Some(app) = self.config.app_context.clone() else {
            error!("application context could not be determined, paths not uploaded");
            return;
        };

        info!(paths = state.path_queue.len(), "paths collected");

        let change_lists: ChangeLists = match self
            .backend
            .get_vulnerability_change_lists(exe, &app)
        {
            Ok(lists) => lists,
            Err(e) => {
                error!("error while reading vulnerability change lists: {e}");
                ChangeLists::new()
            }
        };

        // Group the drained batch by the vulnerability whose change list
        // contains the path's terminal construct.
        let mut paths_per_bug: HashMap<String, Vec<Vec<PathNode>>> = HashMap::new();
        let mut drained = 0usize;
        while let Some(path) = {
            if batch_size.is_some_and(|n| drained >= n) {
                None
            } else {
                state.path_queue.pop_front()
            }
        } {
            drained += 1;
            let Some(terminal) = path.last() else {
                continue;
            };
            let mut matched = false;
            for (bug, change_list) in &change_lists {
                if change_list.contains(&terminal.construct) {
                    info!(
                        bug = bug.as_str(),
                        length = path.len(),
                        terminal = %terminal.construct,
                        "path matches vulnerability change list"
                    );
                    paths_per_bug.entry(bug.clone()).or_default().push(path.clone());
                    matched = true;
                }
            }
            // Expected for most paths: traces are collected for all routines
            // of a type, not only for change list elements.
            if !matched {
                info!(
                    length = path.len(),
                    terminal = %terminal.construct,
                    "no vulnerability for path, dropped"
                );
            }
        }

        for (bug, paths) in paths_per_bug {
            let payloads: Vec<PathPayload> = paths
                .iter()
                .map(|path| PathPayload {
                    app: app.clone(),
                    bug: bug.clone(),
                    execution_id: exe.execution_id.clone(),
                    source: PATH_SOURCE_TRACED,
                    path: path
                        .iter()
                        .map(|node| {
                            let mut payload = PathNodePayload::from_node(node);
                            if payload.lib.is_none() {
                                payload.lib = Self::digest_for_construct(&state, &node.construct);
                            }
                            payload
                        })
                        .collect(),
                })
                .collect();

            let json = match serde_json::to_string(&payloads) {
                Ok(json) => json,
                Err(e) => {
                    error!(bug = bug.as_str(), "error while serializing paths: {e}");
                    continue;
                }
            };
            info!(bug = bug.as_str(), paths = payloads.len(), "uploading paths");
            if let Err(e) = self.backend.upload_paths(exe, &app, &json) {
                // Batch already dequeued, lost by design.
                error!("error while uploading paths: {e}");
            }
        }
    }

    /// Digest of the archive a construct's declaring type was loaded from,
    /// if a loader knows the resource and its analysis already finished.
    fn digest_for_construct(state: &CollectorState, construct: &ConstructId) -> Option<String> {
        let type_name = construct.declaring_type_name()?;
        let pool = state.pool.as_ref()?;
        for loader in state.hierarchy.iter() {
            if let Some(resource) = loader.resource_of(type_name) {
                if let Some(info) = pool.result_for(&resource) {
                    return Some(info.digest);
                }
                warn!(
                    type_name,
                    resource = %resource.display(),
                    "archive digest not yet known, library reference omitted"
                );
                return None;
            }
        }
        None
    }

    fn upload_usage_records(&self, exe: &ExecutionContext, batch_size: Option<usize>) {
        let mut state = self.state.lock().unwrap();
        if state.usage_queue.is_empty() {
            info!("no usage records collected");
            return;
        }

        // Drain the batch, merging duplicate observations of the same
        // logical entry.
        let mut to_upload: HashMap<UsageKey, UsageRecord> = HashMap::new();
        while let Some(mut record) = {
            if batch_size.is_some_and(|n| to_upload.len() >= n) {
                None
            } else {
                state.usage_queue.pop_front()
            }
        } {
            if record.app_context().is_none() {
                match self.config.app_context.clone() {
                    Some(app) => record.set_app_context(app),
                    None => {
                        error!(construct = %record.construct(), "no application context, record dropped");
                        continue;
                    }
                }
            }
            record.set_execution_id(exe.execution_id.clone());

            match to_upload.entry(record.key()) {
                std::collections::hash_map::Entry::Occupied(mut e) => e.get_mut().merge(&record),
                std::collections::hash_map::Entry::Vacant(e) => {
                    e.insert(record);
                }
            }
        }

        let mut payloads = Vec::with_capacity(to_upload.len());
        for record in to_upload.values_mut() {
            if let Err(reason) = Self::complete_archive_data(&state, record) {
                // Dropped, not re-queued: the next callback for the
                // construct creates a fresh record.
                error!(construct = %record.construct(), "{reason}, record dropped");
                continue;
            }
            payloads.push(UsagePayload::from_record(record));
        }

        info!(
            prepared = payloads.len(),
            remaining = state.usage_queue.len(),
            "usage records prepared for upload"
        );

        if payloads.is_empty() {
            return;
        }
        let Some(app) = payloads
            .first()
            .and_then(|p| p.app.clone())
            .or_else(|| self.config.app_context.clone())
        else {
            error!("application context could not be determined, records dropped");
            return;
        };

        let json = match serde_json::to_string(&payloads) {
            Ok(json) => json,
            Err(e) => {
                error!("error while serializing usage records: {e}");
                return;
            }
        };
        if let Err(e) = self.backend.upload_usage_records(exe, &app, &json) {
            // At-most-once: the drained batch is not restored.
            error!("error while uploading usage records: {e}");
        }
    }

    /// Fill in digest and file name from a finished archive analysis.
    /// Records loaded from an archive whose analysis has not finished (or
    /// failed) are unusable.
    fn complete_archive_data(
        state: &CollectorState,
        record: &mut UsageRecord,
    ) -> Result<(), String> {
        let Some(resource) = record.origin_resource().cloned() else {
            return Ok(());
        };
        if record.archive_digest().is_some() && record.archive_file_name().is_some() {
            return Ok(());
        }
        let info = state
            .pool
            .as_ref()
            .and_then(|pool| pool.result_for(&resource))
            .ok_or_else(|| {
                format!(
                    "archive digest for [{}] not known",
                    resource.display()
                )
            })?;
        record.set_archive(info.digest, Some(info.file_name));
        Ok(())
    }

    /// Stop accepting archive analysis work and wait for outstanding tasks.
    pub fn await_completion(&self) {
        let pool = self.state.lock().unwrap().pool.clone();
        if let Some(pool) = pool {
            pool.shutdown_and_wait();
        }
    }

    /// Read-only snapshot of the collection counters.
    pub fn statistics(&self) -> TraceStatistics {
        let state = self.state.lock().unwrap();
        let mut stats = state.stats;
        stats.archives_analyzed = state
            .pool
            .as_ref()
            .map(|p| p.analyzed_count() as u64)
            .unwrap_or(0);
        stats
    }

    /// Number of usage records currently queued.
    pub fn pending_usage_records(&self) -> usize {
        self.state.lock().unwrap().usage_queue.len()
    }

    /// Number of paths currently queued.
    pub fn pending_paths(&self) -> usize {
        self.state.lock().unwrap().path_queue.len()
    }
}
