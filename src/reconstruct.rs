//! Call-path reconstruction from captured stack traces
//!
//! Turns a raw stack (innermost frame first) into an ordered path of
//! construct identifiers, outermost resolvable caller first. Overloaded
//! routines are disambiguated through the first-line numbers found in debug
//! metadata. Every resolution failure truncates the path at the failing
//! frame and keeps the suffix built so far; nothing here ever propagates an
//! error into the instrumented application.

use crate::construct::{ConstructId, Lang};
use crate::loader::{Loader, ResolveError, RoutineInfo};
use crate::stack::RawFrame;
use crate::usage::PathNode;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// Result of one reconstruction run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconstructedPath {
    /// Index 0 is the outermost resolvable caller; the last index is the
    /// construct the path was built for.
    pub nodes: Vec<PathNode>,
    /// Outermost test-entry construct seen while resolving, if any.
    pub test_entry: Option<ConstructId>,
}

/// Stack-trace to call-path transformer. Owns the process-wide caches: the
/// once-per-type missing-type log filter and the call-site memo used by
/// [`PathReconstructor::predecessor_of`].
pub struct PathReconstructor {
    lang: Lang,
    stop_at_test_entry: bool,
    /// Missing types already logged; resolution failures for these stay
    /// silent on repetition.
    missing_types_logged: HashSet<String>,
    /// Memoized per-call-site resolutions, negative results included.
    predecessors: HashMap<RawFrame, Option<ConstructId>>,
}

impl PathReconstructor {
    pub fn new(lang: Lang) -> Self {
        Self {
            lang,
            stop_at_test_entry: false,
            missing_types_logged: HashSet::new(),
            predecessors: HashMap::new(),
        }
    }

    /// Stop path construction at the first frame resolving to a test-entry
    /// construct, making it the path's first element.
    pub fn set_stop_at_test_entry(&mut self, stop: bool) {
        self.stop_at_test_entry = stop;
    }

    /// Transform a captured stack into a path. When `seed` is given it
    /// stands in for the innermost non-machinery frame, so the capture point
    /// never has to be re-resolved (and re-disambiguated).
    pub fn reconstruct(
        &mut self,
        frames: &[RawFrame],
        seed: Option<PathNode>,
        loader: Option<&Arc<Loader>>,
    ) -> ReconstructedPath {
        let mut nodes: Vec<PathNode> = Vec::new();
        let mut test_entry = None;
        let mut seed = seed;

        for frame in frames {
            // Skip the capture machinery in front of the first real frame.
            if nodes.is_empty() && frame.is_capture_machinery() {
                continue;
            }

            if nodes.is_empty() {
                if let Some(s) = seed.take() {
                    nodes.push(s);
                    continue;
                }
            }

            match self.resolve_frame(frame, loader) {
                Some(routine) => {
                    nodes.insert(0, PathNode::new(routine.construct.clone()));
                    if routine.test_entry {
                        // Later frames are further out, so the last hit is
                        // the outermost test entry.
                        test_entry = Some(routine.construct.clone());
                        if self.stop_at_test_entry {
                            debug!(
                                test_entry = %routine.construct,
                                "found test entry, stopping path construction"
                            );
                            break;
                        }
                        debug!(test_entry = %routine.construct, "found test entry");
                    }
                }
                None => break,
            }
        }

        debug!(
            frames = frames.len(),
            nodes = nodes.len(),
            "stack trace transformed into path"
        );

        ReconstructedPath { nodes, test_entry }
    }

    /// Resolve only the frame that called the capture point. Memoized by
    /// structural frame equality, so repeated queries for the same call site
    /// resolve once.
    pub fn predecessor_of(
        &mut self,
        frames: &[RawFrame],
        loader: Option<&Arc<Loader>>,
    ) -> Option<ConstructId> {
        let real: Vec<&RawFrame> = frames
            .iter()
            .skip_while(|f| f.is_capture_machinery())
            .collect();
        // Need at least the capture point, its caller, and one more frame to
        // be sure the caller is not itself an entry point.
        if real.len() < 3 {
            return None;
        }
        let caller = real[1];

        if let Some(cached) = self.predecessors.get(caller) {
            return cached.clone();
        }
        let resolved = self
            .resolve_frame(caller, loader)
            .map(|r| r.construct);
        self.predecessors.insert(caller.clone(), resolved.clone());
        resolved
    }

    /// Map one frame to the declared routine it points at, or `None` when
    /// path construction has to stop at this frame.
    fn resolve_frame(
        &mut self,
        frame: &RawFrame,
        loader: Option<&Arc<Loader>>,
    ) -> Option<RoutineInfo> {
        let Some(loader) = loader else {
            debug!(
                type_name = frame.type_name.as_str(),
                "no loader supplied, stopping path construction"
            );
            return None;
        };

        let info = match loader.resolve_type(&frame.type_name) {
            Ok(info) => info,
            Err(ResolveError::TypeNotFound(t)) => {
                // Log each missing type once; re-capture of the same broken
                // stack is common.
                if self.missing_types_logged.insert(t.clone()) {
                    warn!(
                        type_name = t.as_str(),
                        loader = loader.id(),
                        "type not found, stopping path construction"
                    );
                }
                return None;
            }
            Err(e) => {
                warn!("{e}, stopping path construction");
                return None;
            }
        };

        // Static initializers resolve uniquely even without metadata help.
        if frame.method_name == "<clinit>" {
            return Some(
                info.routines_named("<clinit>")
                    .first()
                    .map(|r| (*r).clone())
                    .unwrap_or_else(|| RoutineInfo {
                        construct: ConstructId::new(
                            self.lang,
                            crate::construct::ConstructKind::StaticInit,
                            format!("{}.<clinit>", frame.type_name),
                        ),
                        first_line: None,
                        test_entry: false,
                    }),
            );
        }

        let candidates = info.routines_named(&frame.method_name);
        match candidates.len() {
            0 => {
                warn!(
                    type_name = frame.type_name.as_str(),
                    method = frame.method_name.as_str(),
                    "type has no routine with this name, stopping path construction"
                );
                None
            }
            1 => Some(candidates[0].clone()),
            n => match self.pick_overload(frame, &candidates) {
                Some(r) => Some(r),
                None => {
                    warn!(
                        type_name = frame.type_name.as_str(),
                        method = frame.method_name.as_str(),
                        candidates = n,
                        "cannot disambiguate overloads, stopping path construction"
                    );
                    None
                }
            },
        }
    }

    /// Among same-named routines, pick the one whose first line is the
    /// largest value still at or before the frame's line. Falls back to the
    /// smallest known first line when the frame's line precedes them all.
    fn pick_overload(&self, frame: &RawFrame, candidates: &[&RoutineInfo]) -> Option<RoutineInfo> {
        let line = match frame.line {
            Some(line) => line,
            None => {
                warn!(
                    type_name = frame.type_name.as_str(),
                    method = frame.method_name.as_str(),
                    "frame has no line number info"
                );
                return None;
            }
        };

        let best = candidates
            .iter()
            .filter(|r| r.first_line.is_some_and(|fl| fl <= line))
            .max_by_key(|r| r.first_line);
        if let Some(r) = best {
            return Some((**r).clone());
        }

        // Off line tables happen; take the earliest declared overload and
        // note the anomaly.
        let fallback = candidates
            .iter()
            .filter(|r| r.first_line.is_some())
            .min_by_key(|r| r.first_line);
        if let Some(r) = fallback {
            debug!(
                type_name = frame.type_name.as_str(),
                method = frame.method_name.as_str(),
                line,
                "no overload starts at or before the frame line, taking the smallest first line"
            );
            return Some((**r).clone());
        }
        None
    }
}
