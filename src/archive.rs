//! Background archive analysis
//!
//! Constructs loaded from archives need their archive's digest before their
//! usage records can be serialized. Digest computation is expensive, so it
//! runs on a small worker pool off the application threads. Submission is
//! fire-and-forget: a failed or unfinished analysis is never retried, and
//! records still missing a digest at serialization time are dropped.

use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam::channel::{unbounded, Sender};
use sha2::{Digest, Sha256};
use tracing::{error, info, warn};

use crate::backend::BackendError;

/// How long one completion poll waits before re-logging.
const COMPLETION_POLL: Duration = Duration::from_secs(10);

/// Outcome of analyzing one archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveInfo {
    /// Hex-encoded content digest.
    pub digest: String,
    /// File name of the archive (no directory components).
    pub file_name: String,
}

/// Computes digest and file name for an on-disk archive. Runs on the worker
/// pool; implementations must tolerate concurrent calls.
pub trait ArchiveAnalyzer: Send + Sync {
    fn analyze_archive(&self, path: &Path) -> Result<ArchiveInfo, BackendError>;
}

/// Default analyzer hashing the raw archive bytes with SHA-256.
#[derive(Debug, Default)]
pub struct FileDigestAnalyzer;

impl ArchiveAnalyzer for FileDigestAnalyzer {
    fn analyze_archive(&self, path: &Path) -> Result<ArchiveInfo, BackendError> {
        let mut file = File::open(path).map_err(|e| BackendError::ArchiveAnalysis {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let mut hasher = Sha256::new();
        io::copy(&mut file, &mut hasher).map_err(|e| BackendError::ArchiveAnalysis {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(ArchiveInfo {
            digest: hex::encode(hasher.finalize()),
            file_name,
        })
    }
}

/// Fixed-size worker pool for archive analysis. Results accumulate in a
/// shared map read at serialization time.
pub struct AnalysisPool {
    sender: Mutex<Option<Sender<PathBuf>>>,
    pending: Arc<(Mutex<usize>, Condvar)>,
    results: Arc<Mutex<HashMap<PathBuf, ArchiveInfo>>>,
}

impl AnalysisPool {
    pub fn new(pool_size: usize, analyzer: Arc<dyn ArchiveAnalyzer>) -> Self {
        let (tx, rx) = unbounded::<PathBuf>();
        let pending = Arc::new((Mutex::new(0usize), Condvar::new()));
        let results = Arc::new(Mutex::new(HashMap::new()));

        for worker in 0..pool_size.max(1) {
            let rx = rx.clone();
            let analyzer = analyzer.clone();
            let pending = pending.clone();
            let results = results.clone();
            thread::Builder::new()
                .name(format!("archive-analysis-{worker}"))
                .spawn(move || {
                    for path in rx.iter() {
                        match analyzer.analyze_archive(&path) {
                            Ok(info) => {
                                results.lock().unwrap().insert(path, info);
                            }
                            Err(e) => error!("archive analysis failed: {e}"),
                        }
                        let (lock, cvar) = &*pending;
                        *lock.lock().unwrap() -= 1;
                        cvar.notify_all();
                    }
                })
                .expect("failed to spawn archive analysis worker");
        }

        Self {
            sender: Mutex::new(Some(tx)),
            pending,
            results,
        }
    }

    /// Schedule one archive for analysis. Returns false after shutdown.
    /// Deduplication per archive path is the caller's concern.
    pub fn submit(&self, path: PathBuf) -> bool {
        let sender = self.sender.lock().unwrap();
        match sender.as_ref() {
            Some(tx) => {
                *self.pending.0.lock().unwrap() += 1;
                // Unbounded channel, send only fails when all workers died.
                if tx.send(path).is_err() {
                    *self.pending.0.lock().unwrap() -= 1;
                    warn!("archive analysis pool unavailable, task dropped");
                    return false;
                }
                true
            }
            None => {
                warn!("archive analysis pool already shut down, task dropped");
                false
            }
        }
    }

    /// Finished analysis for the given archive, if any.
    pub fn result_for(&self, path: &Path) -> Option<ArchiveInfo> {
        self.results.lock().unwrap().get(path).cloned()
    }

    pub fn analyzed_count(&self) -> usize {
        self.results.lock().unwrap().len()
    }

    /// Stop accepting work and wait for outstanding analyses, re-logging on
    /// every poll timeout. Best effort: a poisoned counter aborts the wait
    /// and outstanding tasks may be lost.
    pub fn shutdown_and_wait(&self) {
        self.sender.lock().unwrap().take();

        let (lock, cvar) = &*self.pending;
        let mut pending = match lock.lock() {
            Ok(guard) => guard,
            Err(e) => {
                error!("interrupted while awaiting archive analysis completion: {e}");
                return;
            }
        };
        while *pending > 0 {
            let waited = match cvar.wait_timeout(pending, COMPLETION_POLL) {
                Ok((guard, timeout)) => {
                    pending = guard;
                    timeout
                }
                Err(e) => {
                    error!("interrupted while awaiting archive analysis completion: {e}");
                    return;
                }
            };
            if waited.timed_out() && *pending > 0 {
                info!(
                    outstanding = *pending,
                    "awaiting completion of archive analysis tasks"
                );
            }
        }
    }
}
