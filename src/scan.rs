//! Background folder scan with live, cancellable progress.
//!
//! A [`ScanController`] owns one job slot. [`start`](ScanController::start)
//! walks one folder, [`start_roots`](ScanController::start_roots) several,
//! then indexes changed files one at a time on a tokio task. Every state
//! change publishes a fresh immutable [`ScanSnapshot`]; readers get a
//! consistent copy without blocking the worker for longer than a pointer
//! swap.
//!
//! ```text
//! idle ──start──▶ running ──stop──▶ stopping ──▶ stopped
//!                    │
//!                    ├──▶ completed
//!                    └──▶ failed   (no readable root, or provider quota exhausted)
//! ```
//!
//! Stopping is cooperative: the flag is checked between files, so the
//! file being indexed finishes and everything indexed so far stays
//! committed. An exhausted embedding quota ends the scan the same way,
//! but as `failed`, since every later file would hit the same wall.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use knowledge_engine_core::chunk::{content_hash, ChunkParams};
use knowledge_engine_core::embedding::EmbeddingProvider;
use knowledge_engine_core::models::{document_id_for_path, IngestItem};
use knowledge_engine_core::store::Store;
use knowledge_engine_core::{EngineError, Result};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use walkdir::{DirEntry, WalkDir};

use crate::config::ScanConfig;
use crate::ingest::ingest_item;
use crate::sources::SourceRegistry;

/// Per-file durations kept for the remaining-time estimate.
const ETA_WINDOW: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    Idle,
    Running,
    Stopping,
    Stopped,
    Completed,
    Failed,
}

impl ScanStatus {
    pub fn is_active(self) -> bool {
        matches!(self, ScanStatus::Running | ScanStatus::Stopping)
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ScanStatus::Stopped | ScanStatus::Completed | ScanStatus::Failed
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanSnapshot {
    /// Incremented by every `start`.
    pub generation: u64,
    pub status: ScanStatus,
    pub roots: Vec<PathBuf>,
    /// Embedding provider captured at start.
    pub embedding_provider: Option<String>,
    pub total_files: usize,
    pub processed_files: usize,
    pub current_file: Option<String>,
    pub files_indexed: usize,
    pub files_unchanged: usize,
    pub errors: usize,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub estimated_remaining_seconds: Option<u64>,
    pub message: Option<String>,
}

impl ScanSnapshot {
    fn idle() -> Self {
        Self {
            generation: 0,
            status: ScanStatus::Idle,
            roots: Vec::new(),
            embedding_provider: None,
            total_files: 0,
            processed_files: 0,
            current_file: None,
            files_indexed: 0,
            files_unchanged: 0,
            errors: 0,
            started_at: None,
            finished_at: None,
            estimated_remaining_seconds: None,
            message: None,
        }
    }

    pub fn progress_percent(&self) -> f64 {
        if self.total_files == 0 {
            if self.status == ScanStatus::Completed {
                100.0
            } else {
                0.0
            }
        } else {
            self.processed_files as f64 * 100.0 / self.total_files as f64
        }
    }
}

/// One folder to walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRoot {
    pub path: PathBuf,
    pub recursive: bool,
}

/// Everything a scan needs, captured when it starts.
#[derive(Clone)]
pub struct ScanJob {
    pub store: Arc<dyn Store>,
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub params: ChunkParams,
    pub batch_size: usize,
    pub config: ScanConfig,
    /// Receives per-folder results once a folder is fully processed.
    pub sources: Option<Arc<SourceRegistry>>,
}

struct Shared {
    snapshot: RwLock<Arc<ScanSnapshot>>,
    stop: AtomicBool,
}

impl Shared {
    fn current(&self) -> Arc<ScanSnapshot> {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Apply `f` to a copy of the snapshot of `generation` and publish it.
    /// Updates from an overwritten generation are dropped.
    fn update(&self, generation: u64, f: impl FnOnce(&mut ScanSnapshot)) {
        let mut guard = self
            .snapshot
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if guard.generation != generation {
            return;
        }
        let mut next = (**guard).clone();
        f(&mut next);
        *guard = Arc::new(next);
    }
}

pub struct ScanController {
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Default for ScanController {
    fn default() -> Self {
        Self::new()
    }
}

impl ScanController {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                snapshot: RwLock::new(Arc::new(ScanSnapshot::idle())),
                stop: AtomicBool::new(false),
            }),
            handle: Mutex::new(None),
        }
    }

    /// Start scanning `root` and return the new generation.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// [`EngineError::ScanInProgress`] while another scan is running or
    /// stopping.
    pub fn start(&self, root: impl Into<PathBuf>, job: ScanJob) -> Result<u64> {
        let root = ScanRoot {
            path: root.into(),
            recursive: job.config.recursive,
        };
        self.start_roots(vec![root], job)
    }

    /// Start one scan over several folders. Files are discovered for all
    /// of them first, so `total_files` covers the whole job.
    ///
    /// # Errors
    ///
    /// [`EngineError::ScanInProgress`] as for [`start`](Self::start), and
    /// [`EngineError::InvalidInput`] when `roots` is empty.
    pub fn start_roots(&self, roots: Vec<ScanRoot>, job: ScanJob) -> Result<u64> {
        if roots.is_empty() {
            return Err(EngineError::InvalidInput(
                "no folders to scan".to_string(),
            ));
        }
        let generation = {
            let mut guard = self
                .shared
                .snapshot
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if guard.status.is_active() {
                return Err(EngineError::ScanInProgress);
            }
            let generation = guard.generation + 1;
            *guard = Arc::new(ScanSnapshot {
                generation,
                status: ScanStatus::Running,
                roots: roots.iter().map(|r| r.path.clone()).collect(),
                embedding_provider: Some(job.embedder.descriptor().id.clone()),
                started_at: Some(Utc::now()),
                message: Some("Discovering files".to_string()),
                ..ScanSnapshot::idle()
            });
            self.shared.stop.store(false, Ordering::SeqCst);
            generation
        };

        info!(generation, roots = roots.len(), first = %roots[0].path.display(), "scan started");
        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(run_scan(shared, generation, roots, job));
        *self.handle.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(generation)
    }

    /// Request a cooperative stop. Returns false when nothing is running.
    pub fn stop(&self) -> bool {
        let mut requested = false;
        let generation = self.shared.current().generation;
        let stop = &self.shared.stop;
        self.shared.update(generation, |s| {
            if s.status == ScanStatus::Running {
                s.status = ScanStatus::Stopping;
                s.message = Some("Stopping after the current file".to_string());
                stop.store(true, Ordering::SeqCst);
                requested = true;
            }
        });
        if requested {
            info!(generation, "scan stop requested");
        }
        requested
    }

    /// Point-in-time copy of the current job state.
    pub fn status(&self) -> Arc<ScanSnapshot> {
        self.shared.current()
    }

    pub fn is_running(&self) -> bool {
        self.status().status.is_active()
    }

    /// Wait for the current job, if any, and return the final snapshot.
    pub async fn wait(&self) -> Arc<ScanSnapshot> {
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "scan task ended abnormally");
            }
        }
        self.status()
    }
}

enum FileOutcome {
    Indexed,
    Unchanged,
}

async fn run_scan(shared: Arc<Shared>, generation: u64, roots: Vec<ScanRoot>, job: ScanJob) {
    let walk_roots = roots.clone();
    let walk_config = job.config.clone();
    let discovered =
        tokio::task::spawn_blocking(move || discover_roots(&walk_roots, &walk_config)).await;

    let Discovery { files, unreadable } = match discovered {
        Ok(Ok(discovery)) => discovery,
        Ok(Err(e)) => return fail(&shared, generation, format!("{e:#}")),
        Err(e) => return fail(&shared, generation, format!("file discovery panicked: {e}")),
    };

    let total = files.len();
    debug!(generation, total, unreadable = unreadable.len(), "files discovered");
    shared.update(generation, |s| {
        s.total_files = total;
        s.errors = unreadable.len();
        if s.status == ScanStatus::Running {
            s.message = Some(format!("Indexing {total} files"));
        }
    });

    let mut pending = vec![0usize; roots.len()];
    for (root, _) in &files {
        pending[*root] += 1;
    }
    let empty: Vec<usize> = (0..roots.len())
        .filter(|r| pending[*r] == 0 && !unreadable.contains(r))
        .collect();
    let mut settled = vec![0usize; roots.len()];
    let mut durations: VecDeque<Duration> = VecDeque::with_capacity(ETA_WINDOW);
    let mut stopped = false;

    for (i, (root, path)) in files.iter().enumerate() {
        if shared.stop.load(Ordering::SeqCst) {
            stopped = true;
            break;
        }

        let file = path.display().to_string();
        shared.update(generation, |s| s.current_file = Some(file.clone()));

        let started = Instant::now();
        let outcome = index_file(path, &job).await;
        if durations.len() == ETA_WINDOW {
            durations.pop_front();
        }
        durations.push_back(started.elapsed());

        let remaining = total - (i + 1);
        let eta = estimate_remaining(&durations, remaining);

        shared.update(generation, |s| {
            match &outcome {
                Ok(FileOutcome::Indexed) => s.files_indexed += 1,
                Ok(FileOutcome::Unchanged) => s.files_unchanged += 1,
                Err(_) => s.errors += 1,
            }
            s.processed_files = i + 1;
            s.estimated_remaining_seconds = Some(eta);
        });

        pending[*root] -= 1;
        match outcome {
            Ok(_) => settled[*root] += 1,
            Err(e) => {
                warn!(file = %file, error = %e, "failed to index file");
                if e.is_quota() {
                    return fail(
                        &shared,
                        generation,
                        format!("Embedding quota exhausted, switch provider and rescan: {e}"),
                    );
                }
            }
        }
        if pending[*root] == 0 {
            record_root(&job, &roots[*root], settled[*root]);
        }
    }
    if !stopped {
        for r in empty {
            record_root(&job, &roots[r], 0);
        }
    }

    let finished = Utc::now();
    shared.update(generation, |s| {
        s.current_file = None;
        s.finished_at = Some(finished);
        s.estimated_remaining_seconds = Some(0);
        if stopped {
            s.status = ScanStatus::Stopped;
            s.message = Some(format!(
                "Stopped after {} of {} files",
                s.processed_files, s.total_files
            ));
        } else {
            s.status = ScanStatus::Completed;
            s.message = Some(format!(
                "Indexed {}, unchanged {}, errors {}",
                s.files_indexed, s.files_unchanged, s.errors
            ));
        }
    });

    let last = shared.current();
    info!(
        generation,
        status = ?last.status,
        processed = last.processed_files,
        indexed = last.files_indexed,
        unchanged = last.files_unchanged,
        errors = last.errors,
        "scan finished"
    );
}

fn record_root(job: &ScanJob, root: &ScanRoot, file_count: usize) {
    if let Some(sources) = &job.sources {
        sources.record_scan(&root.path, file_count);
    }
}

#[derive(Debug)]
struct Discovery {
    /// `(root index, file)`, grouped by root in the given order.
    files: Vec<(usize, PathBuf)>,
    /// Indices of roots that could not be enumerated.
    unreadable: Vec<usize>,
}

/// Enumerate every root. A single unreadable root is skipped with a
/// warning; the job fails only when no root can be enumerated.
fn discover_roots(roots: &[ScanRoot], config: &ScanConfig) -> anyhow::Result<Discovery> {
    let mut discovery = Discovery {
        files: Vec::new(),
        unreadable: Vec::new(),
    };
    let mut first_error = None;
    for (r, root) in roots.iter().enumerate() {
        let root_config = ScanConfig {
            recursive: root.recursive,
            ..config.clone()
        };
        match discover_files(&root.path, &root_config) {
            Ok(files) => discovery.files.extend(files.into_iter().map(|f| (r, f))),
            Err(e) => {
                warn!(root = %root.path.display(), error = %format!("{e:#}"), "cannot enumerate folder");
                discovery.unreadable.push(r);
                first_error.get_or_insert(e);
            }
        }
    }
    match first_error {
        Some(e) if discovery.unreadable.len() == roots.len() => Err(e),
        _ => Ok(discovery),
    }
}

fn fail(shared: &Shared, generation: u64, message: String) {
    warn!(generation, error = %message, "scan failed");
    shared.update(generation, |s| {
        s.status = ScanStatus::Failed;
        s.current_file = None;
        s.finished_at = Some(Utc::now());
        s.estimated_remaining_seconds = None;
        s.message = Some(message);
    });
}

/// Mean of the recent per-file times multiplied by the files left.
fn estimate_remaining(recent: &VecDeque<Duration>, remaining: usize) -> u64 {
    if recent.is_empty() || remaining == 0 {
        return 0;
    }
    let mean = recent.iter().sum::<Duration>().as_secs_f64() / recent.len() as f64;
    (mean * remaining as f64).round() as u64
}

async fn index_file(path: &Path, job: &ScanJob) -> Result<FileOutcome> {
    let bytes = tokio::fs::read(path).await?;
    let hash = content_hash(&bytes);
    let source_path = path.to_string_lossy().to_string();
    let active = job.embedder.descriptor();

    if let Some(doc) = job.store.find_by_source_path(&source_path).await? {
        if doc.content_hash == hash
            && !job.store.document_has_stale_chunks(&doc.id, active).await?
        {
            return Ok(FileOutcome::Unchanged);
        }
    }

    let text = String::from_utf8(bytes)
        .map_err(|_| EngineError::InvalidInput(format!("{source_path} is not valid UTF-8")))?;

    let meta = tokio::fs::metadata(path).await?;
    let modified = meta
        .modified()
        .ok()
        .and_then(|m| m.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64);

    let item = IngestItem {
        document_id: Some(document_id_for_path(&source_path)),
        source_path: source_path.clone(),
        doc_type: path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_else(|| "txt".to_string()),
        title: path.file_stem().map(|s| s.to_string_lossy().to_string()),
        metadata: serde_json::json!({
            "file_size": meta.len(),
            "modified": modified,
        }),
        content_hash: Some(hash),
        created_at: modified.or_else(|| Some(unix_now())),
        text,
    };

    ingest_item(
        job.store.as_ref(),
        job.embedder.as_ref(),
        &job.params,
        job.batch_size,
        item,
    )
    .await?;
    Ok(FileOutcome::Indexed)
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Walk `root` and return the indexable files, sorted by path.
///
/// Hidden entries and `skip_dirs` are never descended into; files must
/// match an include glob, no exclude glob, and fit `max_file_bytes`.
pub fn discover_files(root: &Path, config: &ScanConfig) -> anyhow::Result<Vec<PathBuf>> {
    let meta = std::fs::metadata(root)
        .with_context(|| format!("Cannot read scan root {}", root.display()))?;
    if !meta.is_dir() {
        anyhow::bail!("Scan root is not a directory: {}", root.display());
    }

    let include_set = build_globset(&config.include_globs)?;
    let exclude_set = build_globset(&config.exclude_globs)?;

    let mut walker = WalkDir::new(root).follow_links(config.follow_symlinks);
    if !config.recursive {
        walker = walker.max_depth(1);
    }

    let mut files = Vec::new();
    let entries = walker
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_skipped(e, &config.skip_dirs));
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if e.depth() == 0 => {
                return Err(e).with_context(|| format!("Cannot walk {}", root.display()))
            }
            Err(e) => {
                debug!(error = %e, "skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        if exclude_set.is_match(relative) || !include_set.is_match(relative) {
            continue;
        }
        match entry.metadata() {
            Ok(m) if m.len() <= config.max_file_bytes => files.push(path.to_path_buf()),
            Ok(m) => debug!(file = %path.display(), bytes = m.len(), "skipping large file"),
            Err(e) => debug!(file = %path.display(), error = %e, "skipping unreadable file"),
        }
    }

    files.sort();
    Ok(files)
}

fn is_skipped(entry: &DirEntry, skip_dirs: &[String]) -> bool {
    let name = entry.file_name().to_string_lossy();
    name.starts_with('.') || (entry.file_type().is_dir() && skip_dirs.iter().any(|d| *d == name))
}

fn build_globset(patterns: &[String]) -> anyhow::Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("Invalid glob: {pattern}"))?);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_discover_skips_hidden_junk_and_large() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::write(root.join("b.md"), "b").unwrap();
        fs::write(root.join("a.txt"), "a").unwrap();
        fs::write(root.join("image.png"), "png").unwrap();
        fs::write(root.join(".secret.md"), "hidden").unwrap();
        fs::create_dir_all(root.join("node_modules/pkg")).unwrap();
        fs::write(root.join("node_modules/pkg/readme.md"), "junk").unwrap();
        fs::create_dir_all(root.join("notes/deep")).unwrap();
        fs::write(root.join("notes/deep/c.md"), "c").unwrap();
        fs::write(root.join("big.md"), "x".repeat(2048)).unwrap();

        let config = ScanConfig {
            max_file_bytes: 1024,
            ..ScanConfig::default()
        };
        let files = discover_files(root, &config).unwrap();
        let names: Vec<String> = files
            .iter()
            .map(|p| p.strip_prefix(root).unwrap().to_string_lossy().replace('\\', "/"))
            .collect();
        assert_eq!(names, vec!["a.txt", "b.md", "notes/deep/c.md"]);
    }

    #[test]
    fn test_discover_top_level_only_and_excludes() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::write(root.join("keep.md"), "k").unwrap();
        fs::write(root.join("draft.md"), "d").unwrap();
        fs::create_dir_all(root.join("sub")).unwrap();
        fs::write(root.join("sub/nested.md"), "n").unwrap();

        let config = ScanConfig {
            recursive: false,
            exclude_globs: vec!["draft.*".to_string()],
            ..ScanConfig::default()
        };
        let files = discover_files(root, &config).unwrap();
        assert_eq!(files, vec![root.join("keep.md")]);
    }

    #[test]
    fn test_discover_missing_root_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = discover_files(&dir.path().join("missing"), &ScanConfig::default()).unwrap_err();
        assert!(err.to_string().contains("Cannot read scan root"));
    }

    #[test]
    fn test_discover_roots_skips_an_unreadable_folder() {
        let dir = tempfile::tempdir().unwrap();
        let flat = dir.path().join("flat");
        fs::create_dir_all(flat.join("sub")).unwrap();
        fs::write(flat.join("top.md"), "t").unwrap();
        fs::write(flat.join("sub/deep.md"), "d").unwrap();
        let roots = vec![
            ScanRoot {
                path: dir.path().join("missing"),
                recursive: true,
            },
            ScanRoot {
                path: flat.clone(),
                recursive: false,
            },
        ];

        let found = discover_roots(&roots, &ScanConfig::default()).unwrap();
        assert_eq!(found.files, vec![(1, flat.join("top.md"))]);
        assert_eq!(found.unreadable, vec![0]);

        let err = discover_roots(&roots[..1], &ScanConfig::default()).unwrap_err();
        assert!(err.to_string().contains("Cannot read scan root"));
    }

    #[test]
    fn test_estimate_remaining() {
        let mut recent = VecDeque::new();
        assert_eq!(estimate_remaining(&recent, 10), 0);
        recent.push_back(Duration::from_secs(1));
        recent.push_back(Duration::from_secs(3));
        assert_eq!(estimate_remaining(&recent, 5), 10);
        assert_eq!(estimate_remaining(&recent, 0), 0);
    }

    #[test]
    fn test_progress_percent() {
        let mut s = ScanSnapshot::idle();
        assert_eq!(s.progress_percent(), 0.0);
        s.total_files = 4;
        s.processed_files = 1;
        assert_eq!(s.progress_percent(), 25.0);
        let mut done = ScanSnapshot::idle();
        done.status = ScanStatus::Completed;
        assert_eq!(done.progress_percent(), 100.0);
    }

    fn job() -> ScanJob {
        ScanJob {
            store: Arc::new(knowledge_engine_core::store::memory::InMemoryStore::new()),
            embedder: Arc::new(crate::embedding::HashEmbedder::new(16).unwrap()),
            params: ChunkParams::new(512, 50).unwrap(),
            batch_size: 8,
            config: ScanConfig::default(),
            sources: None,
        }
    }

    #[tokio::test]
    async fn test_stop_flag_only_follows_a_running_scan() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..3 {
            fs::write(dir.path().join(format!("n{i}.md")), format!("note {i}")).unwrap();
        }
        let controller = ScanController::new();

        controller.start(dir.path(), job()).unwrap();
        assert_eq!(controller.wait().await.status, ScanStatus::Completed);
        assert!(!controller.stop());
        assert!(!controller.shared.stop.load(Ordering::SeqCst));

        let generation = controller.start(dir.path(), job()).unwrap();
        let last = controller.wait().await;
        assert_eq!(last.generation, generation);
        assert_eq!(last.status, ScanStatus::Completed);
        assert_eq!(last.processed_files, 3);
    }

    #[test]
    fn test_start_roots_rejects_empty() {
        let controller = ScanController::new();
        assert!(matches!(
            controller.start_roots(Vec::new(), job()),
            Err(EngineError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_stop_without_scan_is_noop() {
        let controller = ScanController::new();
        assert!(!controller.stop());
        assert_eq!(controller.status().status, ScanStatus::Idle);
    }
}
