//! Boundary facade that wires the engine together.
//!
//! `SessionMonitor` owns the registry, the search index and the publisher.
//! `start_watch` adds the moving parts: a worker pool that runs log passes,
//! the directory watcher feeding it, a status tick thread, and scans.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::config::MonitorConfig;
use crate::error::{IndexError, LogError, MonitorError, WatchError};
use crate::highlight::truncate_to_bytes;
use crate::log_reader;
use crate::metadata;
use crate::parser::truncate_string;
use crate::process::ProcessProbe;
use crate::publisher::{MonitorEvent, Publisher, Subscription, SubscriptionId, WatchFailure};
use crate::registry::{SessionRegistry, StatusContext};
use crate::search::{self, IndexStats, SearchHit, SearchIndex, SearchQuery};
use crate::session::{
    ContentType, ConversationEntry, EntryKind, Role, Session, SessionFilter, SessionSummary,
};
use crate::watcher::{self, PathKind, WatchHandle, WatchOptions, WatchSink};
use crate::worker::WorkerPool;

/// Thinking blocks are cut to this many chars in `get_conversation`.
const THINKING_DISPLAY_CHARS: usize = 300;
/// Cap on the text one session contributes to the content index.
const SEARCH_TEXT_MAX_BYTES: usize = 4096;

#[derive(Default)]
struct ScanState {
    running: bool,
    /// A scan was requested while one was running.
    again: bool,
}

struct Engine {
    config: MonitorConfig,
    registry: SessionRegistry,
    index: RwLock<SearchIndex>,
    publisher: Publisher,
    probe: Box<dyn ProcessProbe>,
    /// Last probe result, refreshed on every status tick.
    active_paths: RwLock<Option<HashSet<String>>>,
    scan_state: Mutex<ScanState>,
    /// Per-session upserts are held back while a scan runs; the scan ends
    /// with a bulk refresh instead.
    scanning: AtomicBool,
    content_running: AtomicBool,
    stopping: AtomicBool,
}

impl Engine {
    fn status_context(&self) -> StatusContext {
        let active = match self.active_paths.read() {
            Ok(active) => active.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        StatusContext::new(self.config.liveness_threshold(), active)
    }

    fn refresh_active_paths(&self) {
        let active = if self.config.track_processes {
            self.probe.active_paths()
        } else {
            None
        };
        match self.active_paths.write() {
            Ok(mut slot) => *slot = active,
            Err(poisoned) => *poisoned.into_inner() = active,
        }
    }

    /// One worker pass for a changed path.
    fn process_path(&self, path: &Path) {
        match watcher::classify(path, self.config.include_subagents) {
            PathKind::SessionLog => self.refresh_log(path),
            PathKind::SessionsIndex => self.reload_hints(path),
            PathKind::Irrelevant => {}
        }
    }

    fn refresh_log(&self, path: &Path) {
        // A log that vanished before we ever saw it leaves nothing behind
        if !path.exists() && matches!(self.registry.get(path), Ok(None)) {
            return;
        }
        match self.registry.ingest(path, &self.status_context()) {
            Ok(Some(session)) => self.commit(session),
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to refresh session");
            }
        }
    }

    fn reload_hints(&self, index_path: &Path) {
        let Some(project_dir) = index_path.parent() else {
            return;
        };
        let hints = metadata::load_project_hints(project_dir);
        tracing::debug!(path = %index_path.display(), hints = hints.len(), "reloaded sessions index");
        match self.registry.apply_hints(hints) {
            Ok(changed) => changed.into_iter().for_each(|s| self.commit(s)),
            Err(e) => tracing::error!(error = %e, "failed to apply session hints"),
        }
    }

    /// Index a changed record and tell subscribers about it.
    fn commit(&self, session: Session) {
        match self.index.write() {
            Ok(mut index) => {
                if let Err(e) = index.index_metadata(&session) {
                    tracing::warn!(path = %session.log_path.display(), error = %e, "failed to index session");
                }
            }
            Err(_) => tracing::error!("search index lock poisoned"),
        }
        if !self.scanning.load(Ordering::SeqCst) {
            self.publisher.publish_upsert(session);
        }
    }

    fn tick(&self) {
        self.refresh_active_paths();
        match self.registry.recompute_statuses(&self.status_context()) {
            Ok(changed) => {
                for session in changed {
                    tracing::debug!(
                        path = %session.log_path.display(),
                        status = session.status.label(),
                        "status changed on tick"
                    );
                    self.publisher.publish_upsert(session);
                }
            }
            Err(e) => tracing::error!(error = %e, "status tick failed"),
        }
    }

    /// Run a scan now, or after the running one finishes.
    fn request_scan(self: &Arc<Self>, pool: &Arc<WorkerPool>) {
        {
            let mut state = match self.scan_state.lock() {
                Ok(state) => state,
                Err(poisoned) => poisoned.into_inner(),
            };
            if state.running {
                state.again = true;
                return;
            }
            state.running = true;
        }

        let engine = Arc::clone(self);
        let pool = Arc::clone(pool);
        let spawned = std::thread::Builder::new()
            .name("session-scan".to_string())
            .spawn(move || loop {
                let result = engine.scan(&pool);
                engine.scanning.store(false, Ordering::SeqCst);
                if let Err(e) = result {
                    tracing::error!(error = %e, "scan failed");
                }

                let mut state = match engine.scan_state.lock() {
                    Ok(state) => state,
                    Err(poisoned) => poisoned.into_inner(),
                };
                if state.again && !engine.stopping.load(Ordering::SeqCst) {
                    state.again = false;
                    continue;
                }
                state.running = false;
                state.again = false;
                break;
            });

        if let Err(e) = spawned {
            tracing::error!(error = %e, "failed to spawn scan thread");
            if let Ok(mut state) = self.scan_state.lock() {
                state.running = false;
            }
        }
    }

    fn scan(&self, pool: &WorkerPool) -> Result<(), MonitorError> {
        let root = &self.config.projects_dir;
        tracing::info!(root = %root.display(), "scanning projects directory");
        self.scanning.store(true, Ordering::SeqCst);

        self.publisher.publish_progress("discovering", 0, 0);
        let logs = watcher::scan_logs(
            root,
            self.config.scan_max_depth,
            self.config.include_subagents,
        );
        self.publisher
            .publish_progress("discovering", logs.len(), logs.len());

        self.publisher.publish_progress("loading_metadata", 0, 1);
        let hints = metadata::load_all_hints(root);
        let hint_count = hints.len();
        for session in self.registry.apply_hints(hints)? {
            self.commit(session);
        }
        self.publisher.publish_progress("loading_metadata", 1, 1);

        // Sessions whose file disappeared while nobody was watching
        let found: HashSet<&PathBuf> = logs.iter().collect();
        let mut vanished = 0usize;
        for path in self.registry.paths()? {
            if !found.contains(&path) && !path.exists() {
                pool.schedule(&path);
                vanished += 1;
            }
        }

        let total = logs.len();
        let mut done = 0;
        self.publisher.publish_progress("indexing", done, total);
        for batch in logs.chunks(self.config.scan_batch_size.max(1)) {
            if self.stopping.load(Ordering::SeqCst) {
                tracing::debug!(done, total, "scan interrupted by shutdown");
                return Ok(());
            }
            for path in batch {
                pool.schedule(path);
            }
            if !self.wait_for_pool(pool) {
                return Ok(());
            }
            done += batch.len();
            self.publisher.publish_progress("indexing", done, total);
        }
        if !self.wait_for_pool(pool) {
            return Ok(());
        }

        self.scanning.store(false, Ordering::SeqCst);
        let snapshot = self.registry.snapshot()?;
        tracing::info!(
            logs = total,
            sessions = snapshot.len(),
            hints = hint_count,
            vanished,
            "scan finished"
        );
        self.publisher.publish_refresh(snapshot);
        Ok(())
    }

    /// Wait for queued passes. False when shutdown started first.
    fn wait_for_pool(&self, pool: &WorkerPool) -> bool {
        while !pool.wait_idle(Duration::from_millis(100)) {
            if self.stopping.load(Ordering::SeqCst) {
                return false;
            }
        }
        true
    }
}

/// Feeds watcher output into the worker pool.
struct MonitorSink {
    engine: Arc<Engine>,
    pool: Arc<WorkerPool>,
}

impl WatchSink for MonitorSink {
    fn paths_changed(&self, paths: Vec<PathBuf>) {
        let include_subagents = self.engine.config.include_subagents;
        for path in paths {
            match watcher::classify(&path, include_subagents) {
                PathKind::SessionLog | PathKind::SessionsIndex => {
                    self.pool.schedule(&path);
                }
                PathKind::Irrelevant if !path.exists() => {
                    // A removed directory takes its logs with it
                    let known = self.engine.registry.paths().unwrap_or_default();
                    for log in known.iter().filter(|log| log.starts_with(&path)) {
                        self.pool.schedule(log);
                    }
                }
                PathKind::Irrelevant => {}
            }
        }
    }

    fn events_lost(&self, reason: &str) {
        tracing::warn!(reason, "watch events lost, rescanning");
        self.engine.request_scan(&self.pool);
    }

    fn setup_failed(&self, error: &WatchError) {
        let WatchError::SetupFailed {
            path,
            attempts,
            reason,
        } = error;
        self.engine
            .publisher
            .publish(MonitorEvent::WatchFailed(WatchFailure {
                root: path.clone(),
                attempts: *attempts,
                reason: reason.clone(),
            }));
    }

    fn setup_recovered(&self) {
        self.engine.request_scan(&self.pool);
    }
}

/// Threads that exist only between `start_watch` and `shutdown`.
struct Runtime {
    pool: Arc<WorkerPool>,
    watch: WatchHandle,
    tick_stop: Sender<()>,
    tick: JoinHandle<()>,
}

/// Embeddable session monitor.
///
/// Queries work before `start_watch`; they see whatever has been ingested.
pub struct SessionMonitor {
    engine: Arc<Engine>,
    runtime: Mutex<Option<Runtime>>,
}

impl SessionMonitor {
    pub fn new(config: MonitorConfig, probe: Box<dyn ProcessProbe>) -> Result<Self, MonitorError> {
        let registry = SessionRegistry::new(config.tail_capacity);
        let index = SearchIndex::new()?;
        Ok(Self {
            engine: Arc::new(Engine {
                config,
                registry,
                index: RwLock::new(index),
                publisher: Publisher::new(),
                probe,
                active_paths: RwLock::new(None),
                scan_state: Mutex::new(ScanState::default()),
                scanning: AtomicBool::new(false),
                content_running: AtomicBool::new(false),
                stopping: AtomicBool::new(false),
            }),
            runtime: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.engine.config
    }

    /// Start watching the projects directory. A second call is a no-op.
    pub fn start_watch(&self) -> Result<(), MonitorError> {
        let mut runtime = self.runtime.lock().map_err(|_| MonitorError::RegistryPoisoned)?;
        if runtime.is_some() {
            return Ok(());
        }

        let engine = &self.engine;
        engine.stopping.store(false, Ordering::SeqCst);
        engine.refresh_active_paths();

        let worker_engine = Arc::clone(engine);
        let pool = Arc::new(WorkerPool::new(engine.config.worker_threads, move |path| {
            worker_engine.process_path(path)
        })?);

        let sink = Arc::new(MonitorSink {
            engine: Arc::clone(engine),
            pool: Arc::clone(&pool),
        });
        let watch = watcher::spawn_watch(WatchOptions::from_config(&engine.config), sink)?;

        let (tick_stop, tick_rx) = mpsc::channel::<()>();
        let tick_engine = Arc::clone(engine);
        let interval = engine.config.status_tick();
        let name = "status-tick".to_string();
        let tick = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || loop {
                match tick_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => tick_engine.tick(),
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })
            .map_err(|source| MonitorError::Spawn { name, source })?;

        engine.request_scan(&pool);
        tracing::info!(
            root = %engine.config.projects_dir.display(),
            workers = pool.threads(),
            "session monitor started"
        );

        *runtime = Some(Runtime {
            pool,
            watch,
            tick_stop,
            tick,
        });
        Ok(())
    }

    /// Stop the watcher and background threads. Records stay queryable.
    pub fn shutdown(&self) {
        let runtime = match self.runtime.lock() {
            Ok(mut runtime) => runtime.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(mut runtime) = runtime else {
            return;
        };

        self.engine.stopping.store(true, Ordering::SeqCst);
        runtime.watch.stop();
        let _ = runtime.tick_stop.send(());
        if runtime.tick.join().is_err() {
            tracing::error!("status tick thread panicked");
        }
        // Workers exit once the last pool handle is gone
        drop(runtime.pool);
        tracing::info!("session monitor stopped");
    }

    pub fn is_running(&self) -> bool {
        self.runtime.lock().map(|r| r.is_some()).unwrap_or(false)
    }

    pub fn subscribe(&self) -> Subscription {
        self.engine.publisher.subscribe()
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.engine.publisher.unsubscribe(id)
    }

    /// Every known record, archived ones included.
    pub fn snapshot(&self) -> Result<Vec<Session>, MonitorError> {
        self.engine.registry.snapshot()
    }

    /// Summaries of matching records, most recently active first.
    pub fn list_sessions(&self, filter: &SessionFilter) -> Result<Vec<SessionSummary>, MonitorError> {
        let mut sessions: Vec<SessionSummary> = self
            .engine
            .registry
            .snapshot()?
            .iter()
            .filter(|s| filter.matches(s))
            .map(Session::summary_view)
            .collect();
        sessions.sort_by(|a, b| {
            // None sorts last
            b.last_modified
                .cmp(&a.last_modified)
                .then_with(|| a.log_path.cmp(&b.log_path))
        });
        Ok(sessions)
    }

    pub fn get_session_detail(&self, log_path: &Path) -> Result<Session, MonitorError> {
        self.engine
            .registry
            .get(log_path)?
            .ok_or_else(|| MonitorError::UnknownSession(log_path.to_path_buf()))
    }

    /// Every message entry of a session, read fresh from the start of its log.
    pub fn get_conversation(&self, log_path: &Path) -> Result<Vec<ConversationEntry>, MonitorError> {
        self.get_session_detail(log_path)?;
        let batch = log_reader::read_new(log_path, 0)?;
        Ok(batch
            .entries
            .into_iter()
            .filter(|e| e.kind == EntryKind::Message)
            .map(truncate_thinking)
            .collect())
    }

    /// Search text for a batch of sessions. Fails only when no session in a
    /// non-empty batch could be read.
    pub fn get_search_text(&self, paths: &[PathBuf]) -> Result<Vec<(PathBuf, String)>, IndexError> {
        collect_search_text(paths)
    }

    pub fn search(&self, query: &SearchQuery) -> Result<Vec<SearchHit>, MonitorError> {
        match self.engine.index.read() {
            Ok(index) => Ok(index.search(query)?),
            Err(_) => {
                tracing::error!("search index lock poisoned");
                Ok(Vec::new())
            }
        }
    }

    /// Start a content indexing pass on its own thread. Returns false when a
    /// pass is already running.
    pub fn request_content_indexing(&self) -> Result<bool, MonitorError> {
        let engine = &self.engine;
        if engine.content_running.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }

        let worker = Arc::clone(engine);
        let name = "content-indexer".to_string();
        let spawned = std::thread::Builder::new().name(name.clone()).spawn(move || {
            let pass = search::run_content_pass(
                &worker.index,
                worker.config.content_batch_size,
                collect_search_text,
                |done, total| worker.publisher.publish_progress("content", done, total),
            );
            tracing::info!(
                indexed = pass.indexed,
                pending = pass.failed,
                "content indexing pass finished"
            );
            worker.content_running.store(false, Ordering::SeqCst);
        });

        match spawned {
            Ok(_) => Ok(true),
            Err(source) => {
                engine.content_running.store(false, Ordering::SeqCst);
                Err(MonitorError::Spawn { name, source })
            }
        }
    }

    pub fn index_stats(&self) -> IndexStats {
        match self.engine.index.read() {
            Ok(index) => index.stats(),
            Err(_) => {
                tracing::error!("search index lock poisoned");
                IndexStats::default()
            }
        }
    }
}

impl Drop for SessionMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn truncate_thinking(mut entry: ConversationEntry) -> ConversationEntry {
    for block in &mut entry.blocks {
        if block.content_type == ContentType::Thinking {
            block.text = truncate_string(&block.text, THINKING_DISPLAY_CHARS);
        }
    }
    if entry.content_type == ContentType::Thinking {
        entry.text = truncate_string(&entry.text, THINKING_DISPLAY_CHARS);
    }
    entry
}

fn collect_search_text(paths: &[PathBuf]) -> Result<Vec<(PathBuf, String)>, IndexError> {
    let mut texts = Vec::with_capacity(paths.len());
    let mut last_error = None;
    for path in paths {
        match search_text(path) {
            Ok(text) => texts.push((path.clone(), text)),
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "no search text");
                last_error = Some(e.to_string());
            }
        }
    }
    match last_error {
        Some(reason) if texts.is_empty() => Err(IndexError::FetchFailed {
            paths: paths.to_vec(),
            reason,
        }),
        _ => Ok(texts),
    }
}

/// User and assistant prose of one session, capped at a char boundary.
fn search_text(path: &Path) -> Result<String, LogError> {
    let batch = log_reader::read_new(path, 0)?;
    let mut text = String::new();

    let entries = batch.entries.iter().filter(|e| {
        e.kind == EntryKind::Message && !e.is_meta && matches!(e.role, Role::User | Role::Assistant)
    });
    'entries: for entry in entries {
        let pieces: Vec<&str> = if entry.blocks.is_empty() {
            match entry.content_type {
                ContentType::Text => vec![entry.text.as_str()],
                _ => Vec::new(),
            }
        } else {
            entry
                .blocks
                .iter()
                .filter(|b| b.content_type == ContentType::Text)
                .map(|b| b.text.as_str())
                .collect()
        };
        for piece in pieces.into_iter().filter(|p| !p.trim().is_empty()) {
            if text.len() >= SEARCH_TEXT_MAX_BYTES {
                break 'entries;
            }
            if !text.is_empty() {
                text.push(' ');
            }
            text.push_str(piece);
        }
    }

    Ok(truncate_to_bytes(&text, SEARCH_TEXT_MAX_BYTES).to_string())
}
