//! Session Registry: the authoritative in-memory table of tracked sessions.
//!
//! The table maps log paths to slots. Each slot sits behind its own mutex, and
//! a read plus its fold happen under that one lock, so two passes over the same
//! session can never interleave. Different sessions update in parallel.
//! Cumulative fields are a deterministic fold over the entry history; a
//! truncated or replaced log clears the slot and folds again from offset 0.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use crate::error::{LogError, MonitorError};
use crate::log_reader::{read_new_checked, FileIdentity, ReadBatch};
use crate::metadata::{self, HintMap, SessionHint};
use crate::parser::{parse_timestamp, truncate_string};
use crate::process::is_alive;
use crate::session::{project_name, ContentType, ConversationEntry, EntryKind, Role, Session};
use crate::status::{infer_status, Liveness};
use crate::usage::UsageAccumulator;

const FIRST_PROMPT_MAX_CHARS: usize = 200;

/// Clock and process inputs shared by every status computation in one pass.
#[derive(Debug, Clone)]
pub struct StatusContext {
    pub now: DateTime<Utc>,
    /// Working directories with a live agent process; `None` when untracked.
    pub active_paths: Option<HashSet<String>>,
    pub threshold: Duration,
}

impl StatusContext {
    pub fn new(threshold: Duration, active_paths: Option<HashSet<String>>) -> Self {
        Self {
            now: Utc::now(),
            active_paths,
            threshold,
        }
    }
}

/// Descriptive fields folded from the entry history.
#[derive(Debug, Clone, Default)]
struct Digest {
    session_id: Option<String>,
    cwd: Option<String>,
    git_branch: Option<String>,
    model: Option<String>,
    message_count: u64,
    last_message_id: Option<String>,
    first_prompt: Option<String>,
    summary: Option<String>,
    has_tool_use: bool,
    first_timestamp: Option<DateTime<Utc>>,
    last_timestamp: Option<DateTime<Utc>>,
}

impl Digest {
    fn apply(&mut self, entry: &ConversationEntry) {
        if self.session_id.is_none() {
            self.session_id = entry.session_id.clone();
        }
        if self.cwd.is_none() {
            self.cwd = entry.cwd.clone();
        }
        if entry.git_branch.is_some() {
            self.git_branch = entry.git_branch.clone();
        }
        if let Some(ts) = entry.timestamp {
            self.first_timestamp = Some(self.first_timestamp.map_or(ts, |f| f.min(ts)));
            self.last_timestamp = Some(self.last_timestamp.map_or(ts, |l| l.max(ts)));
        }

        match entry.kind {
            EntryKind::Summary => {
                if !entry.text.is_empty() {
                    self.summary = Some(entry.text.clone());
                }
                return;
            }
            EntryKind::ApprovalRequest => return,
            EntryKind::Message => {}
        }
        if entry.is_meta {
            return;
        }

        if entry.role == Role::Assistant {
            // "<synthetic>" marks harness-generated turns, not a real model
            if let Some(model) = entry.model.as_ref().filter(|m| !m.starts_with('<')) {
                self.model = Some(model.clone());
            }
        }

        if entry
            .blocks
            .iter()
            .any(|b| b.content_type == ContentType::ToolUse)
        {
            self.has_tool_use = true;
        }

        if entry.is_user_prompt() || entry.role == Role::Assistant {
            let continues_turn =
                entry.message_id.is_some() && entry.message_id == self.last_message_id;
            if !continues_turn {
                self.message_count += 1;
            }
            self.last_message_id = entry.message_id.clone();
        }

        if self.first_prompt.is_none() && entry.is_user_prompt() {
            let text = entry.text.trim();
            // Skip slash-command wrappers and caveats
            if !text.is_empty() && !text.starts_with('<') {
                self.first_prompt = Some(truncate_string(text, FIRST_PROMPT_MAX_CHARS));
            }
        }
    }
}

/// Everything the registry keeps for one session.
#[derive(Debug)]
struct SessionState {
    session: Session,
    tail: VecDeque<ConversationEntry>,
    tail_capacity: usize,
    usage: UsageAccumulator,
    digest: Digest,
    identity: Option<FileIdentity>,
    file_modified: Option<DateTime<Utc>>,
    hint: Option<SessionHint>,
    /// Not yet published.
    fresh: bool,
}

impl SessionState {
    fn new(log_path: &Path, tail_capacity: usize, hint: Option<SessionHint>) -> Self {
        Self {
            session: Session::new(log_path),
            tail: VecDeque::new(),
            tail_capacity,
            usage: UsageAccumulator::new(),
            digest: Digest::default(),
            identity: None,
            file_modified: None,
            hint,
            fresh: true,
        }
    }

    fn reset(&mut self) {
        self.tail.clear();
        self.usage = UsageAccumulator::new();
        self.digest = Digest::default();
        self.identity = None;
        self.session.offset = 0;
        self.session.rewrites = self.session.rewrites.saturating_add(1);
    }

    /// Fold a batch into the slot. Returns the new record when anything
    /// observable changed.
    fn apply_batch(&mut self, batch: ReadBatch, ctx: &StatusContext) -> Option<Session> {
        let before = self.session.clone();
        if batch.reset {
            self.reset();
        }

        for entry in &batch.entries {
            self.usage.apply(entry);
            self.digest.apply(entry);
        }
        self.tail.extend(batch.entries);
        while self.tail.len() > self.tail_capacity {
            self.tail.pop_front();
        }

        self.session.offset = batch.new_offset;
        if batch.identity.is_some() {
            self.identity = batch.identity;
        }
        self.file_modified = batch.modified;
        self.session.file_exists = true;
        self.session.archived = false;

        self.rebuild_fields();
        self.session.status = self.compute_status(ctx);
        self.take_change(&before, batch.reset)
    }

    fn take_change(&mut self, before: &Session, force: bool) -> Option<Session> {
        let changed = force || self.fresh || !before.same_observable(&self.session);
        self.fresh = false;
        changed.then(|| self.session.clone())
    }

    /// Recompute descriptive and usage fields from the fold state and hint.
    fn rebuild_fields(&mut self) {
        let digest = &self.digest;
        let hint = self.hint.as_ref();
        let s = &mut self.session;

        if let Some(id) = &digest.session_id {
            s.id = id.clone();
        } else if let Some(stem) = metadata::hint_key(&s.log_path) {
            s.id = stem;
        }

        s.cwd = digest.cwd.clone();
        s.project_path = digest
            .cwd
            .clone()
            .or_else(|| hint.and_then(|h| non_empty(&h.project_path)))
            .unwrap_or_else(|| metadata::project_path_from_log(&s.log_path));
        s.project_name = project_name(&s.project_path);
        s.git_branch = digest
            .git_branch
            .clone()
            .or_else(|| hint.and_then(|h| non_empty(&h.git_branch)));
        s.model = digest.model.clone();

        let totals = self.usage.totals();
        s.input_tokens = totals.input_tokens;
        s.output_tokens = totals.output_tokens;
        s.total_output_tokens = totals.total_output_tokens;
        s.context_tokens = totals.context_tokens;
        s.cache_creation_tokens = totals.cache_creation_tokens;
        s.cache_read_tokens = totals.cache_read_tokens;

        s.message_count = digest.message_count;
        s.first_prompt = hint
            .and_then(|h| non_empty(&h.first_prompt))
            .or_else(|| digest.first_prompt.clone());
        s.summary = hint
            .and_then(|h| non_empty(&h.summary))
            .or_else(|| digest.summary.clone());
        s.has_tool_use = digest.has_tool_use;
        s.created_at = digest.first_timestamp.or_else(|| {
            hint.and_then(|h| h.created.as_ref())
                .and_then(|c| parse_timestamp(&serde_json::Value::String(c.clone())))
        });
        s.last_modified = digest.last_timestamp.or(self.file_modified);
    }

    fn compute_status(&self, ctx: &StatusContext) -> crate::session::SessionStatus {
        let liveness = Liveness {
            now: ctx.now,
            last_activity: self.digest.last_timestamp.or(self.file_modified),
            process_alive: is_alive(
                ctx.active_paths.as_ref(),
                self.session.cwd.as_deref(),
                &self.session.project_path,
            ),
            threshold: ctx.threshold,
        };
        infer_status(&self.tail, &liveness)
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.as_ref().filter(|s| !s.is_empty()).cloned()
}

type Slot = Arc<Mutex<SessionState>>;

fn lock(slot: &Slot) -> Result<MutexGuard<'_, SessionState>, MonitorError> {
    slot.lock().map_err(|_| MonitorError::RegistryPoisoned)
}

/// Table of all known sessions keyed by log path.
pub struct SessionRegistry {
    slots: RwLock<HashMap<PathBuf, Slot>>,
    hints: RwLock<HintMap>,
    tail_capacity: usize,
}

impl SessionRegistry {
    pub fn new(tail_capacity: usize) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            hints: RwLock::new(HintMap::new()),
            tail_capacity: tail_capacity.max(1),
        }
    }

    fn existing_slot(&self, path: &Path) -> Result<Option<Slot>, MonitorError> {
        let slots = self.slots.read().map_err(|_| MonitorError::RegistryPoisoned)?;
        Ok(slots.get(path).cloned())
    }

    /// Get or create the slot for a log path.
    fn slot(&self, path: &Path) -> Result<Slot, MonitorError> {
        if let Some(slot) = self.existing_slot(path)? {
            return Ok(slot);
        }
        let hint = {
            let hints = self.hints.read().map_err(|_| MonitorError::RegistryPoisoned)?;
            metadata::hint_key(path).and_then(|k| hints.get(&k).cloned())
        };
        let mut slots = self.slots.write().map_err(|_| MonitorError::RegistryPoisoned)?;
        let slot = slots.entry(path.to_path_buf()).or_insert_with(|| {
            Arc::new(Mutex::new(SessionState::new(path, self.tail_capacity, hint)))
        });
        Ok(Arc::clone(slot))
    }

    /// Drop `slot` unless another pass already replaced it.
    fn discard(&self, path: &Path, slot: &Slot) -> Result<(), MonitorError> {
        let mut slots = self.slots.write().map_err(|_| MonitorError::RegistryPoisoned)?;
        if slots.get(path).is_some_and(|s| Arc::ptr_eq(s, slot)) {
            slots.remove(path);
        }
        Ok(())
    }

    fn all_slots(&self) -> Result<Vec<Slot>, MonitorError> {
        let slots = self.slots.read().map_err(|_| MonitorError::RegistryPoisoned)?;
        Ok(slots.values().cloned().collect())
    }

    /// Read whatever was appended to `path` since the last pass and fold it in,
    /// all under the session's lock.
    pub fn ingest(&self, path: &Path, ctx: &StatusContext) -> Result<Option<Session>, MonitorError> {
        let slot = self.slot(path)?;
        let mut state = lock(&slot)?;
        let batch = match read_new_checked(path, state.session.offset, state.identity) {
            Ok(batch) => batch,
            Err(LogError::NotFound(_)) if state.fresh => {
                // Never seen on disk: leave no record behind
                drop(state);
                self.discard(path, &slot)?;
                return Ok(None);
            }
            Err(LogError::NotFound(_)) => {
                drop(state);
                return self.mark_missing(path);
            }
            Err(e) => return Err(e.into()),
        };
        Ok(state.apply_batch(batch, ctx))
    }

    /// Fold a batch read elsewhere. A batch that does not start at the slot's
    /// offset is stale and ignored unless it is a reset.
    pub fn apply_read(
        &self,
        path: &Path,
        batch: ReadBatch,
        ctx: &StatusContext,
    ) -> Result<Option<Session>, MonitorError> {
        let slot = self.slot(path)?;
        let mut state = lock(&slot)?;
        if !batch.reset && batch.start_offset != state.session.offset {
            tracing::debug!(
                path = %path.display(),
                batch_offset = batch.start_offset,
                offset = state.session.offset,
                "dropping stale read"
            );
            return Ok(None);
        }
        Ok(state.apply_batch(batch, ctx))
    }

    /// The backing file is gone: keep the record as archived.
    pub fn mark_missing(&self, path: &Path) -> Result<Option<Session>, MonitorError> {
        let Some(slot) = self.existing_slot(path)? else {
            return Ok(None);
        };
        let mut state = lock(&slot)?;
        let before = state.session.clone();
        state.session.file_exists = false;
        state.session.archived = true;
        Ok(state.take_change(&before, false))
    }

    /// The backing file is back (or was restored).
    pub fn mark_present(&self, path: &Path) -> Result<Option<Session>, MonitorError> {
        let Some(slot) = self.existing_slot(path)? else {
            return Ok(None);
        };
        let mut state = lock(&slot)?;
        let before = state.session.clone();
        state.session.file_exists = true;
        state.session.archived = false;
        Ok(state.take_change(&before, false))
    }

    /// Copy of every record, each read under its own lock.
    pub fn snapshot(&self) -> Result<Vec<Session>, MonitorError> {
        let mut sessions = Vec::new();
        for slot in self.all_slots()? {
            sessions.push(lock(&slot)?.session.clone());
        }
        sessions.sort_by(|a, b| a.log_path.cmp(&b.log_path));
        Ok(sessions)
    }

    pub fn get(&self, path: &Path) -> Result<Option<Session>, MonitorError> {
        match self.existing_slot(path)? {
            Some(slot) => Ok(Some(lock(&slot)?.session.clone())),
            None => Ok(None),
        }
    }

    pub fn paths(&self) -> Result<Vec<PathBuf>, MonitorError> {
        let slots = self.slots.read().map_err(|_| MonitorError::RegistryPoisoned)?;
        Ok(slots.keys().cloned().collect())
    }

    pub fn len(&self) -> usize {
        self.slots.read().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Re-run status inference for live sessions; `Stopped` depends on the clock.
    pub fn recompute_statuses(&self, ctx: &StatusContext) -> Result<Vec<Session>, MonitorError> {
        let mut changed = Vec::new();
        for slot in self.all_slots()? {
            let mut state = lock(&slot)?;
            if state.session.archived || state.fresh {
                continue;
            }
            let status = state.compute_status(ctx);
            if status != state.session.status {
                state.session.status = status;
                changed.push(state.session.clone());
            }
        }
        Ok(changed)
    }

    /// Merge `sessions-index.json` hints and return the records they changed.
    pub fn apply_hints(&self, hints: HintMap) -> Result<Vec<Session>, MonitorError> {
        {
            let mut stored = self.hints.write().map_err(|_| MonitorError::RegistryPoisoned)?;
            stored.extend(hints.clone());
        }

        let mut changed = Vec::new();
        for slot in self.all_slots()? {
            let mut state = lock(&slot)?;
            let Some(hint) = metadata::hint_key(&state.session.log_path).and_then(|k| hints.get(&k))
            else {
                continue;
            };
            if state.hint.as_ref() == Some(hint) {
                continue;
            }
            let before = state.session.clone();
            state.hint = Some(hint.clone());
            state.rebuild_fields();
            if state.fresh {
                continue;
            }
            if let Some(session) = state.take_change(&before, false) {
                changed.push(session);
            }
        }
        Ok(changed)
    }
}
