//! Search Indexer: tantivy index held in RAM over session metadata and text.
//!
//! Indexing runs in two phases. Metadata fields are indexed eagerly whenever
//! the registry commits a change. Conversation text is indexed lazily in
//! batches when asked, so a slow fetch never holds up a status update.
//!
//! Every session is one document keyed by its log path. An update deletes the
//! old document by that term and adds the new one; writes are committed before
//! the next search. Each query term matches indexed tokens in tiers:
//! - exact (`login` -> `login`)
//! - prefix (`log` -> `login`)
//! - infix (`ogi` -> `login`)
//! - fuzzy, bounded edit distance (`lojin` -> `login`)

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, RwLock};
use tantivy::collector::TopDocs;
use tantivy::query::{
    BooleanQuery, ConstScoreQuery, DisjunctionMaxQuery, FuzzyTermQuery, Occur, Query, RegexQuery,
    TermQuery,
};
use tantivy::schema::{
    Field as SchemaField, IndexRecordOption, Schema, TextFieldIndexing, TextOptions, Value,
    INDEXED, STORED, STRING,
};
use tantivy::{Index, IndexReader, IndexWriter, ReloadPolicy, TantivyDocument, Term};

use crate::error::IndexError;
use crate::session::Session;

/// Indexing heap for the single writer thread.
const WRITER_HEAP_BYTES: usize = 20_000_000;

/// Indexed fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Field {
    ProjectName,
    Id,
    Summary,
    FirstPrompt,
    Path,
    Branch,
    Model,
    Content,
}

impl Field {
    pub const ALL: [Field; 8] = [
        Field::ProjectName,
        Field::Id,
        Field::Summary,
        Field::FirstPrompt,
        Field::Path,
        Field::Branch,
        Field::Model,
        Field::Content,
    ];

    pub fn weight(self) -> f64 {
        match self {
            Field::ProjectName | Field::Id => 3.0,
            Field::Summary | Field::FirstPrompt => 2.0,
            Field::Path | Field::Branch => 1.5,
            Field::Model | Field::Content => 1.0,
        }
    }

    fn schema_name(self) -> &'static str {
        match self {
            Field::ProjectName => "project_name",
            Field::Id => "id",
            Field::Summary => "summary",
            Field::FirstPrompt => "first_prompt",
            Field::Path => "project_path",
            Field::Branch => "git_branch",
            Field::Model => "model",
            Field::Content => "content",
        }
    }
}

/// How a query term matched a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MatchTier {
    Fuzzy,
    Infix,
    Prefix,
    Exact,
}

impl MatchTier {
    pub fn weight(self) -> f64 {
        match self {
            MatchTier::Exact => 1.0,
            MatchTier::Prefix => 0.8,
            MatchTier::Infix => 0.6,
            MatchTier::Fuzzy => 0.4,
        }
    }
}

/// Partial-match switches shared by search and highlighting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchOptions {
    /// Prefix and infix matches.
    pub prefix: bool,
    /// Bounded edit-distance matches.
    pub fuzzy: bool,
}

impl Default for MatchOptions {
    fn default() -> Self {
        Self {
            prefix: true,
            fuzzy: true,
        }
    }
}

/// Split on anything that is not alphanumeric and lowercase. Agrees with
/// tantivy's `default` tokenizer, so query terms line up with indexed tokens.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

/// Best tier at which `term` matches `token`, both already lowercased.
pub fn match_tier(term: &str, token: &str, options: MatchOptions) -> Option<MatchTier> {
    if term == token {
        return Some(MatchTier::Exact);
    }
    if options.prefix {
        if token.starts_with(term) {
            return Some(MatchTier::Prefix);
        }
        if token.contains(term) {
            return Some(MatchTier::Infix);
        }
    }
    if options.fuzzy {
        let max = fuzzy_budget(term);
        if max > 0 && within_distance(term, token, usize::from(max)) {
            return Some(MatchTier::Fuzzy);
        }
    }
    None
}

fn fuzzy_budget(term: &str) -> u8 {
    match term.chars().count() {
        0..=3 => 0,
        4..=7 => 1,
        _ => 2,
    }
}

/// Levenshtein distance of `a` and `b` is at most `max`.
fn within_distance(a: &str, b: &str, max: usize) -> bool {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.len().abs_diff(b.len()) > max {
        return false;
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        let mut row_min = curr[0];
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(curr[j] + 1);
            row_min = row_min.min(curr[j + 1]);
        }
        if row_min > max {
            return false;
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()] <= max
}

/// Term combination semantics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum QueryMode {
    #[default]
    All,
    Any,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SearchQuery {
    pub text: String,
    pub mode: QueryMode,
    pub prefix: bool,
    pub fuzzy: bool,
    /// Zero means unlimited.
    pub limit: usize,
    pub include_archived: bool,
}

impl Default for SearchQuery {
    fn default() -> Self {
        Self {
            text: String::new(),
            mode: QueryMode::All,
            prefix: true,
            fuzzy: true,
            limit: 50,
            include_archived: false,
        }
    }
}

impl SearchQuery {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn options(&self) -> MatchOptions {
        MatchOptions {
            prefix: self.prefix,
            fuzzy: self.fuzzy,
        }
    }

    /// Distinct query terms in order of first appearance.
    fn terms(&self) -> Vec<String> {
        let mut terms = tokenize(&self.text);
        let mut seen = HashSet::new();
        terms.retain(|t| seen.insert(t.clone()));
        terms
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    pub log_path: PathBuf,
    pub session_id: String,
    pub score: f64,
    pub matched_fields: Vec<Field>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexStats {
    pub documents: usize,
    pub content_indexed: usize,
    pub pending_content: usize,
    /// Distinct tokens across every indexed field.
    pub vocabulary: usize,
}

/// Field handles of the in-RAM schema.
struct IndexSchema {
    log_path: SchemaField,
    archived: SchemaField,
    text: Vec<(Field, SchemaField)>,
}

impl IndexSchema {
    fn build() -> (Schema, Self) {
        let mut builder = Schema::builder();
        let log_path = builder.add_text_field("log_path", STRING | STORED);
        let archived = builder.add_bool_field("archived", INDEXED);

        let tokenized = TextOptions::default().set_indexing_options(
            TextFieldIndexing::default()
                .set_tokenizer("default")
                .set_index_option(IndexRecordOption::WithFreqs),
        );
        let text = Field::ALL
            .iter()
            .map(|f| (*f, builder.add_text_field(f.schema_name(), tokenized.clone())))
            .collect();

        let handles = Self {
            log_path,
            archived,
            text,
        };
        (builder.build(), handles)
    }
}

/// Bookkeeping for one indexed session. The texts are kept so a document can
/// be rebuilt whole and matched fields reported without a stored copy.
#[derive(Debug, Default)]
struct DocState {
    log_path: PathBuf,
    session_id: String,
    archived: bool,
    offset: u64,
    rewrites: u64,
    metadata: Vec<(Field, String)>,
    content: Option<String>,
    /// Bumped whenever the content goes stale.
    content_generation: u64,
    content_dirty: bool,
}

impl DocState {
    fn texts(&self) -> impl Iterator<Item = (Field, &str)> {
        self.metadata
            .iter()
            .map(|(f, v)| (*f, v.as_str()))
            .chain(self.content.as_deref().map(|c| (Field::Content, c)))
    }

    fn matched_fields(&self, terms: &[String], options: MatchOptions) -> Vec<Field> {
        let mut fields: Vec<Field> = self
            .texts()
            .filter(|(_, text)| {
                tokenize(text)
                    .iter()
                    .any(|token| terms.iter().any(|t| match_tier(t, token, options).is_some()))
            })
            .map(|(f, _)| f)
            .collect();
        fields.sort();
        fields.dedup();
        fields
    }
}

fn metadata_texts(session: &Session) -> Vec<(Field, String)> {
    let fields: [(Field, Option<&str>); 7] = [
        (Field::ProjectName, Some(session.project_name.as_str())),
        (Field::Id, Some(session.id.as_str())),
        (Field::Summary, session.summary.as_deref()),
        (Field::FirstPrompt, session.first_prompt.as_deref()),
        (Field::Path, Some(session.project_path.as_str())),
        (Field::Branch, session.git_branch.as_deref()),
        (Field::Model, session.model.as_deref()),
    ];
    fields
        .into_iter()
        .filter_map(|(f, v)| v.filter(|v| !v.is_empty()).map(|v| (f, v.to_string())))
        .collect()
}

fn doc_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

struct Writer {
    inner: IndexWriter,
    uncommitted: bool,
}

pub struct SearchIndex {
    schema: IndexSchema,
    writer: Mutex<Writer>,
    reader: IndexReader,
    docs: HashMap<String, DocState>,
}

impl SearchIndex {
    pub fn new() -> Result<Self, IndexError> {
        let (schema, handles) = IndexSchema::build();
        let index = Index::create_in_ram(schema);
        let writer: IndexWriter = index.writer_with_num_threads(1, WRITER_HEAP_BYTES)?;
        let reader: IndexReader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()?;
        Ok(Self {
            schema: handles,
            writer: Mutex::new(Writer {
                inner: writer,
                uncommitted: false,
            }),
            reader,
            docs: HashMap::new(),
        })
    }

    fn writer(&self) -> Result<MutexGuard<'_, Writer>, IndexError> {
        self.writer
            .lock()
            .map_err(|_| IndexError::Engine("index writer lock poisoned".to_string()))
    }

    /// Replace the document of one session. Marks its content stale when the
    /// log has grown, and drops the content outright when the log was
    /// truncated or replaced.
    pub fn index_metadata(&mut self, session: &Session) -> Result<(), IndexError> {
        let key = doc_key(&session.log_path);
        let doc = self.docs.entry(key.clone()).or_insert_with(|| DocState {
            log_path: session.log_path.clone(),
            content_dirty: true,
            ..DocState::default()
        });
        doc.session_id = session.id.clone();
        doc.archived = session.archived;
        doc.metadata = metadata_texts(session);

        let rewritten = doc.rewrites != session.rewrites;
        if rewritten {
            doc.content = None;
        }
        if rewritten || doc.offset != session.offset {
            doc.rewrites = session.rewrites;
            doc.offset = session.offset;
            doc.content_dirty = true;
            doc.content_generation += 1;
        }
        self.write_doc(&key)
    }

    /// Replace the content of one session. Ignored when the session changed
    /// again after `generation` was handed out.
    pub fn index_content(
        &mut self,
        path: &Path,
        generation: u64,
        text: &str,
    ) -> Result<bool, IndexError> {
        let key = doc_key(path);
        match self.docs.get_mut(&key) {
            Some(doc) if doc.content_generation == generation => {
                doc.content = Some(text.to_string());
                doc.content_dirty = false;
            }
            _ => return Ok(false),
        }
        self.write_doc(&key)?;
        Ok(true)
    }

    fn write_doc(&self, key: &str) -> Result<(), IndexError> {
        let Some(state) = self.docs.get(key) else {
            return Ok(());
        };
        let mut doc = TantivyDocument::default();
        doc.add_text(self.schema.log_path, key);
        doc.add_bool(self.schema.archived, state.archived);
        for (field, text) in state.texts() {
            if let Some((_, handle)) = self.schema.text.iter().find(|(f, _)| *f == field) {
                doc.add_text(*handle, text);
            }
        }

        let mut writer = self.writer()?;
        writer
            .inner
            .delete_term(Term::from_field_text(self.schema.log_path, key));
        writer.inner.add_document(doc)?;
        writer.uncommitted = true;
        Ok(())
    }

    /// Commit pending writes and point the reader at them.
    fn refresh(&self) -> Result<(), IndexError> {
        let mut writer = self.writer()?;
        if writer.uncommitted {
            writer.inner.commit()?;
            self.reader.reload()?;
            writer.uncommitted = false;
        }
        Ok(())
    }

    /// Sessions whose text needs (re)indexing, with their content generation.
    pub fn pending_content(&self) -> Vec<(PathBuf, u64)> {
        let mut pending: Vec<(PathBuf, u64)> = self
            .docs
            .values()
            .filter(|doc| doc.content_dirty && !doc.archived)
            .map(|doc| (doc.log_path.clone(), doc.content_generation))
            .collect();
        pending.sort();
        pending
    }

    pub fn remove(&mut self, path: &Path) -> Result<(), IndexError> {
        let key = doc_key(path);
        if self.docs.remove(&key).is_some() {
            let mut writer = self.writer()?;
            writer
                .inner
                .delete_term(Term::from_field_text(self.schema.log_path, &key));
            writer.uncommitted = true;
        }
        Ok(())
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.docs.contains_key(&doc_key(path))
    }

    pub fn stats(&self) -> IndexStats {
        let vocabulary: HashSet<String> = self
            .docs
            .values()
            .flat_map(|doc| doc.texts().flat_map(|(_, text)| tokenize(text)))
            .collect();
        IndexStats {
            documents: self.docs.len(),
            content_indexed: self.docs.values().filter(|d| d.content.is_some()).count(),
            pending_content: self
                .docs
                .values()
                .filter(|d| d.content_dirty && !d.archived)
                .count(),
            vocabulary: vocabulary.len(),
        }
    }

    /// Disjunction of one term over every field. Within a field the best tier
    /// wins; across fields the contributions add up.
    fn term_query(&self, term: &str, options: MatchOptions) -> Result<Box<dyn Query>, IndexError> {
        let mut per_field: Vec<(Occur, Box<dyn Query>)> = Vec::new();
        for (field, handle) in &self.schema.text {
            let exact = TermQuery::new(
                Term::from_field_text(*handle, term),
                IndexRecordOption::Basic,
            );
            let mut tiers = vec![tiered(exact, MatchTier::Exact, *field)];
            if options.prefix {
                let prefix = RegexQuery::from_pattern(&format!("{}.*", term), *handle)?;
                tiers.push(tiered(prefix, MatchTier::Prefix, *field));
                let infix = RegexQuery::from_pattern(&format!(".+{}.*", term), *handle)?;
                tiers.push(tiered(infix, MatchTier::Infix, *field));
            }
            let distance = fuzzy_budget(term);
            if options.fuzzy && distance > 0 {
                let fuzzy =
                    FuzzyTermQuery::new(Term::from_field_text(*handle, term), distance, false);
                tiers.push(tiered(fuzzy, MatchTier::Fuzzy, *field));
            }
            per_field.push((Occur::Should, Box::new(DisjunctionMaxQuery::new(tiers))));
        }
        Ok(Box::new(BooleanQuery::new(per_field)))
    }

    pub fn search(&self, query: &SearchQuery) -> Result<Vec<SearchHit>, IndexError> {
        let terms = query.terms();
        if terms.is_empty() || self.docs.is_empty() {
            return Ok(Vec::new());
        }
        self.refresh()?;

        let options = query.options();
        let occur = match query.mode {
            QueryMode::All => Occur::Must,
            QueryMode::Any => Occur::Should,
        };
        let mut clauses: Vec<(Occur, Box<dyn Query>)> = Vec::with_capacity(terms.len() + 1);
        for term in &terms {
            clauses.push((occur, self.term_query(term, options)?));
        }
        if !query.include_archived {
            clauses.push((
                Occur::MustNot,
                Box::new(TermQuery::new(
                    Term::from_field_bool(self.schema.archived, true),
                    IndexRecordOption::Basic,
                )),
            ));
        }

        // Collect every match so ties break by path before the limit applies
        let searcher = self.reader.searcher();
        let top_docs = searcher.search(
            &BooleanQuery::new(clauses),
            &TopDocs::with_limit(self.docs.len()),
        )?;

        let mut hits = Vec::with_capacity(top_docs.len());
        for (score, address) in top_docs {
            let doc: TantivyDocument = searcher.doc(address)?;
            let Some(state) = doc
                .get_first(self.schema.log_path)
                .and_then(|v| v.as_str())
                .and_then(|key| self.docs.get(key))
            else {
                continue;
            };
            hits.push(SearchHit {
                log_path: state.log_path.clone(),
                session_id: state.session_id.clone(),
                score: f64::from(score),
                matched_fields: state.matched_fields(&terms, options),
            });
        }

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.log_path.cmp(&b.log_path))
        });
        if query.limit > 0 {
            hits.truncate(query.limit);
        }
        Ok(hits)
    }
}

/// Score a match as tier weight times field weight, whatever the term stats.
fn tiered(query: impl Query + 'static, tier: MatchTier, field: Field) -> Box<dyn Query> {
    let score = (tier.weight() * field.weight()) as f32;
    Box::new(ConstScoreQuery::new(Box::new(query), score))
}

/// Outcome of one lazy content pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContentPass {
    pub indexed: usize,
    /// Sessions left pending for the next pass.
    pub failed: usize,
}

/// Fetch and index the text of every pending session in batches.
///
/// The index lock is released while `fetch` runs. Sessions missing from a
/// fetch result, or in a failed batch, stay pending.
pub fn run_content_pass<F, P>(
    index: &RwLock<SearchIndex>,
    batch_size: usize,
    fetch: F,
    mut progress: P,
) -> ContentPass
where
    F: Fn(&[PathBuf]) -> Result<Vec<(PathBuf, String)>, IndexError>,
    P: FnMut(usize, usize),
{
    let pending = match index.read() {
        Ok(index) => index.pending_content(),
        Err(_) => {
            tracing::error!("search index lock poisoned");
            return ContentPass::default();
        }
    };
    let total = pending.len();
    let mut pass = ContentPass::default();
    let mut done = 0;
    progress(done, total);

    for batch in pending.chunks(batch_size.max(1)) {
        let paths: Vec<PathBuf> = batch.iter().map(|(p, _)| p.clone()).collect();
        let generations: HashMap<&Path, u64> =
            batch.iter().map(|(p, g)| (p.as_path(), *g)).collect();

        match fetch(&paths) {
            Ok(texts) => {
                let mut indexed_here = 0;
                if let Ok(mut index) = index.write() {
                    for (path, text) in &texts {
                        let Some(generation) = generations.get(path.as_path()) else {
                            continue;
                        };
                        match index.index_content(path, *generation, text) {
                            Ok(true) => indexed_here += 1,
                            Ok(false) => {}
                            Err(error) => {
                                tracing::warn!(path = %path.display(), error = %error, "failed to index session text");
                            }
                        }
                    }
                }
                pass.indexed += indexed_here;
                pass.failed += batch.len() - indexed_here.min(batch.len());
            }
            Err(error) => {
                tracing::warn!(error = %error, "content fetch failed, sessions stay pending");
                pass.failed += batch.len();
            }
        }

        done += batch.len();
        progress(done, total);
    }

    pass
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Session;

    fn session(dir: &str, id: &str) -> Session {
        let mut s = Session::new(Path::new(&format!("/root/{}/{}.jsonl", dir, id)));
        s.id = id.to_string();
        s
    }

    fn indexed(sessions: &[Session]) -> SearchIndex {
        let mut index = SearchIndex::new().unwrap();
        for s in sessions {
            index.index_metadata(s).unwrap();
        }
        index
    }

    fn find(index: &SearchIndex, text: &str) -> Vec<SearchHit> {
        index.search(&SearchQuery::new(text)).unwrap()
    }

    fn ids(hits: &[SearchHit]) -> Vec<String> {
        hits.iter().map(|h| h.session_id.clone()).collect()
    }

    fn next_generation(index: &SearchIndex) -> u64 {
        index.pending_content()[0].1
    }

    // =============================================================================
    // Tokenizer and Tier Tests
    // =============================================================================

    #[test]
    fn test_tokenize() {
        assert_eq!(
            tokenize("Fix the Login-bug in auth_v2.rs!"),
            vec!["fix", "the", "login", "bug", "in", "auth", "v2", "rs"]
        );
        assert!(tokenize("  --  ").is_empty());
        assert_eq!(tokenize("Über café"), vec!["über", "café"]);
    }

    #[test]
    fn test_match_tiers() {
        let all = MatchOptions::default();
        assert_eq!(match_tier("login", "login", all), Some(MatchTier::Exact));
        assert_eq!(match_tier("log", "login", all), Some(MatchTier::Prefix));
        assert_eq!(match_tier("ogi", "login", all), Some(MatchTier::Infix));
        assert_eq!(match_tier("lojin", "login", all), Some(MatchTier::Fuzzy));
        assert_eq!(match_tier("xyz", "login", all), None);

        let strict = MatchOptions {
            prefix: false,
            fuzzy: false,
        };
        assert_eq!(match_tier("log", "login", strict), None);
        assert_eq!(match_tier("lojin", "login", strict), None);
    }

    #[test]
    fn test_fuzzy_distance_budget() {
        let fuzzy = MatchOptions {
            prefix: false,
            fuzzy: true,
        };
        // Short terms never fuzz
        assert_eq!(match_tier("cat", "cot", fuzzy), None);
        // 4-7 chars: one edit
        assert!(match_tier("lagin", "login", fuzzy).is_some());
        assert!(match_tier("lagen", "login", fuzzy).is_none());
        // 8+ chars: two edits
        assert!(match_tier("authentikate", "authenticate", fuzzy).is_some());
        assert!(match_tier("awthentikate", "authenticate", fuzzy).is_some());
        assert!(match_tier("awthentikatt", "authenticate", fuzzy).is_none());
    }

    // =============================================================================
    // Metadata Search Tests
    // =============================================================================

    #[test]
    fn test_search_by_project_name_substring() {
        let index = indexed(&[
            session("-home-dev-checkout", "a"),
            session("-home-dev-billing", "b"),
        ]);
        let hits = find(&index, "checkout");
        assert_eq!(ids(&hits), vec!["a"]);
        assert!(hits[0].matched_fields.contains(&Field::ProjectName));

        assert_eq!(ids(&find(&index, "illin")), vec!["b"]);
        assert_eq!(ids(&find(&index, "check")), vec!["a"]);
    }

    #[test]
    fn test_fuzzy_and_prefix_switches() {
        let mut a = session("-w-api", "a");
        a.summary = Some("fix the login page".to_string());
        let index = indexed(&[a]);

        assert_eq!(find(&index, "lojin").len(), 1);
        assert_eq!(find(&index, "logi").len(), 1);

        let strict = SearchQuery {
            prefix: false,
            fuzzy: false,
            ..SearchQuery::new("lojin")
        };
        assert!(index.search(&strict).unwrap().is_empty());
        let strict = SearchQuery {
            text: "logi".to_string(),
            ..strict
        };
        assert!(index.search(&strict).unwrap().is_empty());
        let strict = SearchQuery {
            text: "login".to_string(),
            ..strict
        };
        assert_eq!(index.search(&strict).unwrap().len(), 1);
    }

    #[test]
    fn test_mode_all_vs_any() {
        let mut a = session("-w-api", "a");
        a.git_branch = Some("main".to_string());
        let mut b = session("-w-web", "b");
        b.git_branch = Some("feature".to_string());
        let index = indexed(&[a, b]);

        assert!(find(&index, "api feature").is_empty());
        assert_eq!(ids(&find(&index, "web feature")), vec!["b"]);

        let any = SearchQuery {
            mode: QueryMode::Any,
            ..SearchQuery::new("api feature")
        };
        let mut found = ids(&index.search(&any).unwrap());
        found.sort();
        assert_eq!(found, vec!["a", "b"]);
    }

    #[test]
    fn test_ranking_prefers_exact_and_heavier_fields() {
        let mut a = session("-w-tools", "a");
        a.summary = Some("deploy pipeline".to_string());
        let b = session("-w-deploy", "b");
        let mut c = session("-w-other", "c");
        c.summary = Some("deployment notes".to_string());
        let index = indexed(&[a, b, c]);

        let hits = find(&index, "deploy");
        // Project name (3.0) beats summary (2.0); exact beats prefix
        assert_eq!(ids(&hits), vec!["b", "a", "c"]);
        assert!(hits[0].score > hits[1].score);
        assert!(hits[1].score > hits[2].score);
    }

    #[test]
    fn test_archived_hidden_unless_requested() {
        let mut a = session("-w-api", "a");
        a.archived = true;
        let index = indexed(&[a]);
        assert!(find(&index, "api").is_empty());
        let query = SearchQuery {
            include_archived: true,
            ..SearchQuery::new("api")
        };
        assert_eq!(index.search(&query).unwrap().len(), 1);
    }

    #[test]
    fn test_limit_and_empty_query() {
        let sessions: Vec<Session> = (0..5).map(|i| session("-w-api", &i.to_string())).collect();
        let index = indexed(&sessions);
        let query = SearchQuery {
            limit: 2,
            ..SearchQuery::new("api")
        };
        let hits = index.search(&query).unwrap();
        // Equal scores fall back to path order
        assert_eq!(ids(&hits), vec!["0", "1"]);
        let unlimited = SearchQuery {
            limit: 0,
            ..SearchQuery::new("api")
        };
        assert_eq!(index.search(&unlimited).unwrap().len(), 5);
        assert!(find(&index, "  ").is_empty());
        assert!(find(&SearchIndex::new().unwrap(), "api").is_empty());
    }

    #[test]
    fn test_reindex_replaces_metadata() {
        let mut a = session("-w-api", "a");
        a.summary = Some("old words".to_string());
        let mut index = indexed(&[a.clone()]);
        assert_eq!(find(&index, "old").len(), 1);

        a.summary = Some("fresh text".to_string());
        index.index_metadata(&a).unwrap();

        assert!(find(&index, "old").is_empty());
        assert_eq!(find(&index, "fresh").len(), 1);
        assert_eq!(index.stats().documents, 1);
    }

    // =============================================================================
    // Content Indexing Tests
    // =============================================================================

    #[test]
    fn test_content_round_trip() {
        let a = session("-w-api", "a");
        let index = RwLock::new(indexed(&[a.clone()]));
        assert!(find(&index.read().unwrap(), "kubernetes").is_empty());

        let pass = run_content_pass(
            &index,
            10,
            |batch: &[PathBuf]| {
                Ok(batch
                    .iter()
                    .map(|p| (p.clone(), "we migrated to kubernetes".to_string()))
                    .collect())
            },
            |_, _| {},
        );
        assert_eq!(pass, ContentPass { indexed: 1, failed: 0 });

        let index = index.read().unwrap();
        let hits = find(&index, "kubernetes");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].matched_fields, vec![Field::Content]);
        assert_eq!(index.stats().pending_content, 0);
        assert_eq!(index.stats().content_indexed, 1);
    }

    #[test]
    fn test_content_reindex_has_no_duplicates() {
        let mut a = session("-w-api", "a");
        let mut index = indexed(&[a.clone()]);
        let generation = next_generation(&index);
        assert!(index.index_content(&a.log_path, generation, "alpha beta").unwrap());

        a.offset = 100;
        index.index_metadata(&a).unwrap();
        // Grown, not rewritten: the old text stays searchable until refetched
        assert_eq!(find(&index, "alpha").len(), 1);
        let generation = next_generation(&index);
        assert!(index.index_content(&a.log_path, generation, "gamma").unwrap());

        assert!(find(&index, "alpha").is_empty());
        assert_eq!(find(&index, "gamma").len(), 1);
        assert_eq!(index.stats().documents, 1);
    }

    #[test]
    fn test_stale_generation_is_ignored() {
        let mut a = session("-w-api", "a");
        let mut index = indexed(&[a.clone()]);
        let generation = next_generation(&index);

        // Session grows while its text is being fetched
        a.offset = 10;
        index.index_metadata(&a).unwrap();
        assert!(!index.index_content(&a.log_path, generation, "stale").unwrap());
        assert_eq!(index.pending_content().len(), 1);
    }

    #[test]
    fn test_status_only_update_keeps_generation() {
        let mut a = session("-w-api", "a");
        let mut index = indexed(&[a.clone()]);
        let generation = next_generation(&index);

        a.summary = Some("renamed".to_string());
        index.index_metadata(&a).unwrap();
        assert!(index.index_content(&a.log_path, generation, "text").unwrap());
        assert!(index.pending_content().is_empty());
    }

    #[test]
    fn test_rewritten_log_drops_old_content() {
        let mut a = session("-w-api", "a");
        a.offset = 24;
        let mut index = indexed(&[a.clone()]);
        let generation = next_generation(&index);
        assert!(index.index_content(&a.log_path, generation, "oauth handshake").unwrap());
        assert_eq!(find(&index, "handshake").len(), 1);

        // Replaced by a log of exactly the same length
        a.rewrites = 1;
        index.index_metadata(&a).unwrap();
        assert!(find(&index, "handshake").is_empty());
        assert!(!index.index_content(&a.log_path, generation, "oauth handshake").unwrap());

        let generation = next_generation(&index);
        assert!(index.index_content(&a.log_path, generation, "token exchange").unwrap());
        assert!(find(&index, "handshake").is_empty());
        assert_eq!(find(&index, "exchange").len(), 1);
    }

    #[test]
    fn test_failed_fetch_keeps_sessions_pending() {
        let sessions: Vec<Session> = (0..5).map(|i| session("-w-api", &i.to_string())).collect();
        let index = RwLock::new(indexed(&sessions));
        let mut progress = Vec::new();

        let pass = run_content_pass(
            &index,
            2,
            |batch: &[PathBuf]| {
                if batch.iter().any(|p| p.ends_with("0.jsonl")) {
                    return Err(IndexError::FetchFailed {
                        paths: batch.to_vec(),
                        reason: "disk error".to_string(),
                    });
                }
                Ok(batch.iter().map(|p| (p.clone(), "text".to_string())).collect())
            },
            |done, total| progress.push((done, total)),
        );

        assert_eq!(pass, ContentPass { indexed: 3, failed: 2 });
        assert_eq!(progress, vec![(0, 5), (2, 5), (4, 5), (5, 5)]);
        let stats = index.read().unwrap().stats();
        assert_eq!(stats.pending_content, 2);
        assert_eq!(stats.content_indexed, 3);
    }

    #[test]
    fn test_remove_drops_the_document() {
        let a = session("-w-api", "a");
        let mut index = indexed(&[a.clone()]);
        let generation = next_generation(&index);
        index.index_content(&a.log_path, generation, "words here").unwrap();
        assert!(index.contains(&a.log_path));
        // api, a, w, words, here
        assert_eq!(index.stats().vocabulary, 5);

        index.remove(&a.log_path).unwrap();
        assert!(!index.contains(&a.log_path));
        assert_eq!(index.stats(), IndexStats::default());
        assert!(find(&index, "api").is_empty());
    }
}
