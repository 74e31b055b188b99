//! # Context providers
//!
//! A [`ContextProvider`] decides what background material accompanies each
//! question. There are two:
//!
//! - [`DirectFileContext`] crawls the file roots once, and sends every file
//!   whole, as one System message per file, on every turn.
//! - [`RetrievalContext`] asks a [`SimilarityStore`] for the fragments most
//!   relevant to the question and folds them into the User message.
//!
//! The session picks one at construction time and only talks to the trait.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::crawler::{CrawlConfig, crawl};
use crate::error::{GreptError, Result};
use crate::message::Message;
use crate::observer::{Notice, Observer};
use crate::tokens::TokenBudgeter;
use crate::vector_store::SimilarityStore;

/// Fragments retrieved per question in retrieval mode.
pub const RETRIEVAL_TOP_K: usize = 3;

/// Which strategy a provider implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextMode {
    Direct,
    Retrieval,
}

/// What a provider contributes to one turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptContext {
    /// Sent after the system prompt and before the history.
    pub messages: Vec<Message>,
    /// Content of the User message that opens the turn.
    pub user_content: String,
}

/// Result of a `refresh` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// The context was rebuilt from disk.
    Reloaded { files: usize, changed: bool },
    /// This provider cannot rebuild itself; the index has to be rebuilt
    /// out of band.
    ReindexExternally,
}

/// Supplies context for each question.
pub trait ContextProvider {
    fn mode(&self) -> ContextMode;

    /// Context for a turn asking `query`.
    fn build(&mut self, query: &str, observer: &mut dyn Observer) -> Result<PromptContext>;

    /// Rebuild whatever the provider derived from disk.
    fn refresh(&mut self, observer: &mut dyn Observer) -> Result<RefreshOutcome>;
}

/// One file prepared for the prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub path: PathBuf,
    /// Source without blank lines.
    pub content: String,
    /// Tokens in the header-prefixed content.
    pub tokens: usize,
}

impl FileRecord {
    /// Header line that introduces a file in the prompt.
    pub fn header(path: &Path) -> String {
        format!("FILE: {}\n", path.display())
    }

    /// The text sent to the model: header followed by the content.
    pub fn prompt_text(&self) -> String {
        format!("{}{}", Self::header(&self.path), self.content)
    }
}

/// Drop blank and whitespace-only lines, keeping line endings.
///
/// With `compact`, spaces and tabs inside the remaining lines are removed too,
/// which saves tokens at the cost of mangling whitespace-significant sources.
pub fn strip_blank_lines(source: &str, compact: bool) -> String {
    source
        .split_inclusive('\n')
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            if compact {
                line.chars().filter(|c| *c != ' ' && *c != '\t').collect()
            } else {
                line.to_string()
            }
        })
        .collect()
}

/// Whole files as static context.
pub struct DirectFileContext {
    crawl_config: CrawlConfig,
    budgeter: TokenBudgeter,
    compact: bool,
    records: Vec<FileRecord>,
    messages: Vec<Message>,
    total_tokens: usize,
}

impl DirectFileContext {
    /// Crawl and read every file.
    ///
    /// # Errors
    /// [`GreptError::NoFiles`] when nothing readable is found.
    pub fn load(
        crawl_config: CrawlConfig,
        budgeter: TokenBudgeter,
        compact: bool,
        observer: &mut dyn Observer,
    ) -> Result<Self> {
        let mut context = Self {
            crawl_config,
            budgeter,
            compact,
            records: Vec::new(),
            messages: Vec::new(),
            total_tokens: 0,
        };
        let (records, total) = context.read_files(observer)?;
        context.install(records, total);
        Ok(context)
    }

    pub fn records(&self) -> &[FileRecord] {
        &self.records
    }

    /// The System messages, one per file, in path order.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn total_tokens(&self) -> usize {
        self.total_tokens
    }

    /// blake3 digest of every context message, in order.
    pub fn fingerprint(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        for message in &self.messages {
            hasher.update(message.content().as_bytes());
            hasher.update(&[0]);
        }
        hasher.finalize().to_hex().to_string()
    }

    fn read_files(&self, observer: &mut dyn Observer) -> Result<(Vec<FileRecord>, usize)> {
        let paths = crawl(&self.crawl_config, observer);
        let hard_max = self.budgeter.hard_max();
        let mut records = Vec::with_capacity(paths.len());
        let mut total = 0;

        for path in paths {
            let source = match fs::read_to_string(&path) {
                Ok(source) => source,
                Err(err) => {
                    let reason = err.to_string();
                    warn!("could not read file {}: {reason}", path.display());
                    observer.notice(Notice::CrawlWarning {
                        path: &path,
                        reason: &reason,
                    });
                    continue;
                }
            };

            let content = strip_blank_lines(&source, self.compact);
            let next = self
                .budgeter
                .accumulate(total, &format!("{}{}", FileRecord::header(&path), content));
            let tokens = next - total;
            total = next;
            observer.notice(Notice::FileLoaded {
                path: &path,
                tokens,
                total,
                hard_max,
            });
            records.push(FileRecord {
                path,
                content,
                tokens,
            });
        }

        if records.is_empty() {
            return Err(GreptError::NoFiles);
        }
        if self.budgeter.near_limit(total) {
            warn!("context uses {total} of {hard_max} tokens");
            observer.notice(Notice::BudgetWarning { total, hard_max });
        }
        Ok((records, total))
    }

    fn install(&mut self, records: Vec<FileRecord>, total: usize) {
        self.messages = records
            .iter()
            .map(|record| Message::System(record.prompt_text()))
            .collect();
        self.records = records;
        self.total_tokens = total;
        debug!(
            "direct context: {} file(s), {} token(s), fingerprint {}",
            self.records.len(),
            self.total_tokens,
            self.fingerprint()
        );
    }
}

impl ContextProvider for DirectFileContext {
    fn mode(&self) -> ContextMode {
        ContextMode::Direct
    }

    fn build(&mut self, query: &str, _observer: &mut dyn Observer) -> Result<PromptContext> {
        Ok(PromptContext {
            messages: self.messages.clone(),
            user_content: query.to_string(),
        })
    }

    /// Re-crawl and re-read everything. On failure the previous context is
    /// kept.
    fn refresh(&mut self, observer: &mut dyn Observer) -> Result<RefreshOutcome> {
        let before = self.fingerprint();
        let (records, total) = self.read_files(observer)?;
        self.install(records, total);
        let changed = before != self.fingerprint();
        info!("reloaded {} file(s), changed: {changed}", self.records.len());
        Ok(RefreshOutcome::Reloaded {
            files: self.records.len(),
            changed,
        })
    }
}

/// Fragments from a similarity store, chosen per question.
pub struct RetrievalContext {
    store: Box<dyn SimilarityStore>,
    top_k: usize,
}

impl RetrievalContext {
    pub fn new(store: Box<dyn SimilarityStore>) -> Self {
        Self {
            store,
            top_k: RETRIEVAL_TOP_K,
        }
    }

    /// The User message for `query` given the retrieved `fragments`.
    pub fn compose(query: &str, fragments: &[String]) -> String {
        format!("Query: {query}\n\nContext:\n{}", fragments.concat())
    }
}

impl ContextProvider for RetrievalContext {
    fn mode(&self) -> ContextMode {
        ContextMode::Retrieval
    }

    fn build(&mut self, query: &str, _observer: &mut dyn Observer) -> Result<PromptContext> {
        let mut fragments = self.store.query(query, self.top_k)?;
        fragments.truncate(self.top_k);
        debug!("retrieved {} fragment(s) for {query:?}", fragments.len());
        Ok(PromptContext {
            messages: Vec::new(),
            user_content: Self::compose(query, &fragments),
        })
    }

    fn refresh(&mut self, _observer: &mut dyn Observer) -> Result<RefreshOutcome> {
        Ok(RefreshOutcome::ReindexExternally)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::{NullObserver, Recorded, Recorder};
    use std::cell::Cell;
    use std::rc::Rc;

    fn project() -> tempfile::TempDir {
        let dir = tempfile::Builder::new().prefix("grept").tempdir().unwrap();
        fs::write(dir.path().join("a.rs"), "fn a() {\n\n    1\n}\n   \n").unwrap();
        fs::write(dir.path().join("b.rs"), "fn b() {}\n").unwrap();
        dir
    }

    fn direct(dir: &Path, hard_max: usize) -> Result<DirectFileContext> {
        let config = CrawlConfig::new(vec![dir], 1, ["rs"], Vec::<PathBuf>::new()).unwrap();
        let budgeter = TokenBudgeter::for_model("gpt-3.5-turbo", hard_max).unwrap();
        DirectFileContext::load(config, budgeter, false, &mut NullObserver)
    }

    #[test]
    fn test_strip_blank_lines() {
        assert_eq!(strip_blank_lines("a\n\n  \n\tb\n", false), "a\n\tb\n");
        assert_eq!(strip_blank_lines("let x = 1;\n\n", true), "letx=1;\n");
        assert_eq!(strip_blank_lines("no newline", false), "no newline");
    }

    #[test]
    fn test_one_system_message_per_file() {
        let dir = project();
        let context = direct(dir.path(), 4096).unwrap();
        let messages = context.messages();
        assert_eq!(messages.len(), 2);
        let expected = format!("FILE: {}\nfn a() {{\n    1\n}}\n", dir.path().join("a.rs").display());
        assert_eq!(messages[0], Message::System(expected));
        assert!(messages[1].content().starts_with("FILE: "));
        assert!(context.total_tokens() > 0);
    }

    #[test]
    fn test_rebuild_is_byte_identical() {
        let dir = project();
        let mut first = direct(dir.path(), 4096).unwrap();
        let second = direct(dir.path(), 4096).unwrap();
        assert_eq!(first.messages(), second.messages());
        assert_eq!(first.fingerprint(), second.fingerprint());

        let before = first.messages().to_vec();
        let outcome = first.refresh(&mut NullObserver).unwrap();
        assert_eq!(
            outcome,
            RefreshOutcome::Reloaded {
                files: 2,
                changed: false
            }
        );
        assert_eq!(first.messages(), before.as_slice());
    }

    #[test]
    fn test_refresh_reads_current_disk() {
        let dir = project();
        let mut context = direct(dir.path(), 4096).unwrap();
        fs::write(dir.path().join("c.rs"), "fn c() {}\n").unwrap();
        fs::write(dir.path().join("b.rs"), "fn b() { 2 }\n").unwrap();

        let outcome = context.refresh(&mut NullObserver).unwrap();
        assert_eq!(
            outcome,
            RefreshOutcome::Reloaded {
                files: 3,
                changed: true
            }
        );
        assert!(context.messages()[1].content().ends_with("fn b() { 2 }\n"));
    }

    #[test]
    fn test_refresh_with_no_files_keeps_previous_context() {
        let dir = project();
        let mut context = direct(dir.path(), 4096).unwrap();
        let before = context.fingerprint();
        fs::remove_file(dir.path().join("a.rs")).unwrap();
        fs::remove_file(dir.path().join("b.rs")).unwrap();

        assert!(matches!(
            context.refresh(&mut NullObserver),
            Err(GreptError::NoFiles)
        ));
        assert_eq!(context.fingerprint(), before);
    }

    #[test]
    fn test_budget_warning_does_not_truncate() {
        let dir = project();
        let config = CrawlConfig::new(vec![dir.path()], 1, ["rs"], Vec::<PathBuf>::new()).unwrap();
        let budgeter = TokenBudgeter::for_model("gpt-3.5-turbo", 1000).unwrap();
        let mut recorder = Recorder::default();
        let context = DirectFileContext::load(config, budgeter, false, &mut recorder).unwrap();

        assert_eq!(context.messages().len(), 2);
        assert!(
            recorder
                .seen
                .iter()
                .any(|r| matches!(r, Recorded::BudgetWarning(_, 1000)))
        );
    }

    #[test]
    fn test_unreadable_file_is_skipped() {
        let dir = project();
        fs::write(dir.path().join("bad.rs"), [0xff, 0xfe, 0x00]).unwrap();
        let config = CrawlConfig::new(vec![dir.path()], 1, ["rs"], Vec::<PathBuf>::new()).unwrap();
        let budgeter = TokenBudgeter::for_model("gpt-3.5-turbo", 4096).unwrap();
        let mut recorder = Recorder::default();
        let context = DirectFileContext::load(config, budgeter, false, &mut recorder).unwrap();

        assert_eq!(context.records().len(), 2);
        assert!(
            recorder
                .seen
                .contains(&Recorded::CrawlWarning(dir.path().join("bad.rs")))
        );
    }

    #[test]
    fn test_build_passes_query_through() {
        let dir = project();
        let mut context = direct(dir.path(), 4096).unwrap();
        let prompt = context.build("what does a do?", &mut NullObserver).unwrap();
        assert_eq!(prompt.user_content, "what does a do?");
        assert_eq!(prompt.messages, context.messages());
    }

    #[test]
    fn test_total_is_sum_of_file_tokens() {
        let dir = project();
        let context = direct(dir.path(), 4096).unwrap();
        let sum: usize = context.records().iter().map(|record| record.tokens).sum();
        assert_eq!(context.total_tokens(), sum);
        assert!(context.records().iter().all(|record| record.tokens > 0));
    }

    /// Returns every stored fragment regardless of `top_k`.
    struct GreedyStore {
        fragments: Vec<String>,
        queries: Rc<Cell<usize>>,
    }

    impl SimilarityStore for GreedyStore {
        fn query(&self, _text: &str, _top_k: usize) -> Result<Vec<String>> {
            self.queries.set(self.queries.get() + 1);
            Ok(self.fragments.clone())
        }
    }

    fn retrieval(n: usize) -> (RetrievalContext, Rc<Cell<usize>>) {
        let queries = Rc::new(Cell::new(0));
        let store = GreedyStore {
            fragments: (0..n).map(|i| format!("fragment {i}\n")).collect(),
            queries: queries.clone(),
        };
        (RetrievalContext::new(Box::new(store)), queries)
    }

    #[test]
    fn test_retrieval_caps_fragments() {
        let (mut context, queries) = retrieval(5);
        let prompt = context.build("find the parser", &mut NullObserver).unwrap();
        assert!(prompt.messages.is_empty());
        assert_eq!(
            prompt.user_content,
            "Query: find the parser\n\nContext:\nfragment 0\nfragment 1\nfragment 2\n"
        );
        assert_eq!(queries.get(), 1);
    }

    #[test]
    fn test_retrieval_with_empty_store() {
        let (mut context, _) = retrieval(0);
        let prompt = context.build("anything", &mut NullObserver).unwrap();
        assert_eq!(prompt.user_content, "Query: anything\n\nContext:\n");
    }

    #[test]
    fn test_retrieval_refresh_is_external() {
        let (mut context, queries) = retrieval(2);
        assert_eq!(
            context.refresh(&mut NullObserver).unwrap(),
            RefreshOutcome::ReindexExternally
        );
        assert_eq!(queries.get(), 0);
    }
}
