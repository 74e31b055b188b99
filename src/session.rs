//! # Chat session
//!
//! The read, answer, repeat loop. A [`ChatSession`] owns the conversation
//! history, one [`ContextProvider`] and one [`CompletionClient`], and moves
//! between [`SessionState`]s as lines come in:
//!
//! - `exit` / `quit` end the session.
//! - `clear` empties the history.
//! - `refresh` rebuilds a direct context (emptying the history) or points at
//!   `--ingest` for a retrieval context (keeping it).
//! - an empty line does nothing.
//! - anything else is a question.
//!
//! Lines come from a [`LineReader`]; [`EditorReader`] is the rustyline one.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use tracing::{debug, error, info};

use crate::api::{Completion, CompletionClient};
use crate::context::{ContextMode, ContextProvider, RefreshOutcome};
use crate::error::{GreptError, Result};
use crate::message::Conversation;
use crate::observer::{Notice, Observer};

pub const PROMPT: &str = "> ";

const BANNER: &str = "'exit' or 'quit' to exit, 'clear' to clear chat history, 'refresh' to reload files";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    /// A question has been recorded and its answer is being fetched.
    AwaitingResponse,
    Terminated,
}

/// What one input line did.
#[derive(Debug)]
pub enum Step {
    Exit,
    Cleared,
    Refreshed { files: usize, changed: bool },
    /// The provider cannot rebuild itself; the user was told to re-ingest.
    ReindexExternally,
    /// The refresh failed and the previous context stayed in place.
    RefreshFailed(GreptError),
    Skipped,
    Answered(Completion),
}

/// Source of input lines.
pub trait LineReader {
    /// Next line, or `None` when input is over (end of file or Ctrl-C).
    fn read_line(&mut self, prompt: &str) -> Result<Option<String>>;
}

/// [`LineReader`] backed by a rustyline editor with in-memory history.
pub struct EditorReader {
    editor: DefaultEditor,
}

impl EditorReader {
    pub fn new() -> Result<Self> {
        Ok(Self {
            editor: DefaultEditor::new()?,
        })
    }
}

impl LineReader for EditorReader {
    fn read_line(&mut self, prompt: &str) -> Result<Option<String>> {
        match self.editor.readline(prompt) {
            Ok(line) => {
                if !line.trim().is_empty() {
                    let _ = self.editor.add_history_entry(line.as_str());
                }
                Ok(Some(line))
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

/// One interactive conversation about a set of files or an index.
pub struct ChatSession<O: Observer> {
    provider: Box<dyn ContextProvider>,
    client: CompletionClient,
    system_prompt: String,
    max_tokens: u32,
    history: Conversation,
    state: SessionState,
    initial_query: Option<String>,
    interrupted: Arc<AtomicBool>,
    observer: O,
}

impl<O: Observer> ChatSession<O> {
    /// `initial_query`, when given, is asked before the first prompt.
    pub fn new(
        provider: Box<dyn ContextProvider>,
        client: CompletionClient,
        system_prompt: impl Into<String>,
        max_tokens: u32,
        initial_query: Option<String>,
        observer: O,
    ) -> Self {
        Self {
            provider,
            client,
            system_prompt: system_prompt.into(),
            max_tokens,
            history: Conversation::new(),
            state: SessionState::Idle,
            initial_query: initial_query.filter(|q| !q.trim().is_empty()),
            interrupted: Arc::new(AtomicBool::new(false)),
            observer,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn history(&self) -> &Conversation {
        &self.history
    }

    pub fn observer(&self) -> &O {
        &self.observer
    }

    /// Flag that ends the session at the next input read once set. Meant for
    /// a Ctrl-C handler.
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        self.interrupted.clone()
    }

    /// Apply one input line.
    pub async fn handle_line(&mut self, line: &str) -> Step {
        if self.state == SessionState::Terminated {
            return Step::Exit;
        }

        let input = line.trim();
        match input.to_lowercase().as_str() {
            "exit" | "quit" => {
                self.state = SessionState::Terminated;
                Step::Exit
            }
            "clear" => {
                self.history.clear();
                self.observer.notice(Notice::Info("Chat history cleared"));
                Step::Cleared
            }
            "refresh" => self.refresh(),
            "" => Step::Skipped,
            _ => Step::Answered(self.ask(input).await),
        }
    }

    /// Ask the initial query, then read lines until the session ends.
    pub async fn run(&mut self, reader: &mut dyn LineReader) -> Result<()> {
        self.observer.notice(Notice::Info(BANNER));

        if let Some(query) = self.initial_query.take() {
            self.observer.notice(Notice::Info(&format!("{PROMPT}{query}")));
            self.handle_line(&query).await;
        }

        while self.state != SessionState::Terminated {
            if self.interrupted.load(Ordering::SeqCst) {
                info!("interrupted, ending session");
                self.state = SessionState::Terminated;
                break;
            }
            match reader.read_line(PROMPT)? {
                Some(line) => {
                    self.handle_line(&line).await;
                }
                None => self.state = SessionState::Terminated,
            }
        }
        Ok(())
    }

    fn refresh(&mut self) -> Step {
        if self.provider.mode() == ContextMode::Direct {
            self.history.clear();
        }

        match self.provider.refresh(&mut self.observer) {
            Ok(RefreshOutcome::Reloaded { files, changed }) => {
                let text = if changed {
                    format!("Reloaded {files} file(s)")
                } else {
                    format!("Reloaded {files} file(s), nothing changed")
                };
                self.observer.notice(Notice::Info(&text));
                Step::Refreshed { files, changed }
            }
            Ok(RefreshOutcome::ReindexExternally) => {
                self.observer.notice(Notice::Info(
                    "The index is built offline; re-run grept with --ingest to pick up changes",
                ));
                Step::ReindexExternally
            }
            Err(err) => {
                error!("refresh failed: {err}");
                self.observer.notice(Notice::Error(&err.to_string()));
                Step::RefreshFailed(err)
            }
        }
    }

    async fn ask(&mut self, query: &str) -> Completion {
        self.state = SessionState::AwaitingResponse;
        debug!("question: {query:?}");

        let completion = match self.provider.build(query, &mut self.observer) {
            Ok(context) => match self.history.push_user(context.user_content) {
                Ok(()) => {
                    self.client
                        .complete(
                            &self.system_prompt,
                            &context.messages,
                            &mut self.history,
                            self.max_tokens,
                            &mut self.observer,
                        )
                        .await
                }
                Err(err) => self.fail_turn(err),
            },
            Err(err) => {
                if self.history.push_user(query).is_ok() {
                    let _ = self.history.push_assistant(String::new());
                }
                self.fail_turn(err)
            }
        };

        self.state = SessionState::Idle;
        completion
    }

    fn fail_turn(&mut self, err: GreptError) -> Completion {
        error!("turn failed: {err}");
        self.observer.notice(Notice::Error(&err.to_string()));
        Completion {
            text: String::new(),
            error: Some(err),
        }
    }
}
