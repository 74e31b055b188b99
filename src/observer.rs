//! # Progress and output sink
//!
//! The crawler, context builders, completion client and session never print.
//! They describe what happened as a [`Notice`] and hand it to an
//! [`Observer`]. The binary plugs in [`TerminalObserver`], which renders
//! notices with crossterm colors; library users and tests can use
//! [`NullObserver`] or record notices themselves.

use crossterm::{
    ExecutableCommand,
    style::{Attribute, Color, Print, SetAttribute, SetForegroundColor},
};
use std::io::{self, Write, stderr, stdout};
use std::path::Path;

/// Something worth telling the user about.
#[derive(Debug, Clone, Copy)]
pub enum Notice<'a> {
    /// The crawler accepted a file.
    FileFound { path: &'a Path },
    /// A file was read into the direct context.
    FileLoaded {
        path: &'a Path,
        tokens: usize,
        total: usize,
        hard_max: usize,
    },
    /// A path could not be read or is not a regular file or directory.
    CrawlWarning { path: &'a Path, reason: &'a str },
    /// The direct context is close to the model's input limit.
    BudgetWarning { total: usize, hard_max: usize },
    /// A piece of a streamed reply.
    Fragment(&'a str),
    /// A streamed attempt failed after delivering `fragments` pieces; they are
    /// not part of the reply.
    PartialDiscarded { fragments: usize },
    /// A completion attempt failed and another one will follow.
    RetryScheduled {
        attempt: u32,
        max_attempts: u32,
        reason: &'a str,
    },
    /// The final reply of a turn; `streamed` is set when its fragments were
    /// already delivered.
    Reply { text: &'a str, streamed: bool },
    Info(&'a str),
    Error(&'a str),
}

/// Receiver of [`Notice`]s.
pub trait Observer {
    fn notice(&mut self, notice: Notice<'_>);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl Observer for NullObserver {
    fn notice(&mut self, _notice: Notice<'_>) {}
}

/// Renders notices to the terminal.
///
/// Progress goes to stdout in green, warnings to stderr in yellow, errors to
/// stderr in red and assistant text to stdout in bold blue.
#[derive(Debug, Default)]
pub struct TerminalObserver {
    /// When set, per-file progress lines are suppressed.
    pub quiet: bool,
}

impl TerminalObserver {
    pub fn new(quiet: bool) -> Self {
        Self { quiet }
    }

    fn colored(out: &mut impl Write, color: Color, text: &str) -> io::Result<()> {
        out.execute(SetForegroundColor(color))?;
        out.execute(Print(text))?;
        out.execute(SetForegroundColor(Color::Reset))?;
        out.flush()
    }

    fn render(&mut self, notice: Notice<'_>) -> io::Result<()> {
        match notice {
            Notice::FileFound { .. } => Ok(()),
            Notice::FileLoaded {
                path,
                tokens,
                total,
                hard_max,
            } => {
                if self.quiet {
                    return Ok(());
                }
                let line = format!(
                    "Parsing file: {}... ({tokens} tkn, {total}/{hard_max} total)\n",
                    path.display()
                );
                Self::colored(&mut stdout(), Color::Green, &line)
            }
            Notice::CrawlWarning { path, reason } => {
                let line = format!(
                    "Warning: '{}' could not be read ({reason})...proceeding\n",
                    path.display()
                );
                Self::colored(&mut stderr(), Color::Yellow, &line)
            }
            Notice::BudgetWarning { total, hard_max } => {
                let lines = format!(
                    "Warning: Token count ({total}) is close to max ({hard_max}).\n\
                     Expect degraded model memory after token limit is exceeded.\n\
                     Consider using embeddings (--ingest, then --embed).\n"
                );
                Self::colored(&mut stderr(), Color::Yellow, &lines)
            }
            Notice::Fragment(text) => {
                let mut out = stdout();
                out.execute(SetForegroundColor(Color::Blue))?;
                out.execute(SetAttribute(Attribute::Bold))?;
                out.execute(Print(text))?;
                out.execute(SetAttribute(Attribute::Reset))?;
                out.execute(SetForegroundColor(Color::Reset))?;
                out.flush()
            }
            Notice::PartialDiscarded { .. } => {
                Self::colored(&mut stderr(), Color::Yellow, "\n> Partial reply discarded\n")
            }
            Notice::RetryScheduled {
                attempt,
                max_attempts,
                reason,
            } => {
                let line = format!("\n> Attempt {attempt}/{max_attempts} failed: {reason}\n");
                Self::colored(&mut stderr(), Color::Yellow, &line)
            }
            Notice::Reply { text, streamed } => {
                let mut out = stdout();
                if streamed {
                    return writeln!(out);
                }
                out.execute(SetForegroundColor(Color::Blue))?;
                out.execute(SetAttribute(Attribute::Bold))?;
                out.execute(Print(format!("> {}\n", text.replace('\n', "\n> "))))?;
                out.execute(SetAttribute(Attribute::Reset))?;
                out.execute(SetForegroundColor(Color::Reset))?;
                out.flush()
            }
            Notice::Info(text) => Self::colored(&mut stdout(), Color::Green, &format!("{text}\n")),
            Notice::Error(text) => {
                Self::colored(&mut stderr(), Color::Red, &format!("!Error: {text}\n"))
            }
        }
    }
}

impl Observer for TerminalObserver {
    fn notice(&mut self, notice: Notice<'_>) {
        if let Err(err) = self.render(notice) {
            tracing::debug!("terminal output failed: {err}");
        }
    }
}

/// Owned copy of a [`Notice`], kept by [`Recorder`].
#[cfg(test)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Recorded {
    FileFound(std::path::PathBuf),
    FileLoaded(std::path::PathBuf, usize),
    CrawlWarning(std::path::PathBuf),
    BudgetWarning(usize, usize),
    Fragment(String),
    PartialDiscarded(usize),
    RetryScheduled(u32),
    Reply(String, bool),
    Info(String),
    Error(String),
}

/// Test observer that keeps every notice.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct Recorder {
    pub(crate) seen: Vec<Recorded>,
}

#[cfg(test)]
impl Observer for Recorder {
    fn notice(&mut self, notice: Notice<'_>) {
        let recorded = match notice {
            Notice::FileFound { path } => Recorded::FileFound(path.to_path_buf()),
            Notice::FileLoaded { path, tokens, .. } => {
                Recorded::FileLoaded(path.to_path_buf(), tokens)
            }
            Notice::CrawlWarning { path, .. } => Recorded::CrawlWarning(path.to_path_buf()),
            Notice::BudgetWarning { total, hard_max } => Recorded::BudgetWarning(total, hard_max),
            Notice::Fragment(text) => Recorded::Fragment(text.to_string()),
            Notice::PartialDiscarded { fragments } => Recorded::PartialDiscarded(fragments),
            Notice::RetryScheduled { attempt, .. } => Recorded::RetryScheduled(attempt),
            Notice::Reply { text, streamed } => Recorded::Reply(text.to_string(), streamed),
            Notice::Info(text) => Recorded::Info(text.to_string()),
            Notice::Error(text) => Recorded::Error(text.to_string()),
        };
        self.seen.push(recorded);
    }
}
