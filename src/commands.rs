//! This module defines the command-line interface for grept using `clap`.
//!
//! grept has no subcommands. The positional arguments are the roots to crawl
//! and the flags pick the context mode and tune the crawl and the replies.
//!
//! # Examples
//!
//! ```no_run
//! use clap::Parser;
//! use grept::commands::{Cli, Mode};
//!
//! let cli = Cli::parse();
//! match cli.mode() {
//!     Mode::Chat => { /* whole files as context */ }
//!     Mode::Embed => { /* fragments from the index */ }
//!     Mode::Ingest => { /* build the index */ }
//! }
//! ```

use std::path::PathBuf;

use clap::{ArgGroup, Parser, error::ErrorKind};

/// Which context strategy to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Send whole files with every question.
    Chat,
    /// Retrieve relevant fragments from a prebuilt index.
    Embed,
    /// Build the index used by [`Mode::Embed`].
    Ingest,
}

/// Ask questions about your code.
#[derive(Parser, Debug)]
#[command(
    name = "grept",
    author,
    about,
    long_about = None,
    disable_version_flag = true,
    color = clap::ColorChoice::Auto,
    group(ArgGroup::new("mode").args(["chat", "embed", "ingest"]))
)]
pub struct Cli {
    /// Files or directories to query.
    #[arg(default_value = ".")]
    pub files: Vec<PathBuf>,

    /// Chat with whole files as context (default).
    #[arg(short, long)]
    pub chat: bool,

    /// Chat with fragments retrieved from the index as context.
    #[arg(short, long)]
    pub embed: bool,

    /// Build the index from the crawled files and exit.
    #[arg(long)]
    pub ingest: bool,

    /// Levels of directory recursion, at least 1.
    #[arg(short, long, default_value_t = 1, allow_negative_numbers = true)]
    pub level: i64,

    /// Only include files with these suffixes.
    #[arg(short = 'x', long = "suffix", num_args = 1..)]
    pub suffixes: Vec<String>,

    /// Maximum tokens to generate per reply.
    #[arg(short, long, default_value_t = 256)]
    pub tokens: u32,

    /// Directory of the similarity index.
    #[arg(short, long, default_value = ".grept-index")]
    pub path: PathBuf,

    /// Question to ask first.
    #[arg(short, long)]
    pub query: Option<String>,

    /// Keep asking after the first answer, even when stdin is not a terminal.
    #[arg(short, long)]
    pub interactive: bool,

    /// Also strip spaces and tabs from file contents.
    #[arg(long)]
    pub compact: bool,

    /// Wait for whole replies instead of streaming them.
    #[arg(long)]
    pub no_stream: bool,

    /// Do not list each file as it is loaded.
    #[arg(long)]
    pub quiet: bool,

    /// Print version.
    #[arg(short = 'v', long = "version")]
    pub version: bool,

    /// API key for the completion service.
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,
}

impl Cli {
    pub fn mode(&self) -> Mode {
        if self.embed {
            Mode::Embed
        } else if self.ingest {
            Mode::Ingest
        } else {
            Mode::Chat
        }
    }
}

/// True for parse "errors" that are really help output.
pub fn is_informational(err: &clap::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::DisplayHelp
            | ErrorKind::DisplayVersion
            | ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("grept").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_defaults() {
        let cli = parse(&[]);
        assert_eq!(cli.files, vec![PathBuf::from(".")]);
        assert_eq!(cli.level, 1);
        assert_eq!(cli.tokens, 256);
        assert_eq!(cli.path, PathBuf::from(".grept-index"));
        assert_eq!(cli.mode(), Mode::Chat);
        assert!(cli.suffixes.is_empty());
        assert!(!cli.version);
        assert!(!cli.interactive);
    }

    #[test]
    fn test_full_invocation() {
        let cli = parse(&[
            "src", "Cargo.toml", "-l", "3", "-t", "512", "-q", "what is this?", "--compact",
            "--no-stream", "-x", "rs", "toml",
        ]);
        assert_eq!(
            cli.files,
            vec![PathBuf::from("src"), PathBuf::from("Cargo.toml")]
        );
        assert_eq!(cli.level, 3);
        assert_eq!(cli.tokens, 512);
        assert_eq!(cli.query.as_deref(), Some("what is this?"));
        assert_eq!(cli.suffixes, vec!["rs", "toml"]);
        assert!(cli.compact);
        assert!(cli.no_stream);
        assert!(!cli.quiet);
        assert!(parse(&["--quiet"]).quiet);
    }

    #[test]
    fn test_modes_are_exclusive() {
        assert_eq!(parse(&["-e", "-p", "idx"]).mode(), Mode::Embed);
        assert_eq!(parse(&["--ingest"]).mode(), Mode::Ingest);
        assert!(Cli::try_parse_from(["grept", "-c", "-e"]).is_err());
        assert!(Cli::try_parse_from(["grept", "--embed", "--ingest"]).is_err());
    }

    #[test]
    fn test_version_and_negative_level_parse() {
        assert!(parse(&["-v"]).version);
        assert_eq!(parse(&["-l", "0"]).level, 0);
        assert_eq!(parse(&["-l", "-2"]).level, -2);
    }

    #[test]
    fn test_usage_errors_are_not_informational() {
        let err = Cli::try_parse_from(["grept", "-l", "abc"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValueValidation);
        assert!(!is_informational(&err));

        let err = Cli::try_parse_from(["grept", "--no-such-flag"]).unwrap_err();
        assert!(!is_informational(&err));

        let err = Cli::try_parse_from(["grept", "--help"]).unwrap_err();
        assert!(is_informational(&err));
    }
}
