//! Main module for the grept CLI.
//!
//! Parses the command line, loads the configuration and `.greptignore`, picks
//! a context provider and runs the chat session (or the index build).
//!
//! # Examples
//!
//! ```sh
//! grept src -l 2 -x rs toml          # chat about the Rust and TOML files under src/
//! grept -q "what does main do?" < /dev/null
//! grept --ingest src -l 3            # build .grept-index/
//! grept -e                           # chat with retrieved fragments
//! ```

use std::io::IsTerminal;
use std::path::Path;
use std::process::ExitCode;
use std::sync::atomic::Ordering;

use clap::Parser;
use once_cell::sync::OnceCell;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use grept::api::CompletionClient;
use grept::commands::{Cli, Mode, is_informational};
use grept::config::{GreptConfig, load_config};
use grept::context::{ContextProvider, DirectFileContext, RetrievalContext};
use grept::crawler::{CrawlConfig, IGNORE_FILE, load_ignore_file};
use grept::error::{GreptError, Result};
use grept::ingest::ingest;
use grept::observer::{Notice, Observer, TerminalObserver};
use grept::session::{ChatSession, EditorReader, Step};
use grept::tokens::TokenBudgeter;
use grept::vector_store::{MiniLmEmbedder, VectorStore};

static TRACING: OnceCell<()> = OnceCell::new();

fn main() -> ExitCode {
    TRACING.get_or_init(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
            )
            .with_writer(std::io::stderr)
            .init();
    });

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            // Usage errors exit 1 like every other startup failure.
            if let Err(print_err) = err.print() {
                debug!("could not print usage: {print_err}");
            }
            return if is_informational(&err) {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            };
        }
    };
    if cli.version {
        println!("{}", env!("CARGO_PKG_VERSION"));
        return ExitCode::SUCCESS;
    }

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => return fail(&GreptError::from(err)),
    };

    match runtime.block_on(run(cli)) {
        Ok(code) => code,
        Err(err) => fail(&err),
    }
}

fn fail(err: &GreptError) -> ExitCode {
    debug!("fatal: {err:?}");
    TerminalObserver::default().notice(Notice::Error(&err.to_string()));
    ExitCode::FAILURE
}

/// Everything after argument parsing.
///
/// # Errors
///
/// Startup problems (bad level, unreadable config, nothing to crawl, missing
/// index) come back as errors. Failed turns do not; the session reports them
/// and carries on.
async fn run(cli: Cli) -> Result<ExitCode> {
    let config_path = grept::config_path()?;
    debug!("Loading config from: {}", config_path.display());
    let mut config = load_config(&config_path)?;
    if cli.api_key.is_some() {
        config.api_key = cli.api_key.clone();
    }
    if cli.no_stream {
        config.should_stream = Some(false);
    }

    let level = usize::try_from(cli.level)
        .ok()
        .filter(|level| *level >= 1)
        .ok_or_else(|| GreptError::Validation("level must be greater than 0".to_string()))?;
    let ignore = load_ignore_file(Path::new(IGNORE_FILE))?;
    let crawl_config = CrawlConfig::new(cli.files.clone(), level, &cli.suffixes, ignore)?;
    let budgeter = TokenBudgeter::for_model(&config.model, config.hard_max())?;
    let mut observer = TerminalObserver::new(cli.quiet);

    let provider: Box<dyn ContextProvider> = match cli.mode() {
        Mode::Ingest => {
            let mut store = VectorStore::new(Box::new(MiniLmEmbedder::load()?));
            ingest(
                &crawl_config,
                &budgeter,
                config.chunk_tokens,
                &mut store,
                &cli.path,
                &mut observer,
            )?;
            return Ok(ExitCode::SUCCESS);
        }
        Mode::Embed => {
            let store = VectorStore::load(&cli.path, Box::new(MiniLmEmbedder::load()?))?;
            info!("loaded {} fragment(s) from {}", store.len(), cli.path.display());
            Box::new(RetrievalContext::new(Box::new(store)))
        }
        Mode::Chat => Box::new(DirectFileContext::load(
            crawl_config,
            budgeter,
            cli.compact,
            &mut observer,
        )?),
    };

    let interactive = cli.interactive || std::io::stdin().is_terminal();
    if !interactive && cli.query.is_none() {
        return Err(GreptError::Validation(
            "no query given and stdin is not a terminal; use -q or -i".to_string(),
        ));
    }

    if config.api_key.as_deref().is_none_or(str::is_empty) {
        warn!("no API key configured");
    }
    chat(cli, &config, provider, observer, interactive).await
}

async fn chat(
    cli: Cli,
    config: &GreptConfig,
    provider: Box<dyn ContextProvider>,
    observer: TerminalObserver,
    interactive: bool,
) -> Result<ExitCode> {
    let client = CompletionClient::new(config)?;

    if !interactive {
        let query = cli.query.unwrap_or_default();
        let mut session = ChatSession::new(
            provider,
            client,
            config.system_prompt.clone(),
            cli.tokens,
            None,
            observer,
        );
        return Ok(match session.handle_line(&query).await {
            Step::Answered(completion) if !completion.succeeded() => ExitCode::FAILURE,
            _ => ExitCode::SUCCESS,
        });
    }

    let mut session = ChatSession::new(
        provider,
        client,
        config.system_prompt.clone(),
        cli.tokens,
        cli.query,
        observer,
    );
    let interrupted = session.interrupt_flag();
    if let Err(err) = ctrlc::set_handler(move || interrupted.store(true, Ordering::SeqCst)) {
        warn!("could not install Ctrl-C handler: {err}");
    }

    let mut reader = EditorReader::new()?;
    session.run(&mut reader).await?;
    Ok(ExitCode::SUCCESS)
}
