use std::env;
use std::io::{stdin, IsTerminal};
use std::panic;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use kv_cli::config::ClientConfig;
use kv_cli::rusty::CliHelper;
use kv_cli::session::{Outcome, Session};
use kv_cli::{ast, trace};
use log::info;
use rustyline::error::ReadlineError;
use rustyline::history::DefaultHistory;
use rustyline::Editor;

#[derive(Debug, Parser, PartialEq)]
#[command(version, author, about = "Interactive and scriptable client for the unified KV and object store server")]
pub struct Args {
    /// Configuration file path.
    #[clap(short = 'c', long = "config", help = "Configuration file path")]
    config: Option<PathBuf>,

    /// Base URL of the server, overriding the config file.
    #[clap(long)]
    server_url: Option<String>,

    /// Tenant id sent on every request, overriding the config file.
    #[clap(long)]
    tenant: Option<String>,

    #[clap(short = 'l', long, default_value = "info")]
    log_level: String,

    #[clap(short = 'n', long, help = "Force non-interactive mode", default_value = "false")]
    non_interactive: bool,

    /// Query to execute non-interactively, instead of reading from stdin.
    #[clap(long, require_equals = true)]
    query: Option<String>,
}

#[tokio::main]
pub async fn main() -> Result<()> {
    setup_panic_hooks();

    eprintln!();
    eprintln!("██  ██  █        █");
    eprintln!("██ ██   ██      ██");
    eprintln!("███      ██    ██");
    eprintln!("██ ██     ██  ██");
    eprintln!("██  ██     ████  KV Storage CLI");
    eprintln!();

    let args = Args::parse();

    let log_dir = format!("{}/.kvcli", env::var("HOME").unwrap_or_else(|_| ".".to_string()));
    let _guards = trace::init_logging(&log_dir, &args.log_level).await?;
    info!("kv-cli start args: {:?}", &args);

    let mut config = ClientConfig::load(args.config.as_deref()).context("loading client config")?;
    if let Some(server_url) = &args.server_url {
        config.server_url = server_url.clone();
    }
    if let Some(tenant) = &args.tenant {
        config.tenant = Some(tenant.clone());
    }
    info!("kv-cli start config: {:?}", &config);

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        eprintln!("received Ctrl+C!");
        r.store(false, Ordering::SeqCst);
    })
    .context("setting Ctrl-C handler")?;

    let is_terminal = stdin().is_terminal();
    let is_repl = is_terminal && !args.non_interactive && args.query.is_none();
    if is_repl {
        config.terminal_update();
    }

    eprintln!("Welcome to kv-cli.");
    eprintln!("Connecting to {}.", config.server_url);
    eprintln!();

    let mut session = Session::new(config)?;

    if is_repl {
        return run_repl(&mut session, running).await;
    }

    match args.query {
        Some(query) => run_script(&mut session, &query).await,
        None => {
            let mut input = String::new();
            std::io::Read::read_to_string(&mut stdin(), &mut input).context("reading stdin")?;
            run_script(&mut session, &input).await
        }
    }
}

async fn run_repl(session: &mut Session, running: Arc<AtomicBool>) -> Result<()> {
    let keywords = Arc::new(ast::tokenizer::all_reserved_keywords());
    let mut editor = Editor::<CliHelper, DefaultHistory>::new()?;
    editor.set_helper(Some(CliHelper::with_keywords(keywords)));

    let prompt = format!("{} > ", session.config.prompt);
    loop {
        if !running.load(Ordering::SeqCst) {
            break;
        }
        match editor.readline(&prompt) {
            Ok(line) => {
                let _ = editor.add_history_entry(line.as_str());
                match session.dispatch(&line).await {
                    Ok(Outcome::Continue) => {}
                    Ok(Outcome::Exit) => break,
                    Err(e) => eprintln!("error: {e}"),
                }
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("readline error: {e}");
                break;
            }
        }
    }
    Ok(())
}

/// Non-interactive mode: every statement in `script` runs in order,
/// separated by `;` or newlines, and the first error aborts the batch.
async fn run_script(session: &mut Session, script: &str) -> Result<()> {
    for statement in script.split(|c| c == ';' || c == '\n') {
        let statement = statement.trim();
        if statement.is_empty() {
            continue;
        }
        match session.dispatch(statement).await? {
            Outcome::Continue => {}
            Outcome::Exit => break,
        }
    }
    Ok(())
}

fn setup_panic_hooks() {
    let meta = human_panic::Metadata {
        version: env!("CARGO_PKG_VERSION").into(),
        name: env!("CARGO_PKG_NAME").into(),
        authors: env!("CARGO_PKG_AUTHORS").replace(':', ", ").into(),
        homepage: env!("CARGO_PKG_HOMEPAGE").into(),
    };

    let default_hook = panic::take_hook();
    if env::var("RUST_BACKTRACE").is_err() {
        panic::set_hook(Box::new(move |info: &panic::PanicInfo| {
            default_hook(info);
            let file_path = human_panic::handle_dump(&meta, info);
            human_panic::print_msg(file_path, &meta)
                .expect("human-panic: printing error message to console failed");
        }));
    }
}
