//! LocaLM Bridge - local LLM chat and benchmark CLI
//!
//! Drives a llama.cpp model through the session worker.

use std::error::Error;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use localm_bridge::inference::{BenchParams, LlamaCppBackend, SessionWorker};
use localm_bridge::prompt::Conversation;
use localm_bridge::storage::settings::{load_settings, load_settings_from, SessionSettings};

/// Chat with or benchmark a local GGUF model
#[derive(Parser)]
#[command(name = "localm-bridge", version)]
struct Cli {
    /// Settings file (defaults to settings.json in the data directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Decode threads
    #[arg(long, global = true)]
    threads: Option<u32>,

    /// KV cache size in tokens
    #[arg(long, global = true)]
    ctx_size: Option<u32>,

    /// Ceiling on tokens per reply
    #[arg(long, global = true)]
    max_tokens: Option<usize>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Interactive chat on stdin. `/reset` clears the history, `/quit` exits.
    Chat {
        /// Path to a .gguf model
        #[arg(short, long)]
        model: PathBuf,
    },
    /// Measure prompt processing and generation speed.
    Bench {
        #[arg(short, long)]
        model: PathBuf,

        /// Prompt tokens per pass
        #[arg(long, default_value_t = 512)]
        pp: usize,

        /// Generation steps per pass
        #[arg(long, default_value_t = 128)]
        tg: usize,

        /// Parallel sequences
        #[arg(long, default_value_t = 1)]
        pl: usize,

        /// Repetitions
        #[arg(long, default_value_t = 3)]
        nr: usize,
    },
    /// Print engine and hardware details.
    Info,
}

fn main() {
    // Logs go to stderr so replies on stdout stay clean
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("localm_bridge=info")))
        .init();

    info!("Starting LocaLM Bridge v{}", env!("CARGO_PKG_VERSION"));

    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn settings_for(cli: &Cli) -> Result<SessionSettings, Box<dyn Error>> {
    let mut settings = match &cli.config {
        Some(path) => load_settings_from(path)?,
        None => load_settings(),
    };
    if cli.threads.is_some() {
        settings.threads = cli.threads;
    }
    if let Some(ctx_size) = cli.ctx_size {
        settings.context_size = ctx_size;
    }
    if let Some(max_tokens) = cli.max_tokens {
        settings.max_new_tokens = max_tokens;
    }
    settings.validate();
    Ok(settings)
}

fn start_worker(settings: &SessionSettings) -> Result<SessionWorker, Box<dyn Error>> {
    let worker = SessionWorker::spawn(
        LlamaCppBackend::init,
        settings.session_options(),
        settings.turn_defaults(),
    )?;
    Ok(worker)
}

fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    let settings = settings_for(&cli)?;

    match cli.command {
        Command::Chat { model } => {
            let worker = start_worker(&settings)?;
            let summary = worker.load_model(&model)?;
            eprintln!(
                "Loaded {} ({:.2}B params). Type /quit to exit.",
                summary.description,
                summary.param_count as f64 / 1e9
            );
            chat(&worker, &settings)
        }
        Command::Bench {
            model,
            pp,
            tg,
            pl,
            nr,
        } => {
            // Each parallel sequence needs its own KV sequence id
            let mut settings = settings;
            settings.max_sequences = settings.max_sequences.max(pl as u32);
            let worker = start_worker(&settings)?;
            worker.load_model(&model)?;
            let report = worker.benchmark(BenchParams { pp, tg, pl, nr })?;
            print!("{report}");
            Ok(())
        }
        Command::Info => {
            let worker = start_worker(&settings)?;
            println!("{}", worker.system_info()?);
            Ok(())
        }
    }
}

fn chat(worker: &SessionWorker, settings: &SessionSettings) -> Result<(), Box<dyn Error>> {
    let mut conversation = Conversation::with_system_prompt(&settings.system_prompt);
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        print!("> ");
        stdout.flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let line = line.trim();
        match line {
            "" => continue,
            "/quit" => break,
            "/reset" => {
                conversation.reset();
                worker.clear_cache()?;
                continue;
            }
            _ => {}
        }

        // A failed turn is reported and the chat goes on
        if let Err(e) = reply(worker, &mut conversation, line) {
            println!();
            eprintln!("error: {e}");
        }
    }
    Ok(())
}

fn reply(
    worker: &SessionWorker,
    conversation: &mut Conversation,
    line: &str,
) -> Result<(), Box<dyn Error>> {
    let mut stdout = io::stdout();
    let mut stream = worker.send(conversation, line)?;
    for fragment in stream.by_ref() {
        print!("{}", fragment?);
        stdout.flush()?;
    }
    println!();
    if let Some(reason) = stream.stop_reason() {
        tracing::debug!("Reply ended: {:?}", reason);
    }
    stream.finish_into(conversation)?;
    Ok(())
}
