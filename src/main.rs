//! llama-session: terminal chat over a llama.cpp model.
//!
//! Loads the configured native binary set, opens one session and reads
//! prompts from stdin. `/history`, `/reset` and `/quit` are commands;
//! Ctrl-C cancels the reply being generated.

use std::io::Write;
use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use llama_session::config::{Cli, Config};
use llama_session::inference::llama_ffi::StubLlama;
use llama_session::inference::loader::FileLoader;
use llama_session::{GenerationTask, LoadGate, SessionError, TextGeneration};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "llama_session=debug"
    } else {
        "llama_session=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    info!("llama-session v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let mut config = Config::load(&cli.config)?;
    config.apply_cli(&cli);

    info!(
        backend = %config.native.backend,
        native_dir = %config.native.dir.display(),
        model = %config.model.model_path.display(),
        context_size = config.model.context_size,
        batch_size = config.model.batch_size,
        "Configuration loaded"
    );

    // Load the native binaries.
    let gate = LoadGate::new(Arc::new(FileLoader::new()), Arc::new(StubLlama::new()));
    gate.load(&config.binaries())?;

    // Model initialization blocks; keep it off the runtime threads.
    let options = config.create_options();
    let session = {
        let gate = gate.clone();
        tokio::task::spawn_blocking(move || gate.create(options)).await??
    };
    let session = Arc::new(session);

    let result = chat(session.clone()).await;

    session.close();
    info!(state = %gate.state(), "Session closed");

    result
}

async fn chat(session: Arc<TextGeneration>) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            break;
        };

        match line.trim() {
            "" => continue,
            "/quit" | "/exit" => break,
            "/reset" => {
                session.reset().await?;
                println!("(history cleared)");
            }
            "/history" => {
                for message in session.history().await? {
                    println!(
                        "[{}] {}: {}",
                        message.timestamp().format("%H:%M:%S"),
                        message.role(),
                        message.content()
                    );
                }
            }
            prompt => {
                let task = GenerationTask::spawn(session.clone(), prompt);

                let token = task.cancellation_token();
                let interrupt = tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        token.cancel();
                    }
                });

                let outcome = task.join().await;
                interrupt.abort();

                match outcome {
                    Ok(exchange) => println!("{}", exchange.output.content()),
                    Err(SessionError::Cancelled) => println!("(cancelled)"),
                    Err(e) => warn!("{e}"),
                }
            }
        }
    }

    Ok(())
}
