//! tether - run a language server over a set of files and report diagnostics.
//!
//! ```text
//! tether check server.toml src/a.xml src/b.xml
//! ```
//!
//! The server is started from the TOML configuration, every file is opened,
//! and diagnostics (pushed or pulled) are printed as
//! `path:line:col: severity: message`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

use tether_lsp::protocol::path_to_file_uri;
use tether_lsp::{ClientEvent, ClientOptions, ClientState, DocumentSelector, LanguageClient, TextDocument};

const DEFAULT_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Parser)]
#[command(name = "tether", version, about = "Language server diagnostics from the command line")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Open files in a language server and print its diagnostics.
    Check {
        /// Client configuration (TOML).
        config: PathBuf,
        /// Files to open.
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// How long to wait for diagnostics.
        #[arg(long, default_value_t = DEFAULT_TIMEOUT_SECS)]
        timeout_secs: u64,
    },
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    let outcome = match cli.command {
        Command::Check {
            config,
            files,
            timeout_secs,
        } => check(&config, &files, Duration::from_secs(timeout_secs)).await,
    };

    match outcome {
        Ok(true) => ExitCode::FAILURE,
        Ok(false) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("tether: {e:#}");
            ExitCode::from(2)
        }
    }
}

/// A file handed to the server.
struct OpenFile {
    display: String,
    uri: String,
}

/// Returns whether any error diagnostic was reported.
async fn check(config: &Path, files: &[PathBuf], timeout: Duration) -> Result<bool> {
    let options = ClientOptions::load(config)?;
    let selector = options.document_selector.clone();
    let client = LanguageClient::new(options);
    let mut events = client.subscribe();

    client
        .start()
        .await
        .with_context(|| format!("starting {}", client.name()))?;

    let mut opened = Vec::with_capacity(files.len());
    for path in files {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let absolute = std::path::absolute(path)
            .with_context(|| format!("resolving {}", path.display()))?;
        let uri = path_to_file_uri(&absolute)
            .with_context(|| format!("resolving {}", path.display()))?
            .to_string();
        let language = language_id(selector.as_ref(), &uri, path);
        tracing::debug!(%uri, %language, "opening");
        client
            .did_open(TextDocument::new(uri.clone(), language, 1, text))
            .await;
        opened.push(OpenFile {
            display: path.display().to_string(),
            uri,
        });
    }

    let mut waiting: HashSet<&str> = opened
        .iter()
        .map(|f| f.uri.as_str())
        .filter(|uri| !client.diagnostics().has(uri))
        .collect();
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    while !waiting.is_empty() {
        tokio::select! {
            event = events.recv() => match event {
                Ok(ClientEvent::Diagnostics { uri, .. }) => {
                    waiting.remove(uri.as_str());
                }
                Ok(ClientEvent::StateChanged { new, .. }) if new != ClientState::Running => {
                    tracing::warn!(state = %new, "server is no longer running");
                    break;
                }
                Ok(ClientEvent::ShowMessage { message, .. }) => eprintln!("{}: {message}", client.name()),
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
            () = &mut deadline => {
                tracing::info!(pending = waiting.len(), "timed out waiting for diagnostics");
                break;
            }
        }
    }

    let diagnostics = client.diagnostics();
    let mut has_errors = false;
    for file in &opened {
        for diagnostic in diagnostics.get(&file.uri) {
            has_errors |= diagnostic.severity().is_error();
            println!("{}", diagnostic.display_with_path(&file.display));
        }
    }

    if let Err(e) = client.stop().await {
        tracing::warn!("stopping {} failed: {e}", client.name());
    }
    Ok(has_errors)
}

/// The first selector language that accepts the document, else a guess from
/// the extension.
fn language_id(selector: Option<&DocumentSelector>, uri: &str, path: &Path) -> String {
    if let Some(selector) = selector {
        for language in selector.filters().iter().filter_map(|f| f.language()) {
            if selector.score(&TextDocument::new(uri, language, 1, "")) > 0 {
                return language.to_string();
            }
        }
    }
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    match extension.as_str() {
        "rs" => "rust",
        "py" => "python",
        "js" | "mjs" | "cjs" => "javascript",
        "ts" => "typescript",
        "md" => "markdown",
        "yml" => "yaml",
        "h" => "c",
        "hpp" | "cc" | "cxx" => "cpp",
        "xsd" | "xsl" | "xslt" | "svg" => "xml",
        "" => "plaintext",
        other => other,
    }
    .to_string()
}
