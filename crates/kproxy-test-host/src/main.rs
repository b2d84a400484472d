//! `kproxy-test-host`: a scripted kernel host speaking the stdio protocol.
//!
//! Stands in for a real polyglot kernel host in integration tests. It
//! exposes a composite kernel with `csharp` and `fsharp` sub-kernels.
//!
//! Environment switches:
//!
//! - `KPROXY_TEST_HOST_SILENT_HANDSHAKE=1` never answers the root
//!   `RequestKernelInfo`
//! - `KPROXY_TEST_HOST_WITHHOLD_HANDSHAKES=<n>` leaves the first `n` root
//!   `RequestKernelInfo` commands unanswered
//! - `KPROXY_TEST_HOST_IGNORE_SIGTERM=1` survives SIGTERM (only SIGKILL
//!   stops it)

mod host;
mod kernel;

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::info;

use host::{EventWriter, Host, HostOptions};

const SILENT_HANDSHAKE_VAR: &str = "KPROXY_TEST_HOST_SILENT_HANDSHAKE";
const WITHHOLD_HANDSHAKES_VAR: &str = "KPROXY_TEST_HOST_WITHHOLD_HANDSHAKES";
const IGNORE_SIGTERM_VAR: &str = "KPROXY_TEST_HOST_IGNORE_SIGTERM";

#[derive(Parser, Debug)]
#[command(name = "kproxy-test-host", version, about = "Scripted kernel host for kproxy tests")]
struct Args {
    /// Transport mode; only `stdio` is supported.
    #[arg(default_value = "stdio")]
    mode: String,

    /// Log at debug level.
    #[arg(long)]
    verbose: bool,

    /// Append logs to this file instead of stderr.
    #[arg(long)]
    log_path: Option<PathBuf>,
}

fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

fn env_count(key: &str) -> Result<usize> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{key} must be a whole number, got '{raw}'")),
        Err(_) => Ok(0),
    }
}

fn init_tracing(args: &Args) -> Result<()> {
    let filter = if args.verbose {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"))
    };
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false);

    // stdout carries the protocol; logs never go there.
    match &args.log_path {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            builder.with_writer(Mutex::new(file)).init();
        }
        None => builder.with_writer(std::io::stderr).init(),
    }
    Ok(())
}

#[cfg(unix)]
fn ignore_sigterm() -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut term = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    tokio::spawn(async move {
        while term.recv().await.is_some() {
            tracing::warn!("ignoring SIGTERM");
        }
    });
    Ok(())
}

#[cfg(not(unix))]
fn ignore_sigterm() -> Result<()> {
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args)?;

    if args.mode != "stdio" {
        bail!("unsupported mode '{}'; only 'stdio' is available", args.mode);
    }
    if env_flag(IGNORE_SIGTERM_VAR) {
        ignore_sigterm()?;
    }

    let options = HostOptions {
        silent_handshake: env_flag(SILENT_HANDSHAKE_VAR),
        withheld_handshakes: env_count(WITHHOLD_HANDSHAKES_VAR)?,
    };
    info!(pid = std::process::id(), ?options, "test host starting");

    let host = Arc::new(Host::new(EventWriter::new(tokio::io::stdout()), options));
    host.run(tokio::io::stdin()).await
}
