mod config;
mod info_cmd;
mod submit_cmd;
#[cfg(test)]
mod test_util;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use config::HostOverrides;

#[derive(Parser)]
#[command(
    name = "kproxy",
    version,
    about = "Drive a polyglot kernel host over stdio"
)]
struct Cli {
    /// Kernel host executable (overrides KPROXY_HOST_BINARY env var)
    #[arg(long)]
    host: Option<String>,

    /// Argument for the kernel host; repeat for several
    #[arg(long = "host-arg", allow_hyphen_values = true)]
    host_args: Vec<String>,

    /// Pass --verbose to the kernel host
    #[arg(long)]
    host_verbose: bool,

    /// Pass --log-path to the kernel host
    #[arg(long)]
    host_log_path: Option<PathBuf>,

    /// Seconds to wait for the kernel info handshake
    #[arg(long)]
    handshake_timeout: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a kproxy config file
    Init {
        /// Kernel host executable to record
        #[arg(long, default_value = "dotnet")]
        host: String,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Show the kernel host's composite kernel and sub-kernels
    Info {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Submit code and print what it produces
    Submit {
        /// Sub-kernel to run in (default: the composite kernel)
        #[arg(long)]
        kernel: Option<String>,
        /// Local name for the proxy kernel
        #[arg(long = "as", requires = "kernel")]
        local_name: Option<String>,
        /// Code to run, or `-` to read it from stdin
        code: String,
    },
}

impl Cli {
    fn overrides(&self) -> HostOverrides {
        HostOverrides {
            program: self.host.clone(),
            args: self.host_args.clone(),
            verbose: self.host_verbose,
            log_path: self.host_log_path.clone(),
            handshake_timeout_secs: self.handshake_timeout,
        }
    }
}

fn cmd_init(host: &str, force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let cfg = config::ConfigFile {
        host: config::HostSection::for_program(host),
        connector: config::ConnectorSection::default(),
    };
    let path = config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  host.program = {}", cfg.host.program);
    println!("  host.args = {:?}", cfg.host.args);
    println!();
    println!("Next: run `kproxy info` to check the kernel host.");

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout carries command output; diagnostics go to stderr.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Init { host, force } => {
            cmd_init(host, *force)?;
        }
        Commands::Info { json } => {
            let resolved = config::resolve(&cli.overrides())?;
            info_cmd::run_info(resolved, *json).await?;
        }
        Commands::Submit {
            kernel,
            local_name,
            code,
        } => {
            let resolved = config::resolve(&cli.overrides())?;
            let code = submit_cmd::read_code(code)?;
            submit_cmd::run_submit(resolved, kernel.as_deref(), local_name.as_deref(), &code)
                .await?;
        }
    }

    Ok(())
}
