//! Configuration file management for kproxy.
//!
//! Provides a TOML-based config file at `~/.config/kproxy/config.toml` and a
//! resolution chain: CLI flag > env var > config file > default.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use kproxy_core::{ConnectorConfig, EnvOverrides, LaunchConfig, TerminationPolicy};

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigFile {
    pub host: HostSection,
    #[serde(default)]
    pub connector: ConnectorSection,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostSection {
    /// Kernel host executable.
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub verbose: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_path: Option<PathBuf>,
}

impl HostSection {
    /// `dotnet interactive stdio` for `dotnet`, no arguments otherwise.
    pub fn for_program(program: &str) -> Self {
        Self {
            program: program.to_string(),
            args: LaunchConfig::for_program(program).args,
            verbose: false,
            log_path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectorSection {
    pub handshake_timeout_secs: u64,
    pub terminate_grace_secs: u64,
    pub kill_grace_secs: u64,
}

impl Default for ConnectorSection {
    fn default() -> Self {
        let termination = TerminationPolicy::default();
        Self {
            handshake_timeout_secs: ConnectorConfig::DEFAULT_HANDSHAKE_TIMEOUT.as_secs(),
            terminate_grace_secs: termination.terminate_grace.as_secs(),
            kill_grace_secs: termination.kill_grace.as_secs(),
        }
    }
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the kproxy config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/kproxy` or `~/.config/kproxy`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("kproxy");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("kproxy")
}

/// Return the path to the kproxy config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file. Returns an error if it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents)
        .with_context(|| format!("failed to parse config file at {}", path.display()))?;
    Ok(config)
}

/// Serialize and write the config file, creating parent dirs as needed.
pub fn save_config(config: &ConfigFile) -> Result<PathBuf> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;
    Ok(path)
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Host-related CLI flags; `None`/empty means "not given".
#[derive(Debug, Default, Clone)]
pub struct HostOverrides {
    pub program: Option<String>,
    pub args: Vec<String>,
    pub verbose: bool,
    pub log_path: Option<PathBuf>,
    pub handshake_timeout_secs: Option<u64>,
}

/// Resolve the connector configuration using the chain:
/// CLI flag > env var > config file > default.
///
/// A missing config file is not an error; a malformed one is.
pub fn resolve(overrides: &HostOverrides) -> Result<ConnectorConfig> {
    let path = config_path();
    let file = if path.exists() {
        Some(load_config()?)
    } else {
        None
    };
    resolve_with(overrides, |key| std::env::var(key).ok(), file.as_ref())
}

/// [`resolve`] with the environment and config file supplied by the caller.
///
/// - program: `--host` > `KPROXY_HOST_BINARY` > `host.program` > `dotnet`
/// - args: `--host-arg` > `KPROXY_HOST_ARGS` > `host.args` (when the file
///   also supplied the program) > the program's defaults
/// - handshake timeout: `--handshake-timeout` > `KPROXY_HANDSHAKE_TIMEOUT_SECS`
///   > `connector.handshake_timeout_secs` > 30s
pub fn resolve_with(
    overrides: &HostOverrides,
    env: impl Fn(&str) -> Option<String>,
    file: Option<&ConfigFile>,
) -> Result<ConnectorConfig> {
    let env = EnvOverrides::read_with(env)?;

    let (program, file_host) = if let Some(program) = &overrides.program {
        (program.clone(), None)
    } else if let Some(program) = &env.program {
        (program.clone(), None)
    } else if let Some(cfg) = file {
        (cfg.host.program.clone(), Some(&cfg.host))
    } else {
        (LaunchConfig::DEFAULT_PROGRAM.to_string(), None)
    };

    let args = if !overrides.args.is_empty() {
        overrides.args.clone()
    } else if let Some(args) = &env.args {
        args.clone()
    } else if let Some(host) = file_host {
        host.args.clone()
    } else {
        LaunchConfig::for_program(&program).args
    };

    let mut launch = LaunchConfig::new(program).args(args);
    launch.verbose = overrides.verbose || file.is_some_and(|cfg| cfg.host.verbose);
    launch.log_path = overrides
        .log_path
        .clone()
        .or_else(|| file.and_then(|cfg| cfg.host.log_path.clone()));

    let section = file.map(|cfg| cfg.connector.clone()).unwrap_or_default();
    let handshake_timeout = overrides
        .handshake_timeout_secs
        .map(Duration::from_secs)
        .or(env.handshake_timeout)
        .unwrap_or(Duration::from_secs(section.handshake_timeout_secs));

    Ok(ConnectorConfig::new(launch)
        .with_handshake_timeout(handshake_timeout)
        .with_termination(TerminationPolicy {
            terminate_grace: Duration::from_secs(section.terminate_grace_secs),
            kill_grace: Duration::from_secs(section.kill_grace_secs),
        }))
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
