//! Spawns the kernel host with stdin/stdout piped for the protocol.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::info;

use crate::error::ConnectorError;

/// How to start the kernel host.
///
/// The command line is `program args... [--verbose] [--log-path PATH]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchConfig {
    /// Executable path or name (looked up on `$PATH`).
    pub program: String,
    /// Tool identifier and mode flag, e.g. `["interactive", "stdio"]`.
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub verbose: bool,
    #[serde(default)]
    pub log_path: Option<PathBuf>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub env_vars: BTreeMap<String, String>,
}

impl LaunchConfig {
    pub const DEFAULT_PROGRAM: &str = "dotnet";

    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            verbose: false,
            log_path: None,
            working_dir: None,
            env_vars: BTreeMap::new(),
        }
    }

    /// `dotnet interactive stdio`.
    pub fn dotnet_interactive() -> Self {
        Self::new(Self::DEFAULT_PROGRAM).args(["interactive", "stdio"])
    }

    /// The usual launch line for `program`: `dotnet interactive stdio` for
    /// `dotnet`, no arguments for anything else.
    pub fn for_program(program: impl Into<String>) -> Self {
        let program = program.into();
        if program == Self::DEFAULT_PROGRAM {
            Self::dotnet_interactive()
        } else {
            Self::new(program)
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.insert(key.into(), value.into());
        self
    }

    /// Full argument list passed to `program`.
    pub fn command_args(&self) -> Vec<String> {
        let mut args = self.args.clone();
        if self.verbose {
            args.push("--verbose".to_string());
        }
        if let Some(path) = &self.log_path {
            args.push("--log-path".to_string());
            args.push(path.display().to_string());
        }
        args
    }
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self::dotnet_interactive()
    }
}

/// A freshly spawned kernel host with its protocol streams taken out.
#[derive(Debug)]
pub struct LaunchedProcess {
    pub pid: u32,
    pub child: Child,
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
}

/// Spawn the kernel host.
///
/// stdin/stdout are piped for the protocol; stderr is inherited so host
/// diagnostics reach the caller's terminal. The child is killed if its
/// `Child` handle is dropped.
pub fn launch(config: &LaunchConfig) -> Result<LaunchedProcess, ConnectorError> {
    let launch_error = |message: String| ConnectorError::Launch {
        program: config.program.clone(),
        message,
    };

    let mut cmd = Command::new(&config.program);
    cmd.args(config.command_args());
    if let Some(dir) = &config.working_dir {
        cmd.current_dir(dir);
    }
    for (key, value) in &config.env_vars {
        cmd.env(key, value);
    }
    cmd.stdin(std::process::Stdio::piped());
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::inherit());
    cmd.kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| launch_error(e.to_string()))?;
    let pid = child
        .id()
        .ok_or_else(|| launch_error("child process has no pid".to_string()))?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| launch_error("child stdin was not piped".to_string()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| launch_error("child stdout was not piped".to_string()))?;

    info!(pid, program = %config.program, args = ?config.command_args(), "launched kernel host");

    Ok(LaunchedProcess {
        pid,
        child,
        stdin,
        stdout,
    })
}
