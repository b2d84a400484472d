use std::env;
use std::time::Duration;

use crate::error::ConnectorError;
use crate::process::launcher::LaunchConfig;
use crate::process::owner::TerminationPolicy;

pub const HOST_BINARY_VAR: &str = "KPROXY_HOST_BINARY";
pub const HOST_ARGS_VAR: &str = "KPROXY_HOST_ARGS";
pub const HANDSHAKE_TIMEOUT_VAR: &str = "KPROXY_HANDSHAKE_TIMEOUT_SECS";

/// Connector settings taken from the environment. `None` means the variable
/// is not set.
///
/// - `KPROXY_HOST_BINARY` names the host program (blank counts as unset).
/// - `KPROXY_HOST_ARGS` is its argument list, whitespace separated.
/// - `KPROXY_HANDSHAKE_TIMEOUT_SECS` is the handshake wait in whole seconds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvOverrides {
    pub program: Option<String>,
    pub args: Option<Vec<String>>,
    pub handshake_timeout: Option<Duration>,
}

impl EnvOverrides {
    pub fn read() -> Result<Self, ConnectorError> {
        Self::read_with(|key| env::var(key).ok())
    }

    /// Same as [`read`](Self::read) with an injectable lookup, so tests need
    /// not touch the process environment.
    pub fn read_with(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConnectorError> {
        let program = lookup(HOST_BINARY_VAR)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        let args = lookup(HOST_ARGS_VAR)
            .map(|s| s.split_whitespace().map(str::to_owned).collect());
        let handshake_timeout = match lookup(HANDSHAKE_TIMEOUT_VAR) {
            Some(raw) => {
                let secs = raw.trim().parse().map_err(|_| {
                    ConnectorError::InvalidConfig(format!(
                        "{HANDSHAKE_TIMEOUT_VAR} must be a whole number of seconds, got '{raw}'"
                    ))
                })?;
                Some(Duration::from_secs(secs))
            }
            None => None,
        };
        Ok(Self {
            program,
            args,
            handshake_timeout,
        })
    }
}

/// Everything a connector needs: how to launch the host, how long to wait
/// for the handshake, and how hard to push when shutting it down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorConfig {
    pub launch: LaunchConfig,
    pub handshake_timeout: Duration,
    pub termination: TerminationPolicy,
}

impl ConnectorConfig {
    /// Default bounded wait for the kernel info handshake.
    pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

    /// Build a config around an explicit launch command (useful for tests
    /// and CLI flags).
    pub fn new(launch: LaunchConfig) -> Self {
        Self {
            launch,
            handshake_timeout: Self::DEFAULT_HANDSHAKE_TIMEOUT,
            termination: TerminationPolicy::default(),
        }
    }

    /// Build a config from the environment (see [`EnvOverrides`]).
    ///
    /// Without `KPROXY_HOST_ARGS` the program gets its usual arguments:
    /// `interactive stdio` for `dotnet`, none otherwise. An unparseable
    /// timeout is an error.
    pub fn from_env() -> Result<Self, ConnectorError> {
        Ok(Self::from_env_overrides(&EnvOverrides::read()?))
    }

    /// Same as [`from_env`](Self::from_env) with an injectable lookup.
    pub fn from_env_with(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConnectorError> {
        Ok(Self::from_env_overrides(&EnvOverrides::read_with(lookup)?))
    }

    pub fn from_env_overrides(env: &EnvOverrides) -> Self {
        let program = env.program.as_deref().unwrap_or(LaunchConfig::DEFAULT_PROGRAM);
        let mut launch = LaunchConfig::for_program(program);
        if let Some(args) = &env.args {
            launch.args = args.clone();
        }
        Self::new(launch).with_handshake_timeout(
            env.handshake_timeout
                .unwrap_or(Self::DEFAULT_HANDSHAKE_TIMEOUT),
        )
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_termination(mut self, termination: TerminationPolicy) -> Self {
        self.termination = termination;
        self
    }
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self::new(LaunchConfig::default())
    }
}

impl From<LaunchConfig> for ConnectorConfig {
    fn from(launch: LaunchConfig) -> Self {
        Self::new(launch)
    }
}
