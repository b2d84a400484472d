//! Error type shared by every connector operation.

use std::time::Duration;

/// Errors surfaced by the connector, its transport, and its proxies.
///
/// The enum is `Clone` so a launch failure can be cached on the connector
/// and returned to every later caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectorError {
    /// The kernel host executable could not be started.
    #[error("failed to launch kernel host '{program}': {message}")]
    Launch { program: String, message: String },

    /// The kernel info handshake failed (command failure, bad payload, or
    /// the host went away first).
    #[error("kernel info handshake failed: {0}")]
    Handshake(String),

    /// No kernel info arrived within the bounded wait.
    #[error("kernel info handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    /// The requested sub-kernel is not in the handshake registry.
    #[error("remote kernel not found: {0}")]
    RemoteKernelNotFound(String),

    /// Another live proxy on this connector already uses the name.
    #[error("a proxy kernel named '{0}' is already live on this connector")]
    DuplicateProxyName(String),

    /// The proxy was disposed before the operation.
    #[error("proxy kernel '{0}' has been disposed")]
    ProxyDisposed(String),

    /// The kernel host process has been (or is being) terminated; the
    /// connector is single-use.
    #[error("kernel host process has terminated; create a new connector")]
    ProcessTerminated,

    /// The stdio channel is gone: EOF, read failure, malformed frame, or a
    /// failed write.
    #[error("connection to kernel host lost: {0}")]
    ConnectionLost(String),

    /// A configuration value (usually from the environment) is unusable.
    #[error("invalid connector configuration: {0}")]
    InvalidConfig(String),

    /// A command could not be serialized into a frame.
    #[error("failed to encode command frame: {0}")]
    Encode(String),
}

impl ConnectorError {
    /// `true` when the whole connector is unusable and must be recreated.
    pub fn is_connection_lost(&self) -> bool {
        matches!(
            self,
            ConnectorError::ConnectionLost(_) | ConnectorError::ProcessTerminated
        )
    }

    /// `true` when the caller asked for a sub-kernel name the host does not
    /// have. The connector stays usable.
    pub fn is_remote_kernel_not_found(&self) -> bool {
        matches!(self, ConnectorError::RemoteKernelNotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_lost_is_classified() {
        assert!(ConnectorError::ConnectionLost("eof".into()).is_connection_lost());
        assert!(ConnectorError::ProcessTerminated.is_connection_lost());
        assert!(!ConnectorError::RemoteKernelNotFound("x".into()).is_connection_lost());
    }

    #[test]
    fn remote_kernel_not_found_is_classified() {
        let err = ConnectorError::RemoteKernelNotFound("non-existent".into());
        assert!(err.is_remote_kernel_not_found());
        assert_eq!(err.to_string(), "remote kernel not found: non-existent");
    }

    #[test]
    fn launch_error_mentions_program() {
        let err = ConnectorError::Launch {
            program: "/nope/dotnet".into(),
            message: "No such file or directory".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("/nope/dotnet"), "unexpected message: {msg}");
    }
}
