//! Kernel info registry built from the one-time `RequestKernelInfo`
//! handshake.

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::{debug, info};

use crate::error::ConnectorError;
use crate::kernel::{KernelInfo, KernelTarget};
use crate::protocol::{KernelCommand, KernelEvent};
use crate::transport::StdioTransport;

/// The host's composite kernel plus every named sub-kernel, as reported by
/// the handshake. Read-only once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelRegistry {
    root: KernelInfo,
    sub_kernels: BTreeMap<String, KernelInfo>,
}

impl KernelRegistry {
    /// Validate a handshake payload.
    ///
    /// The root must be composite; every sub-kernel must be non-composite,
    /// have a non-empty name and language, and appear only once.
    pub fn from_handshake(
        root: KernelInfo,
        sub_kernels: Vec<KernelInfo>,
    ) -> Result<Self, ConnectorError> {
        if !root.is_composite {
            return Err(ConnectorError::Handshake(format!(
                "root kernel '{}' is not composite",
                root.local_name
            )));
        }

        let mut by_name = BTreeMap::new();
        for info in sub_kernels {
            if info.local_name.is_empty() {
                return Err(ConnectorError::Handshake(
                    "sub-kernel with an empty name".to_string(),
                ));
            }
            if info.is_composite {
                return Err(ConnectorError::Handshake(format!(
                    "sub-kernel '{}' claims to be composite",
                    info.local_name
                )));
            }
            if info.language_name.as_deref().is_none_or(str::is_empty) {
                return Err(ConnectorError::Handshake(format!(
                    "sub-kernel '{}' has no language name",
                    info.local_name
                )));
            }
            let name = info.local_name.clone();
            if by_name.insert(name.clone(), info).is_some() {
                return Err(ConnectorError::Handshake(format!(
                    "sub-kernel '{name}' reported twice"
                )));
            }
        }

        Ok(Self {
            root,
            sub_kernels: by_name,
        })
    }

    pub fn root(&self) -> &KernelInfo {
        &self.root
    }

    /// Exact-name lookup of a sub-kernel.
    pub fn get(&self, remote_name: &str) -> Option<&KernelInfo> {
        self.sub_kernels.get(remote_name)
    }

    /// Same as [`get`](Self::get) but with the connector's error.
    pub fn resolve(&self, remote_name: &str) -> Result<&KernelInfo, ConnectorError> {
        self.get(remote_name)
            .ok_or_else(|| ConnectorError::RemoteKernelNotFound(remote_name.to_string()))
    }

    /// Sub-kernels in name order.
    pub fn sub_kernels(&self) -> impl Iterator<Item = &KernelInfo> {
        self.sub_kernels.values()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.sub_kernels.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.sub_kernels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sub_kernels.is_empty()
    }
}

/// Send `RequestKernelInfo` to the root and build the registry from the
/// reply, waiting at most `timeout`.
pub async fn perform_handshake(
    transport: &StdioTransport,
    timeout: Duration,
) -> Result<KernelRegistry, ConnectorError> {
    debug!(timeout = ?timeout, "requesting kernel info");
    let result = tokio::time::timeout(
        timeout,
        transport.send(&KernelTarget::Root, KernelCommand::RequestKernelInfo),
    )
    .await
    .map_err(|_| ConnectorError::HandshakeTimeout(timeout))?
    .map_err(|e| match e {
        ConnectorError::ConnectionLost(reason) => {
            ConnectorError::Handshake(format!("kernel host went away: {reason}"))
        }
        other => other,
    })?;

    if let Some(message) = result.failure_message() {
        return Err(ConnectorError::Handshake(message.to_string()));
    }

    let mut produced = result.into_events().into_iter().filter_map(|e| match e.event {
        KernelEvent::KernelInfoProduced {
            kernel_info,
            sub_kernels,
        } => Some((kernel_info, sub_kernels)),
        _ => None,
    });
    let (root, sub_kernels) = produced.next().ok_or_else(|| {
        ConnectorError::Handshake("no KernelInfoProduced event in reply".to_string())
    })?;
    if produced.next().is_some() {
        return Err(ConnectorError::Handshake(
            "more than one KernelInfoProduced event in reply".to_string(),
        ));
    }

    let registry = KernelRegistry::from_handshake(root, sub_kernels)?;
    info!(
        root = %registry.root().local_name,
        sub_kernels = ?registry.names().collect::<Vec<_>>(),
        "kernel info handshake complete"
    );
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CommandEnvelope, EventEnvelope, encode_frame};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, duplex, split};

    fn root() -> KernelInfo {
        KernelInfo::new(".NET").composite()
    }

    fn sub(name: &str, language: &str) -> KernelInfo {
        KernelInfo::new(name).with_language(language, "1.0")
    }

    #[test]
    fn builds_from_valid_payload() {
        let registry =
            KernelRegistry::from_handshake(root(), vec![sub("fsharp", "F#"), sub("csharp", "C#")])
                .unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.names().collect::<Vec<_>>(), ["csharp", "fsharp"]);
        assert_eq!(
            registry.get("csharp").unwrap().language_name.as_deref(),
            Some("C#")
        );
        assert!(registry.root().is_composite);
    }

    #[test]
    fn lookup_is_exact() {
        let registry = KernelRegistry::from_handshake(root(), vec![sub("csharp", "C#")]).unwrap();
        assert!(registry.get("CSharp").is_none());
        assert!(registry.resolve("csharp ").unwrap_err().is_remote_kernel_not_found());
    }

    #[test]
    fn rejects_non_composite_root() {
        let err = KernelRegistry::from_handshake(KernelInfo::new("root"), vec![]).unwrap_err();
        assert!(matches!(err, ConnectorError::Handshake(_)));
    }

    #[test]
    fn rejects_composite_sub_kernel() {
        let err =
            KernelRegistry::from_handshake(root(), vec![sub("csharp", "C#").composite()])
                .unwrap_err();
        assert!(err.to_string().contains("composite"));
    }

    #[test]
    fn rejects_sub_kernel_without_language() {
        let err = KernelRegistry::from_handshake(root(), vec![KernelInfo::new("mystery")])
            .unwrap_err();
        assert!(err.to_string().contains("no language"));
    }

    #[test]
    fn rejects_duplicate_names() {
        let err = KernelRegistry::from_handshake(
            root(),
            vec![sub("csharp", "C#"), sub("csharp", "C#")],
        )
        .unwrap_err();
        assert!(err.to_string().contains("twice"));
    }

    /// Drive `perform_handshake` against an in-memory host that answers the
    /// first command with `reply`.
    async fn handshake_with(
        reply: impl FnOnce(&CommandEnvelope) -> Vec<EventEnvelope> + Send + 'static,
        timeout: Duration,
    ) -> Result<KernelRegistry, ConnectorError> {
        let (ours, theirs) = duplex(64 * 1024);
        let (our_read, our_write) = split(ours);
        let (their_read, mut their_write) = split(theirs);
        let transport = StdioTransport::new(our_read, our_write);

        let host = tokio::spawn(async move {
            let mut lines = BufReader::new(their_read).lines();
            let Some(line) = lines.next_line().await.unwrap() else {
                return;
            };
            let cmd: CommandEnvelope = serde_json::from_str(&line).unwrap();
            assert_eq!(cmd.command, KernelCommand::RequestKernelInfo);
            assert!(cmd.target_kernel_name.is_none());
            for event in reply(&cmd) {
                their_write
                    .write_all(&encode_frame(&event).unwrap())
                    .await
                    .unwrap();
            }
            // Keep the pipe open until the caller is done.
            let _ = lines.next_line().await;
        });

        let result = perform_handshake(&transport, timeout).await;
        drop(transport);
        host.abort();
        result
    }

    #[tokio::test]
    async fn handshake_reads_kernel_info_produced() {
        let registry = handshake_with(
            |cmd| {
                let token = Some(cmd.token.clone());
                vec![
                    EventEnvelope::new(
                        token.clone(),
                        None,
                        KernelEvent::KernelInfoProduced {
                            kernel_info: root(),
                            sub_kernels: vec![sub("csharp", "C#"), sub("fsharp", "F#")],
                        },
                    ),
                    EventEnvelope::new(token, None, KernelEvent::CommandSucceeded),
                ]
            },
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn handshake_command_failure() {
        let err = handshake_with(
            |cmd| {
                vec![EventEnvelope::new(
                    Some(cmd.token.clone()),
                    None,
                    KernelEvent::CommandFailed {
                        message: "not ready".into(),
                    },
                )]
            },
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();
        assert_eq!(err, ConnectorError::Handshake("not ready".into()));
    }

    #[tokio::test]
    async fn handshake_without_kernel_info_fails() {
        let err = handshake_with(
            |cmd| {
                vec![EventEnvelope::new(
                    Some(cmd.token.clone()),
                    None,
                    KernelEvent::CommandSucceeded,
                )]
            },
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("no KernelInfoProduced"));
    }

    #[tokio::test]
    async fn handshake_times_out() {
        let timeout = Duration::from_millis(100);
        let err = handshake_with(|_| Vec::new(), timeout).await.unwrap_err();
        assert_eq!(err, ConnectorError::HandshakeTimeout(timeout));
    }
}
