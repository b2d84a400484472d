//! Command and event envelopes.

use serde::{Deserialize, Serialize};

use crate::kernel::KernelInfo;

/// Links a command to every event it produces.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationToken(String);

impl CorrelationToken {
    /// A fresh random (UUID v4) token.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CorrelationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for CorrelationToken {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl std::fmt::Display for CorrelationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Commands a caller can send to a kernel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "commandType")]
pub enum KernelCommand {
    /// Execute source code in the target kernel.
    SubmitCode { code: String },
    /// Ask the target for its `KernelInfo` (and its sub-kernels', for the
    /// composite kernel).
    RequestKernelInfo,
}

impl KernelCommand {
    pub fn submit_code(code: impl Into<String>) -> Self {
        KernelCommand::SubmitCode { code: code.into() }
    }

    /// The wire name of the command.
    pub fn command_type(&self) -> &'static str {
        match self {
            KernelCommand::SubmitCode { .. } => "SubmitCode",
            KernelCommand::RequestKernelInfo => "RequestKernelInfo",
        }
    }
}

/// A formatted representation of a value, keyed by MIME type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormattedValue {
    pub mime_type: String,
    pub value: String,
}

impl FormattedValue {
    pub const PLAIN_TEXT: &str = "text/plain";

    pub fn plain_text(value: impl Into<String>) -> Self {
        Self {
            mime_type: Self::PLAIN_TEXT.to_string(),
            value: value.into(),
        }
    }
}

/// Events a kernel host emits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "eventType", rename_all_fields = "camelCase")]
pub enum KernelEvent {
    /// Sent once, unsolicited, when the host has started.
    KernelReady,
    /// Response to `RequestKernelInfo`.
    KernelInfoProduced {
        kernel_info: KernelInfo,
        #[serde(default)]
        sub_kernels: Vec<KernelInfo>,
    },
    CodeSubmissionReceived {
        code: String,
    },
    ReturnValueProduced {
        formatted_values: Vec<FormattedValue>,
    },
    StandardOutputValueProduced {
        formatted_values: Vec<FormattedValue>,
    },
    DisplayedValueProduced {
        formatted_values: Vec<FormattedValue>,
    },
    /// Terminal: the command completed.
    CommandSucceeded,
    /// Terminal: the command failed.
    CommandFailed {
        message: String,
    },
}

impl KernelEvent {
    /// `true` for the events that end a command's event sequence.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            KernelEvent::CommandSucceeded | KernelEvent::CommandFailed { .. }
        )
    }

    /// The wire name of the event.
    pub fn event_type(&self) -> &'static str {
        match self {
            KernelEvent::KernelReady => "KernelReady",
            KernelEvent::KernelInfoProduced { .. } => "KernelInfoProduced",
            KernelEvent::CodeSubmissionReceived { .. } => "CodeSubmissionReceived",
            KernelEvent::ReturnValueProduced { .. } => "ReturnValueProduced",
            KernelEvent::StandardOutputValueProduced { .. } => "StandardOutputValueProduced",
            KernelEvent::DisplayedValueProduced { .. } => "DisplayedValueProduced",
            KernelEvent::CommandSucceeded => "CommandSucceeded",
            KernelEvent::CommandFailed { .. } => "CommandFailed",
        }
    }
}

/// A command addressed to a kernel, as written to the host's stdin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandEnvelope {
    pub token: CorrelationToken,
    /// Absent for the composite (root) kernel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_kernel_name: Option<String>,
    pub command: KernelCommand,
}

/// An event read from the host's stdout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    /// Absent for unsolicited events such as `KernelReady`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<CorrelationToken>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_kernel_name: Option<String>,
    pub event: KernelEvent,
}

impl EventEnvelope {
    pub fn new(
        token: Option<CorrelationToken>,
        source_kernel_name: Option<String>,
        event: KernelEvent,
    ) -> Self {
        Self {
            token,
            source_kernel_name,
            event,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn submit_code_wire_shape() {
        let env = CommandEnvelope {
            token: CorrelationToken::from("t-1"),
            target_kernel_name: Some("csharp".into()),
            command: KernelCommand::submit_code("1 + 1"),
        };
        assert_eq!(
            serde_json::to_value(&env).unwrap(),
            json!({
                "token": "t-1",
                "targetKernelName": "csharp",
                "command": {"commandType": "SubmitCode", "code": "1 + 1"}
            })
        );
    }

    #[test]
    fn root_command_omits_target() {
        let env = CommandEnvelope {
            token: CorrelationToken::from("t-2"),
            target_kernel_name: None,
            command: KernelCommand::RequestKernelInfo,
        };
        let value = serde_json::to_value(&env).unwrap();
        assert!(value.get("targetKernelName").is_none());
        assert_eq!(value["command"], json!({"commandType": "RequestKernelInfo"}));

        let back: CommandEnvelope = serde_json::from_value(value).unwrap();
        assert_eq!(back, env);
    }

    #[test]
    fn kernel_info_produced_parses() {
        let raw = json!({
            "token": "t-3",
            "event": {
                "eventType": "KernelInfoProduced",
                "kernelInfo": {"localName": "composite", "isComposite": true},
                "subKernels": [
                    {"localName": "csharp", "languageName": "C#"},
                    {"localName": "fsharp", "languageName": "F#"}
                ]
            }
        });
        let env: EventEnvelope = serde_json::from_value(raw).unwrap();
        match env.event {
            KernelEvent::KernelInfoProduced {
                kernel_info,
                sub_kernels,
            } => {
                assert!(kernel_info.is_composite);
                assert_eq!(sub_kernels.len(), 2);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn unit_events_parse_without_payload() {
        let env: EventEnvelope = serde_json::from_str(
            r#"{"token":"t-4","event":{"eventType":"CommandSucceeded"}}"#,
        )
        .unwrap();
        assert_eq!(env.event, KernelEvent::CommandSucceeded);
        assert!(env.event.is_terminal());

        let ready: EventEnvelope =
            serde_json::from_str(r#"{"event":{"eventType":"KernelReady"}}"#).unwrap();
        assert!(ready.token.is_none());
        assert!(!ready.event.is_terminal());
    }

    #[test]
    fn terminal_events() {
        assert!(
            KernelEvent::CommandFailed {
                message: "boom".into()
            }
            .is_terminal()
        );
        assert!(
            !KernelEvent::ReturnValueProduced {
                formatted_values: vec![]
            }
            .is_terminal()
        );
    }

    #[test]
    fn event_type_matches_wire_tag() {
        let event = KernelEvent::StandardOutputValueProduced {
            formatted_values: vec![FormattedValue::plain_text("hi")],
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["eventType"], event.event_type());
        assert_eq!(value["formattedValues"][0]["mimeType"], "text/plain");
    }

    #[test]
    fn tokens_are_unique() {
        assert_ne!(CorrelationToken::new(), CorrelationToken::new());
    }
}
