//! The outcome of one command round-trip.

use super::message::{CorrelationToken, EventEnvelope, FormattedValue, KernelEvent};
use crate::kernel::KernelInfo;

/// Every event observed for one command, in arrival order, ending with the
/// terminal `CommandSucceeded` or `CommandFailed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelCommandResult {
    token: CorrelationToken,
    events: Vec<EventEnvelope>,
}

impl KernelCommandResult {
    pub fn new(token: CorrelationToken, events: Vec<EventEnvelope>) -> Self {
        Self { token, events }
    }

    pub fn token(&self) -> &CorrelationToken {
        &self.token
    }

    pub fn events(&self) -> &[EventEnvelope] {
        &self.events
    }

    pub fn into_events(self) -> Vec<EventEnvelope> {
        self.events
    }

    /// The terminal event, if the sequence is complete.
    pub fn terminal_event(&self) -> Option<&KernelEvent> {
        self.events
            .last()
            .map(|e| &e.event)
            .filter(|e| e.is_terminal())
    }

    pub fn succeeded(&self) -> bool {
        matches!(self.terminal_event(), Some(KernelEvent::CommandSucceeded))
    }

    pub fn failure_message(&self) -> Option<&str> {
        match self.terminal_event() {
            Some(KernelEvent::CommandFailed { message }) => Some(message),
            _ => None,
        }
    }

    /// The `text/plain` value of the last `ReturnValueProduced`, falling
    /// back to its first formatted value.
    pub fn return_value(&self) -> Option<&str> {
        self.events
            .iter()
            .rev()
            .find_map(|e| match &e.event {
                KernelEvent::ReturnValueProduced { formatted_values } => Some(formatted_values),
                _ => None,
            })
            .and_then(|values| preferred_text(values))
    }

    /// Concatenated standard output written by the command.
    pub fn standard_output(&self) -> String {
        self.events
            .iter()
            .filter_map(|e| match &e.event {
                KernelEvent::StandardOutputValueProduced { formatted_values } => {
                    preferred_text(formatted_values)
                }
                _ => None,
            })
            .collect()
    }

    /// The root and sub-kernel entries of the first `KernelInfoProduced`.
    pub fn kernel_info_produced(&self) -> Option<(&KernelInfo, &[KernelInfo])> {
        self.events.iter().find_map(|e| match &e.event {
            KernelEvent::KernelInfoProduced {
                kernel_info,
                sub_kernels,
            } => Some((kernel_info, sub_kernels.as_slice())),
            _ => None,
        })
    }
}

fn preferred_text(values: &[FormattedValue]) -> Option<&str> {
    values
        .iter()
        .find(|v| v.mime_type == FormattedValue::PLAIN_TEXT)
        .or_else(|| values.first())
        .map(|v| v.value.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(event: KernelEvent) -> EventEnvelope {
        EventEnvelope::new(
            Some(CorrelationToken::from("t")),
            Some("csharp".into()),
            event,
        )
    }

    #[test]
    fn success_with_return_value() {
        let result = KernelCommandResult::new(
            CorrelationToken::from("t"),
            vec![
                env(KernelEvent::CodeSubmissionReceived { code: "x".into() }),
                env(KernelEvent::ReturnValueProduced {
                    formatted_values: vec![
                        FormattedValue {
                            mime_type: "text/html".into(),
                            value: "<b>42</b>".into(),
                        },
                        FormattedValue::plain_text("42"),
                    ],
                }),
                env(KernelEvent::CommandSucceeded),
            ],
        );
        assert!(result.succeeded());
        assert_eq!(result.failure_message(), None);
        assert_eq!(result.return_value(), Some("42"));
        assert_eq!(result.events().len(), 3);
    }

    #[test]
    fn failure_message_is_exposed() {
        let result = KernelCommandResult::new(
            CorrelationToken::from("t"),
            vec![env(KernelEvent::CommandFailed {
                message: "boom".into(),
            })],
        );
        assert!(!result.succeeded());
        assert_eq!(result.failure_message(), Some("boom"));
        assert_eq!(result.return_value(), None);
    }

    #[test]
    fn standard_output_is_concatenated_in_order() {
        let result = KernelCommandResult::new(
            CorrelationToken::from("t"),
            vec![
                env(KernelEvent::StandardOutputValueProduced {
                    formatted_values: vec![FormattedValue::plain_text("a\n")],
                }),
                env(KernelEvent::StandardOutputValueProduced {
                    formatted_values: vec![FormattedValue::plain_text("b\n")],
                }),
                env(KernelEvent::CommandSucceeded),
            ],
        );
        assert_eq!(result.standard_output(), "a\nb\n");
    }

    #[test]
    fn incomplete_sequence_has_no_terminal() {
        let result = KernelCommandResult::new(
            CorrelationToken::from("t"),
            vec![env(KernelEvent::CodeSubmissionReceived { code: "x".into() })],
        );
        assert!(result.terminal_event().is_none());
        assert!(!result.succeeded());
    }
}
