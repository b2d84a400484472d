//! `kproxy submit`: send code to one kernel and stream its output.

use std::io::{Read, Write};

use anyhow::{Context, Result, bail};
use futures::StreamExt;
use tracing::debug;

use kproxy_core::{ConnectorConfig, FormattedValue, KernelCommand, KernelEvent, StdioKernelConnector};

/// Read the code argument, or stdin when it is `-`.
pub fn read_code(code: &str) -> Result<String> {
    if code != "-" {
        return Ok(code.to_string());
    }
    let mut buf = String::new();
    std::io::stdin()
        .read_to_string(&mut buf)
        .context("failed to read code from stdin")?;
    Ok(buf)
}

pub async fn run_submit(
    config: ConnectorConfig,
    kernel: Option<&str>,
    local_name: Option<&str>,
    code: &str,
) -> Result<()> {
    let connector = StdioKernelConnector::new(config);
    let proxy = match kernel {
        Some(name) => connector.create_proxy_kernel(name, local_name).await,
        None => connector.create_root_proxy_kernel().await,
    }
    .context("failed to create proxy kernel")?;

    debug!(proxy = %proxy.name(), pid = ?connector.process_id(), "submitting code");
    let mut events = proxy.send_streaming(KernelCommand::submit_code(code));
    let mut failure = None;
    let mut stdout = std::io::stdout();
    while let Some(event) = events.next().await {
        let event = event.context("lost connection while waiting for results")?;
        if let KernelEvent::CommandFailed { message } = &event.event {
            failure = Some(message.clone());
        }
        if let Some(text) = render_event(&event.event) {
            stdout.write_all(text.as_bytes())?;
            stdout.flush()?;
        }
    }

    proxy.dispose();
    connector.wait_for_exit().await;

    if let Some(message) = failure {
        bail!("command failed in kernel '{}': {message}", proxy.name());
    }
    Ok(())
}

/// What to print for one event; `None` for bookkeeping events.
fn render_event(event: &KernelEvent) -> Option<String> {
    match event {
        KernelEvent::StandardOutputValueProduced { formatted_values } => {
            plain(formatted_values).map(str::to_owned)
        }
        KernelEvent::ReturnValueProduced { formatted_values }
        | KernelEvent::DisplayedValueProduced { formatted_values } => {
            plain(formatted_values).map(|v| format!("{v}\n"))
        }
        _ => None,
    }
}

fn plain(values: &[FormattedValue]) -> Option<&str> {
    values
        .iter()
        .find(|v| v.mime_type == FormattedValue::PLAIN_TEXT)
        .or_else(|| values.first())
        .map(|v| v.value.as_str())
}
