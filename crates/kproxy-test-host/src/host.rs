//! Command loop of the test host: one JSON command per stdin line, events
//! written back to stdout as they are produced.
//!
//! Commands are handled concurrently, so replies to different tokens can
//! interleave. Code starting with `#!` directive lines is preprocessed:
//!
//! - `#!sleep <ms>` delays before evaluating the rest
//! - `#!crash` exits the process immediately
//! - `#!garbage` writes a line that is not a valid frame
//! - `#!handshakes` returns how many `RequestKernelInfo` commands arrived

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use kproxy_core::protocol::{CommandEnvelope, EventEnvelope, decode_frame, encode_frame};
use kproxy_core::{CorrelationToken, FormattedValue, KernelCommand, KernelEvent, KernelInfo};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::kernel::{Kernel, ScriptKernel, SubmitError};

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

pub const ROOT_URI: &str = "kernel://test-host/";
pub const DIRECTIVES: [&str; 4] = ["#!sleep", "#!crash", "#!garbage", "#!handshakes"];

/// Behavior switches, read from the environment by `main`.
#[derive(Debug, Clone, Default)]
pub struct HostOptions {
    /// Never answer `RequestKernelInfo` on the root kernel.
    pub silent_handshake: bool,
    /// Leave this many root `RequestKernelInfo` commands unanswered, then
    /// answer normally.
    pub withheld_handshakes: usize,
}

/// Serialized access to stdout. One frame per write.
pub struct EventWriter {
    writer: Mutex<BoxedWriter>,
}

impl EventWriter {
    pub fn new(writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        Self {
            writer: Mutex::new(Box::new(writer)),
        }
    }

    pub async fn write(&self, envelope: &EventEnvelope) -> std::io::Result<()> {
        let frame = encode_frame(envelope).map_err(std::io::Error::other)?;
        self.write_raw(&frame).await
    }

    pub async fn write_raw(&self, bytes: &[u8]) -> std::io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(bytes).await?;
        writer.flush().await
    }
}

/// Emits events for one command: stamps its token and source kernel.
pub struct EventSink<'a> {
    out: &'a EventWriter,
    token: CorrelationToken,
    source: Option<String>,
}

impl EventSink<'_> {
    pub async fn emit(&self, event: KernelEvent) -> std::io::Result<()> {
        let envelope = EventEnvelope::new(Some(self.token.clone()), self.source.clone(), event);
        self.out.write(&envelope).await
    }
}

pub struct Host {
    out: EventWriter,
    kernels: BTreeMap<String, Arc<dyn Kernel>>,
    default_kernel: String,
    options: HostOptions,
    kernel_info_requests: AtomicUsize,
}

impl Host {
    /// A host with `csharp` (the default) and `fsharp` sub-kernels.
    pub fn new(out: EventWriter, options: HostOptions) -> Self {
        let kernels: [Arc<dyn Kernel>; 2] =
            [Arc::new(ScriptKernel::csharp()), Arc::new(ScriptKernel::fsharp())];
        Self {
            out,
            kernels: kernels
                .into_iter()
                .map(|k| (k.name().to_string(), k))
                .collect(),
            default_kernel: "csharp".to_string(),
            options,
            kernel_info_requests: AtomicUsize::new(0),
        }
    }

    pub fn root_info(&self) -> KernelInfo {
        KernelInfo::new(".NET")
            .composite()
            .with_remote_uri(ROOT_URI)
            .with_directives(DIRECTIVES)
            .with_commands(["SubmitCode", "RequestKernelInfo"])
    }

    pub fn kernel_info_requests(&self) -> usize {
        self.kernel_info_requests.load(Ordering::Acquire)
    }

    /// Announce readiness, then serve commands until `input` hits EOF.
    pub async fn run(self: Arc<Self>, input: impl AsyncRead + Unpin) -> Result<()> {
        self.out
            .write(&EventEnvelope::new(None, None, KernelEvent::KernelReady))
            .await
            .context("failed to announce readiness")?;

        let mut reader = BufReader::new(input);
        let mut line = Vec::new();
        loop {
            line.clear();
            let n = reader
                .read_until(b'\n', &mut line)
                .await
                .context("failed to read from stdin")?;
            if n == 0 {
                info!("stdin closed, shutting down");
                return Ok(());
            }

            let command = match decode_frame::<CommandEnvelope>(&line) {
                Ok(Some(command)) => command,
                Ok(None) => continue,
                Err(e) => {
                    warn!(error = %e, "ignoring malformed command");
                    continue;
                }
            };

            let host = Arc::clone(&self);
            tokio::spawn(async move {
                let token = command.token.clone();
                if let Err(e) = host.handle(command).await {
                    warn!(token = %token, error = %e, "failed to answer command");
                }
            });
        }
    }

    async fn handle(&self, command: CommandEnvelope) -> Result<()> {
        debug!(
            token = %command.token,
            command = command.command.command_type(),
            target = command.target_kernel_name.as_deref().unwrap_or("(root)"),
            "handling command"
        );

        let kernel = match &command.target_kernel_name {
            None => None,
            Some(name) => match self.kernels.get(name) {
                Some(kernel) => Some(Arc::clone(kernel)),
                None => {
                    let sink = self.sink(&command.token, None);
                    sink.emit(KernelEvent::CommandFailed {
                        message: format!("kernel not found: {name}"),
                    })
                    .await?;
                    return Ok(());
                }
            },
        };
        let sink = self.sink(
            &command.token,
            kernel.as_ref().map(|k| k.name().to_string()),
        );

        let outcome = match command.command {
            KernelCommand::RequestKernelInfo => {
                self.request_kernel_info(kernel.as_deref(), &sink).await?
            }
            KernelCommand::SubmitCode { code } => {
                Some(self.submit_code(kernel.as_deref(), &code, &sink).await)
            }
        };

        let terminal = match outcome {
            None => return Ok(()),
            Some(Ok(())) => KernelEvent::CommandSucceeded,
            Some(Err(SubmitError::Failed(message))) => KernelEvent::CommandFailed { message },
            Some(Err(SubmitError::Write(e))) => return Err(e.into()),
        };
        sink.emit(terminal).await?;
        Ok(())
    }

    fn sink(&self, token: &CorrelationToken, source: Option<String>) -> EventSink<'_> {
        EventSink {
            out: &self.out,
            token: token.clone(),
            source,
        }
    }

    /// `None` means "do not answer at all".
    async fn request_kernel_info(
        &self,
        kernel: Option<&dyn Kernel>,
        sink: &EventSink<'_>,
    ) -> std::io::Result<Option<Result<(), SubmitError>>> {
        let event = match kernel {
            Some(kernel) => KernelEvent::KernelInfoProduced {
                kernel_info: kernel.info(),
                sub_kernels: Vec::new(),
            },
            None => {
                let count = self.kernel_info_requests.fetch_add(1, Ordering::AcqRel) + 1;
                if self.options.silent_handshake || count <= self.options.withheld_handshakes {
                    info!(count, "withholding kernel info");
                    return Ok(None);
                }
                KernelEvent::KernelInfoProduced {
                    kernel_info: self.root_info(),
                    sub_kernels: self.kernels.values().map(|k| k.info()).collect(),
                }
            }
        };
        sink.emit(event).await?;
        Ok(Some(Ok(())))
    }

    async fn submit_code(
        &self,
        kernel: Option<&dyn Kernel>,
        code: &str,
        sink: &EventSink<'_>,
    ) -> Result<(), SubmitError> {
        sink.emit(KernelEvent::CodeSubmissionReceived {
            code: code.to_string(),
        })
        .await?;

        let mut rest = Vec::new();
        for line in code.lines() {
            match line.trim().strip_prefix("#!") {
                Some(directive) => self.directive(directive.trim(), sink).await?,
                None => rest.push(line),
            }
        }
        let rest = rest.join("\n");
        if rest.trim().is_empty() {
            return Ok(());
        }

        let kernel = match kernel {
            Some(kernel) => kernel,
            None => self
                .kernels
                .get(&self.default_kernel)
                .map(|k| &**k)
                .ok_or_else(|| SubmitError::Failed("no default kernel".to_string()))?,
        };
        kernel.submit_code(&rest, sink).await
    }

    async fn directive(&self, directive: &str, sink: &EventSink<'_>) -> Result<(), SubmitError> {
        let (name, arg) = directive
            .split_once(char::is_whitespace)
            .map(|(n, a)| (n, a.trim()))
            .unwrap_or((directive, ""));
        match name {
            "sleep" => {
                let ms: u64 = arg
                    .parse()
                    .map_err(|_| SubmitError::Failed(format!("invalid sleep duration: {arg}")))?;
                tokio::time::sleep(Duration::from_millis(ms)).await;
            }
            "crash" => {
                warn!("crash requested, exiting");
                std::process::exit(70);
            }
            "garbage" => {
                self.out.write_raw(b"{this is not a frame\n").await?;
            }
            "handshakes" => {
                sink.emit(KernelEvent::ReturnValueProduced {
                    formatted_values: vec![FormattedValue::plain_text(
                        self.kernel_info_requests().to_string(),
                    )],
                })
                .await?;
            }
            other => {
                return Err(SubmitError::Failed(format!("unknown directive: #!{other}")));
            }
        }
        Ok(())
    }
}
