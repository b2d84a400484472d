//! Stdio transport: framed writes to the host's stdin and one continuous
//! read loop over its stdout that routes events by correlation token.
//!
//! ```text
//! send_streaming(target, cmd)
//!     |  register token -> pending table
//!     |  write frame (writer mutex held for the whole frame)
//!     v
//! read_loop --decode line--> route(token) --> mpsc --> caller's stream
//! ```
//!
//! When the read loop stops (EOF, read error, malformed frame) the
//! transport closes for good: pending requests are dropped, so their
//! streams end with `ConnectionLost`, and later sends fail fast.

mod pending;

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::{Stream, StreamExt};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::ConnectorError;
use crate::kernel::KernelTarget;
use crate::protocol::{
    CommandEnvelope, CorrelationToken, EventEnvelope, KernelCommand, KernelCommandResult,
    decode_frame, encode_frame,
};

use pending::PendingTable;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Events for one command, ending after the terminal event or with an error.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<EventEnvelope, ConnectorError>> + Send>>;

struct TransportInner {
    writer: Mutex<BoxedWriter>,
    pending: PendingTable,
    close_expected: AtomicBool,
}

/// Duplex message channel over a child's stdin/stdout (or any
/// reader/writer pair, which is how the tests drive it).
pub struct StdioTransport {
    inner: Arc<TransportInner>,
    reader_task: JoinHandle<()>,
}

impl std::fmt::Debug for StdioTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdioTransport")
            .field("pending", &self.inner.pending.len())
            .field("closed", &self.inner.pending.close_reason())
            .finish()
    }
}

impl StdioTransport {
    /// Start the read loop over `reader` and take ownership of `writer`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let inner = Arc::new(TransportInner {
            writer: Mutex::new(Box::new(writer)),
            pending: PendingTable::default(),
            close_expected: AtomicBool::new(false),
        });
        let reader_task = tokio::spawn(read_loop(BufReader::new(reader), Arc::clone(&inner)));
        Self { inner, reader_task }
    }

    /// Send `command` to `target` and stream back its events as they arrive.
    ///
    /// Dropping the stream stops waiting; the command is not retracted and
    /// any further events for it are discarded.
    pub fn send_streaming(&self, target: &KernelTarget, command: KernelCommand) -> EventStream {
        self.stream_for(CorrelationToken::new(), target, command)
    }

    /// Send `command` to `target` and wait for its terminal event.
    pub async fn send(
        &self,
        target: &KernelTarget,
        command: KernelCommand,
    ) -> Result<KernelCommandResult, ConnectorError> {
        let token = CorrelationToken::new();
        let mut stream = self.stream_for(token.clone(), target, command);
        let mut events = Vec::new();
        while let Some(event) = stream.next().await {
            events.push(event?);
        }
        Ok(KernelCommandResult::new(token, events))
    }

    /// `Some(reason)` once the read loop has stopped.
    pub fn close_reason(&self) -> Option<String> {
        self.inner.pending.close_reason()
    }

    pub fn is_closed(&self) -> bool {
        self.close_reason().is_some()
    }

    /// Note that the far end is being shut down on purpose, so the coming
    /// end of stream is routine.
    pub fn expect_close(&self) {
        self.inner.close_expected.store(true, Ordering::Release);
    }

    pub fn close_expected(&self) -> bool {
        self.inner.close_expected.load(Ordering::Acquire)
    }

    /// Number of commands still awaiting their terminal event.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    fn stream_for(
        &self,
        token: CorrelationToken,
        target: &KernelTarget,
        command: KernelCommand,
    ) -> EventStream {
        let inner = Arc::clone(&self.inner);
        let envelope = CommandEnvelope {
            token: token.clone(),
            target_kernel_name: target.remote_name().map(str::to_owned),
            command,
        };

        Box::pin(async_stream::stream! {
            let frame = match encode_frame(&envelope) {
                Ok(frame) => frame,
                Err(e) => {
                    yield Err(ConnectorError::Encode(e.to_string()));
                    return;
                }
            };

            // Register before writing so a fast reply cannot be missed.
            let (_registration, mut events) = match inner.pending.register(token.clone()) {
                Ok(registered) => registered,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };

            debug!(
                token = %token,
                command = envelope.command.command_type(),
                target = envelope.target_kernel_name.as_deref().unwrap_or(""),
                "writing command frame"
            );
            if let Err(e) = inner.write_frame(&frame).await {
                yield Err(e);
                return;
            }

            while let Some(event) = events.recv().await {
                let terminal = event.event.is_terminal();
                yield Ok(event);
                if terminal {
                    return;
                }
            }

            let reason = inner
                .pending
                .close_reason()
                .unwrap_or_else(|| "request abandoned by transport".to_string());
            yield Err(ConnectorError::ConnectionLost(reason));
        })
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

impl TransportInner {
    async fn write_frame(&self, frame: &[u8]) -> Result<(), ConnectorError> {
        if let Some(reason) = self.pending.close_reason() {
            return Err(ConnectorError::ConnectionLost(reason));
        }
        let mut writer = self.writer.lock().await;
        let written = match writer.write_all(frame).await {
            Ok(()) => writer.flush().await,
            Err(e) => Err(e),
        };
        written.map_err(|e| {
            warn!(error = %e, "failed to write frame to kernel host");
            ConnectorError::ConnectionLost(format!("failed to write to kernel host: {e}"))
        })
    }
}

async fn read_loop<R>(mut reader: BufReader<R>, inner: Arc<TransportInner>)
where
    R: AsyncRead + Unpin,
{
    let mut line = Vec::new();
    let reason = loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break "kernel host closed its output stream".to_string(),
            Ok(_) => match decode_frame::<EventEnvelope>(&line) {
                Ok(Some(envelope)) => inner.pending.route(envelope),
                Ok(None) => continue,
                Err(e) => {
                    warn!(
                        line = %String::from_utf8_lossy(&line).trim(),
                        error = %e,
                        "malformed frame from kernel host"
                    );
                    break format!("malformed frame from kernel host: {e}");
                }
            },
            Err(e) => break format!("error reading from kernel host: {e}"),
        }
    };

    if inner.close_expected.load(Ordering::Acquire) {
        debug!(reason = %reason, "stdio transport closed");
    } else {
        warn!(reason = %reason, "stdio transport closed");
    }
    inner.pending.close(reason);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{FormattedValue, KernelEvent};
    use std::time::Duration;
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf, duplex, split};

    /// The far end of the pipe, standing in for a kernel host.
    struct FakeHost {
        lines: tokio::io::Lines<BufReader<ReadHalf<DuplexStream>>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl FakeHost {
        async fn next_command(&mut self) -> CommandEnvelope {
            let line = self.lines.next_line().await.unwrap().expect("host stdin closed");
            serde_json::from_str(&line).unwrap()
        }

        async fn emit(&mut self, token: Option<&CorrelationToken>, event: KernelEvent) {
            let envelope = EventEnvelope::new(token.cloned(), None, event);
            self.writer
                .write_all(&encode_frame(&envelope).unwrap())
                .await
                .unwrap();
        }

        async fn emit_raw(&mut self, raw: &[u8]) {
            self.writer.write_all(raw).await.unwrap();
        }
    }

    fn connect() -> (StdioTransport, FakeHost) {
        let (ours, theirs) = duplex(64 * 1024);
        let (our_read, our_write) = split(ours);
        let (their_read, their_write) = split(theirs);
        let transport = StdioTransport::new(our_read, our_write);
        let host = FakeHost {
            lines: BufReader::new(their_read).lines(),
            writer: their_write,
        };
        (transport, host)
    }

    fn value(text: &str) -> KernelEvent {
        KernelEvent::ReturnValueProduced {
            formatted_values: vec![FormattedValue::plain_text(text)],
        }
    }

    #[tokio::test]
    async fn routes_events_to_the_sender_in_order() {
        let (transport, mut host) = connect();

        let host_task = tokio::spawn(async move {
            let cmd = host.next_command().await;
            assert_eq!(cmd.target_kernel_name.as_deref(), Some("csharp"));
            host.emit(
                Some(&cmd.token),
                KernelEvent::CodeSubmissionReceived { code: "1".into() },
            )
            .await;
            host.emit(Some(&cmd.token), value("1")).await;
            host.emit(Some(&cmd.token), KernelEvent::CommandSucceeded).await;
            host
        });

        let result = transport
            .send(&KernelTarget::named("csharp"), KernelCommand::submit_code("1"))
            .await
            .unwrap();
        host_task.await.unwrap();

        assert!(result.succeeded());
        assert_eq!(result.events().len(), 3);
        assert_eq!(result.return_value(), Some("1"));
        assert_eq!(transport.pending_count(), 0);
    }

    #[tokio::test]
    async fn concurrent_requests_are_demultiplexed_out_of_order() {
        let (transport, mut host) = connect();

        let host_task = tokio::spawn(async move {
            let first = host.next_command().await;
            let second = host.next_command().await;
            // Answer in reverse order, interleaved.
            host.emit(Some(&second.token), value("second")).await;
            host.emit(Some(&first.token), value("first")).await;
            host.emit(Some(&second.token), KernelEvent::CommandSucceeded).await;
            host.emit(Some(&first.token), KernelEvent::CommandSucceeded).await;
            host
        });

        let (a, b) = tokio::join!(
            transport.send(&KernelTarget::Root, KernelCommand::submit_code("a")),
            async {
                // Make sure "a" is written first.
                tokio::time::sleep(Duration::from_millis(20)).await;
                transport
                    .send(&KernelTarget::Root, KernelCommand::submit_code("b"))
                    .await
            }
        );
        host_task.await.unwrap();

        assert_eq!(a.unwrap().return_value(), Some("first"));
        assert_eq!(b.unwrap().return_value(), Some("second"));
    }

    #[tokio::test]
    async fn unmatched_and_unsolicited_events_are_discarded() {
        let (transport, mut host) = connect();

        let host_task = tokio::spawn(async move {
            host.emit(None, KernelEvent::KernelReady).await;
            let cmd = host.next_command().await;
            host.emit(Some(&CorrelationToken::from("nobody")), value("stray"))
                .await;
            host.emit(Some(&cmd.token), KernelEvent::CommandSucceeded).await;
            host
        });

        let result = transport
            .send(&KernelTarget::Root, KernelCommand::RequestKernelInfo)
            .await
            .unwrap();
        host_task.await.unwrap();

        assert_eq!(result.events().len(), 1);
        assert!(result.succeeded());
        assert!(!transport.is_closed());
    }

    #[tokio::test]
    async fn malformed_frame_closes_the_transport() {
        let (transport, mut host) = connect();

        let host_task = tokio::spawn(async move {
            let _cmd = host.next_command().await;
            host.emit_raw(b"this is not a frame\n").await;
            host
        });

        let err = transport
            .send(&KernelTarget::Root, KernelCommand::submit_code("x"))
            .await
            .unwrap_err();
        let _host = host_task.await.unwrap();

        assert!(err.is_connection_lost(), "unexpected error: {err:?}");
        assert!(err.to_string().contains("malformed frame"));

        let again = transport
            .send(&KernelTarget::Root, KernelCommand::submit_code("y"))
            .await
            .unwrap_err();
        assert!(again.is_connection_lost());
    }

    #[tokio::test]
    async fn eof_fails_pending_requests() {
        let (transport, mut host) = connect();

        let host_task = tokio::spawn(async move {
            let cmd = host.next_command().await;
            host.emit(Some(&cmd.token), value("partial")).await;
            // Dropping the host closes its stdout.
        });

        let mut stream = transport.send_streaming(&KernelTarget::Root, KernelCommand::submit_code("x"));
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.event, value("partial"));
        host_task.await.unwrap();

        let second = stream.next().await.unwrap().unwrap_err();
        assert!(second.is_connection_lost());
        assert!(stream.next().await.is_none());
        assert!(transport.close_reason().unwrap().contains("closed its output"));
    }

    #[tokio::test]
    async fn expected_close_still_fails_later_sends() {
        let (transport, host) = connect();
        assert!(!transport.close_expected());

        transport.expect_close();
        drop(host);

        let err = transport
            .send(&KernelTarget::Root, KernelCommand::submit_code("x"))
            .await
            .unwrap_err();
        assert!(err.is_connection_lost());
        assert!(transport.close_expected());
        assert!(transport.close_reason().unwrap().contains("closed its output"));
    }

    #[tokio::test]
    async fn cancelled_wait_unregisters_the_request() {
        let (transport, mut host) = connect();

        let waited = tokio::time::timeout(
            Duration::from_millis(50),
            transport.send(&KernelTarget::Root, KernelCommand::submit_code("slow")),
        )
        .await;
        assert!(waited.is_err(), "host never answers, so the wait must time out");
        assert_eq!(transport.pending_count(), 0);

        // Late events for the abandoned token are dropped; the transport
        // keeps working.
        let abandoned = host.next_command().await;
        host.emit(Some(&abandoned.token), KernelEvent::CommandSucceeded)
            .await;

        let host_task = tokio::spawn(async move {
            let cmd = host.next_command().await;
            host.emit(Some(&cmd.token), KernelEvent::CommandSucceeded).await;
            host
        });
        let result = transport
            .send(&KernelTarget::Root, KernelCommand::submit_code("fast"))
            .await
            .unwrap();
        host_task.await.unwrap();
        assert!(result.succeeded());
    }

    #[tokio::test]
    async fn command_failure_is_a_result_not_an_error() {
        let (transport, mut host) = connect();

        let host_task = tokio::spawn(async move {
            let cmd = host.next_command().await;
            host.emit(
                Some(&cmd.token),
                KernelEvent::CommandFailed {
                    message: "kernel not found: nope".into(),
                },
            )
            .await;
            host
        });

        let result = transport
            .send(&KernelTarget::named("nope"), KernelCommand::submit_code("1"))
            .await
            .unwrap();
        host_task.await.unwrap();
        assert_eq!(result.failure_message(), Some("kernel not found: nope"));
    }
}
