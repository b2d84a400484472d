//! Local handles for remote kernels.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::stream;
use tracing::debug;

use crate::connector::ConnectorInner;
use crate::error::ConnectorError;
use crate::kernel::{KernelInfo, KernelTarget};
use crate::protocol::{KernelCommand, KernelCommandResult};
use crate::transport::EventStream;

/// A handle bound to the host's composite kernel or to one of its
/// sub-kernels.
///
/// Every live proxy keeps the host process alive. Disposing (or dropping)
/// the last one terminates it.
pub struct ProxyKernel {
    name: String,
    target: KernelTarget,
    kernel_info: KernelInfo,
    connector: Arc<ConnectorInner>,
    disposed: AtomicBool,
}

impl std::fmt::Debug for ProxyKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyKernel")
            .field("name", &self.name)
            .field("target", &self.target)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl ProxyKernel {
    pub(crate) fn new(
        name: String,
        target: KernelTarget,
        kernel_info: KernelInfo,
        connector: Arc<ConnectorInner>,
    ) -> Self {
        Self {
            name,
            target,
            kernel_info,
            connector,
            disposed: AtomicBool::new(false),
        }
    }

    /// Local name: the override given at creation, the remote sub-kernel's
    /// name, or `root`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Snapshot taken at creation; `local_name` equals [`name`](Self::name)
    /// and `is_proxy` is always set.
    pub fn kernel_info(&self) -> &KernelInfo {
        &self.kernel_info
    }

    pub fn target(&self) -> &KernelTarget {
        &self.target
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Send `command` to the remote kernel and wait for its terminal event.
    ///
    /// A `CommandFailed` reply is a successful call whose result reports the
    /// failure. Errors mean the command could not be carried out at all.
    /// Dropping the future stops the wait but not the remote execution.
    pub async fn send(&self, command: KernelCommand) -> Result<KernelCommandResult, ConnectorError> {
        self.check_live()?;
        self.connector
            .transport()?
            .send(&self.target, command)
            .await
    }

    /// Like [`send`](Self::send), yielding events as they arrive.
    pub fn send_streaming(&self, command: KernelCommand) -> EventStream {
        let transport = self
            .check_live()
            .and_then(|()| self.connector.transport());
        match transport {
            Ok(transport) => transport.send_streaming(&self.target, command),
            Err(e) => Box::pin(stream::once(async move { Err(e) })),
        }
    }

    pub async fn submit_code(
        &self,
        code: impl Into<String>,
    ) -> Result<KernelCommandResult, ConnectorError> {
        self.send(KernelCommand::submit_code(code)).await
    }

    pub async fn request_kernel_info(&self) -> Result<KernelCommandResult, ConnectorError> {
        self.send(KernelCommand::RequestKernelInfo).await
    }

    /// Release this handle. Idempotent; only the first call counts.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(proxy = %self.name, "disposing proxy kernel");
        self.connector.release_proxy(&self.name);
    }

    fn check_live(&self) -> Result<(), ConnectorError> {
        if self.is_disposed() {
            return Err(ConnectorError::ProxyDisposed(self.name.clone()));
        }
        Ok(())
    }
}

impl Drop for ProxyKernel {
    fn drop(&mut self) {
        self.dispose();
    }
}
