//! The connector: lazily launches the kernel host, runs the handshake once,
//! and hands out [`ProxyKernel`]s that share the host process.

pub mod registry;

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::config::ConnectorConfig;
use crate::error::ConnectorError;
use crate::kernel::{KernelInfo, KernelTarget, ROOT_PROXY_NAME};
use crate::process::launcher::launch;
use crate::process::owner::{ProcessExit, ProcessOwner, ProcessState};
use crate::proxy::ProxyKernel;
use crate::transport::StdioTransport;

use registry::{KernelRegistry, perform_handshake};

/// One handshake round-trip, awaited by every caller that joins it.
type HandshakeAttempt = Shared<BoxFuture<'static, Result<KernelRegistry, ConnectorError>>>;

/// State shared by the connector and every proxy it created.
pub(crate) struct ConnectorInner {
    config: ConnectorConfig,
    connection: OnceCell<Arc<StdioTransport>>,
    launch_failure: OnceLock<ConnectorError>,
    registry: OnceLock<KernelRegistry>,
    handshake: Mutex<Option<HandshakeAttempt>>,
    owner: ProcessOwner,
    live_names: Mutex<HashSet<String>>,
}

/// Launches one kernel host on first use and creates proxy kernels bound to
/// it.
///
/// The connector is single-use: once the last proxy is disposed the host is
/// terminated and further creation calls fail with
/// [`ConnectorError::ProcessTerminated`].
#[derive(Clone)]
pub struct StdioKernelConnector {
    inner: Arc<ConnectorInner>,
}

impl std::fmt::Debug for StdioKernelConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdioKernelConnector")
            .field("program", &self.inner.config.launch.program)
            .field("owner", &self.inner.owner)
            .finish()
    }
}

impl StdioKernelConnector {
    /// Create a connector. Nothing is launched until the first proxy is
    /// requested.
    pub fn new(config: impl Into<ConnectorConfig>) -> Self {
        let config = config.into();
        let owner = ProcessOwner::new(config.termination);
        Self {
            inner: Arc::new(ConnectorInner {
                config,
                connection: OnceCell::new(),
                launch_failure: OnceLock::new(),
                registry: OnceLock::new(),
                handshake: Mutex::new(None),
                owner,
                live_names: Mutex::new(HashSet::new()),
            }),
        }
    }

    pub fn config(&self) -> &ConnectorConfig {
        &self.inner.config
    }

    /// Proxy bound to the host's composite kernel, named `root`.
    pub async fn create_root_proxy_kernel(&self) -> Result<ProxyKernel, ConnectorError> {
        let registry = self.inner.ensure_ready().await?;
        let kernel_info = registry.root().for_proxy(ROOT_PROXY_NAME);
        self.register_proxy(ROOT_PROXY_NAME.to_string(), KernelTarget::Root, kernel_info)
    }

    /// Proxy bound to the sub-kernel called `remote_name`, named
    /// `local_name_override` if given.
    ///
    /// Unknown names fail with [`ConnectorError::RemoteKernelNotFound`] and
    /// leave the host and other proxies untouched.
    pub async fn create_proxy_kernel(
        &self,
        remote_name: &str,
        local_name_override: Option<&str>,
    ) -> Result<ProxyKernel, ConnectorError> {
        let registry = self.inner.ensure_ready().await?;
        let remote = registry.resolve(remote_name)?;
        let name = local_name_override.unwrap_or(remote_name).to_string();
        let kernel_info = remote.for_proxy(&name);
        self.register_proxy(name, KernelTarget::named(remote_name), kernel_info)
    }

    /// Like [`create_proxy_kernel`](Self::create_proxy_kernel), resolving
    /// `info.local_name`. A composite entry yields a root proxy.
    pub async fn create_proxy_kernel_from_info(
        &self,
        info: &KernelInfo,
        local_name_override: Option<&str>,
    ) -> Result<ProxyKernel, ConnectorError> {
        if !info.is_composite {
            return self
                .create_proxy_kernel(&info.local_name, local_name_override)
                .await;
        }
        let registry = self.inner.ensure_ready().await?;
        let name = local_name_override.unwrap_or(ROOT_PROXY_NAME).to_string();
        let kernel_info = registry.root().for_proxy(&name);
        self.register_proxy(name, KernelTarget::Root, kernel_info)
    }

    /// OS process id of the host. `None` until the first creation call has
    /// launched it, constant afterward.
    pub fn process_id(&self) -> Option<u32> {
        self.inner.owner.pid()
    }

    pub fn process_state(&self) -> ProcessState {
        self.inner.owner.state()
    }

    /// Proxies created by this connector and not yet disposed.
    pub fn live_proxy_count(&self) -> usize {
        self.inner.owner.live_count()
    }

    /// The handshake result, once it has completed.
    pub fn kernel_infos(&self) -> Option<&KernelRegistry> {
        self.inner.registry.get()
    }

    /// Wait for the host to exit. `None` if it was never launched.
    pub async fn wait_for_exit(&self) -> Option<ProcessExit> {
        self.inner.owner.wait_for_exit().await
    }

    fn register_proxy(
        &self,
        name: String,
        target: KernelTarget,
        kernel_info: KernelInfo,
    ) -> Result<ProxyKernel, ConnectorError> {
        if !self.inner.live_names().insert(name.clone()) {
            return Err(ConnectorError::DuplicateProxyName(name));
        }
        if let Err(e) = self.inner.owner.acquire() {
            self.inner.live_names().remove(&name);
            return Err(e);
        }

        info!(
            proxy = %name,
            target = target.remote_name().unwrap_or(ROOT_PROXY_NAME),
            live = self.inner.owner.live_count(),
            "created proxy kernel"
        );
        Ok(ProxyKernel::new(
            name,
            target,
            kernel_info,
            Arc::clone(&self.inner),
        ))
    }
}

impl ConnectorInner {
    fn live_names(&self) -> MutexGuard<'_, HashSet<String>> {
        self.live_names
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn check_usable(&self) -> Result<(), ConnectorError> {
        match self.owner.state() {
            ProcessState::Terminating | ProcessState::Terminated => {
                Err(ConnectorError::ProcessTerminated)
            }
            ProcessState::NotStarted | ProcessState::Running => Ok(()),
        }
    }

    /// Launch the host (once) and run the handshake.
    ///
    /// Concurrent callers join the attempt in flight and all see its single
    /// outcome. A success is kept for good; after a failure the slot is
    /// emptied so that only a later call starts a new round-trip.
    async fn ensure_ready(&self) -> Result<&KernelRegistry, ConnectorError> {
        self.check_usable()?;
        if let Some(registry) = self.registry.get() {
            return Ok(registry);
        }

        let transport = self.ensure_launched().await?;
        let attempt = {
            let mut slot = self.handshake_slot();
            if let Some(registry) = self.registry.get() {
                return Ok(registry);
            }
            slot.get_or_insert_with(|| {
                let transport = Arc::clone(transport);
                let timeout = self.config.handshake_timeout;
                async move { perform_handshake(&transport, timeout).await }
                    .boxed()
                    .shared()
            })
            .clone()
        };

        let outcome = attempt.clone().await;
        if let Ok(registry) = &outcome {
            self.registry.get_or_init(|| registry.clone());
        }
        {
            let mut slot = self.handshake_slot();
            if slot.as_ref().is_some_and(|current| current.ptr_eq(&attempt)) {
                *slot = None;
            }
        }
        outcome?;

        self.check_usable()?;
        self.registry
            .get()
            .ok_or_else(|| ConnectorError::Handshake("kernel info was not recorded".to_string()))
    }

    fn handshake_slot(&self) -> MutexGuard<'_, Option<HandshakeAttempt>> {
        self.handshake
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    async fn ensure_launched(&self) -> Result<&Arc<StdioTransport>, ConnectorError> {
        if let Some(e) = self.launch_failure.get() {
            return Err(e.clone());
        }
        self.connection
            .get_or_try_init(|| async {
                self.start().map(Arc::new).inspect_err(|e| {
                    let _ = self.launch_failure.set(e.clone());
                })
            })
            .await
    }

    fn start(&self) -> Result<StdioTransport, ConnectorError> {
        let launched = launch(&self.config.launch)?;
        let transport = StdioTransport::new(launched.stdout, launched.stdin);
        self.owner.attach(launched.child, launched.pid)?;
        Ok(transport)
    }

    /// The transport of a launched host. Only proxies call this, and they
    /// exist only after a successful launch.
    pub(crate) fn transport(&self) -> Result<&StdioTransport, ConnectorError> {
        self.connection
            .get()
            .map(Arc::as_ref)
            .ok_or(ConnectorError::ProcessTerminated)
    }

    /// Forget a disposed proxy's name and drop its hold on the host.
    pub(crate) fn release_proxy(&self, name: &str) {
        self.live_names().remove(name);
        self.owner.release();
        if self.owner.state() != ProcessState::Running {
            if let Some(transport) = self.connection.get() {
                transport.expect_close();
            }
        }
        debug!(proxy = %name, live = self.owner.live_count(), "released proxy kernel");
    }
}
