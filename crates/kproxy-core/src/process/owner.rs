//! Reference-counted ownership of the kernel host process.
//!
//! ```text
//! NotStarted --attach--> Running --last release--> Terminating --exit--> Terminated
//!                           |                                              ^
//!                           +------------- unexpected exit ----------------+
//! ```
//!
//! The live count is an atomic with a `RETIRED` sentinel: the release that
//! takes it from 1 to `RETIRED` is the only one that fires the kill trigger,
//! and once retired no handle can be acquired again.
//!
//! The `Child` itself is owned by a monitor task. It publishes the exit on a
//! watch channel and runs the termination sequence (SIGTERM, bounded wait,
//! SIGKILL, bounded wait) when the kill trigger fires.

use std::process::ExitStatus;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use tokio::process::Child;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

use crate::error::ConnectorError;

const RETIRED: usize = usize::MAX;

/// Lifecycle of the owned process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    NotStarted,
    Running,
    Terminating,
    Terminated,
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProcessState::NotStarted => "not-started",
            ProcessState::Running => "running",
            ProcessState::Terminating => "terminating",
            ProcessState::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// How long to wait for the host to go away once termination starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminationPolicy {
    /// Wait after SIGTERM before escalating.
    pub terminate_grace: Duration,
    /// Wait after SIGKILL before giving up on confirmation.
    pub kill_grace: Duration,
}

impl Default for TerminationPolicy {
    fn default() -> Self {
        Self {
            terminate_grace: Duration::from_secs(5),
            kill_grace: Duration::from_secs(5),
        }
    }
}

/// How the process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// `None` if the status could not be collected within the bounded wait.
    pub status: Option<ExitStatus>,
    /// `true` if the exit followed our own termination request.
    pub requested: bool,
}

/// Tracks live proxy handles and kills the process when the last goes away.
pub struct ProcessOwner {
    policy: TerminationPolicy,
    live: AtomicUsize,
    state: Arc<Mutex<ProcessState>>,
    pid: OnceLock<u32>,
    kill_trigger: Mutex<Option<oneshot::Sender<()>>>,
    exit: Arc<watch::Sender<Option<ProcessExit>>>,
    termination_requests: AtomicUsize,
}

impl std::fmt::Debug for ProcessOwner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessOwner")
            .field("pid", &self.pid())
            .field("state", &self.state())
            .field("live", &self.live_count())
            .field("termination_requests", &self.termination_requests())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ProcessOwner {
    pub fn new(policy: TerminationPolicy) -> Self {
        let (exit, _) = watch::channel(None);
        Self {
            policy,
            live: AtomicUsize::new(0),
            state: Arc::new(Mutex::new(ProcessState::NotStarted)),
            pid: OnceLock::new(),
            kill_trigger: Mutex::new(None),
            exit: Arc::new(exit),
            termination_requests: AtomicUsize::new(0),
        }
    }

    /// Take ownership of a spawned child: `NotStarted -> Running`.
    ///
    /// Spawns the monitor task, so this must run inside a tokio runtime.
    pub fn attach(&self, child: Child, pid: u32) -> Result<(), ConnectorError> {
        let mut state = lock(&self.state);
        if *state != ProcessState::NotStarted {
            return Err(ConnectorError::ProcessTerminated);
        }
        let _ = self.pid.set(pid);

        let (kill_tx, kill_rx) = oneshot::channel();
        *lock(&self.kill_trigger) = Some(kill_tx);
        *state = ProcessState::Running;
        drop(state);

        tokio::spawn(monitor(
            child,
            pid,
            kill_rx,
            self.policy,
            Arc::clone(&self.state),
            Arc::clone(&self.exit),
        ));
        Ok(())
    }

    /// Register one more live handle.
    ///
    /// Fails once the process is no longer running or the count has
    /// already dropped to zero.
    pub fn acquire(&self) -> Result<usize, ConnectorError> {
        if self.state() != ProcessState::Running {
            return Err(ConnectorError::ProcessTerminated);
        }
        self.live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n != RETIRED).then(|| n + 1)
            })
            .map(|previous| previous + 1)
            .map_err(|_| ConnectorError::ProcessTerminated)
    }

    /// Drop one live handle. The release that takes the count to zero
    /// starts termination; it happens at most once.
    pub fn release(&self) {
        let previous = self
            .live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| match n {
                0 | RETIRED => None,
                1 => Some(RETIRED),
                n => Some(n - 1),
            });

        match previous {
            Ok(1) => self.begin_termination(),
            Ok(_) => {}
            Err(n) => debug!(live = n, "release with no live handles ignored"),
        }
    }

    fn begin_termination(&self) {
        {
            let mut state = lock(&self.state);
            if *state == ProcessState::Running {
                *state = ProcessState::Terminating;
            }
        }
        self.termination_requests.fetch_add(1, Ordering::AcqRel);

        let trigger = lock(&self.kill_trigger).take();
        match trigger {
            Some(tx) => {
                info!(pid = ?self.pid(), "last proxy released, terminating kernel host");
                if tx.send(()).is_err() {
                    debug!(pid = ?self.pid(), "kernel host monitor already finished");
                }
            }
            None => debug!("no kernel host attached, nothing to terminate"),
        }
    }

    pub fn state(&self) -> ProcessState {
        *lock(&self.state)
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid.get().copied()
    }

    /// Number of live handles (zero once retired).
    pub fn live_count(&self) -> usize {
        match self.live.load(Ordering::Acquire) {
            RETIRED => 0,
            n => n,
        }
    }

    /// How many times termination was triggered. Never more than one.
    pub(crate) fn termination_requests(&self) -> usize {
        self.termination_requests.load(Ordering::Acquire)
    }

    /// The exit, if the process has already ended.
    pub fn exit(&self) -> Option<ProcessExit> {
        *self.exit.borrow()
    }

    /// Wait until the process has ended. Returns `None` if no process was
    /// ever attached.
    pub async fn wait_for_exit(&self) -> Option<ProcessExit> {
        if self.pid().is_none() {
            return None;
        }
        let mut rx = self.exit.subscribe();
        let exit = rx.wait_for(Option::is_some).await.ok()?;
        *exit
    }
}

impl Drop for ProcessOwner {
    fn drop(&mut self) {
        // Dropping the trigger without sending makes the monitor terminate
        // the host, so an abandoned connector never leaks a process.
        lock(&self.kill_trigger).take();
    }
}

async fn monitor(
    mut child: Child,
    pid: u32,
    mut kill_rx: oneshot::Receiver<()>,
    policy: TerminationPolicy,
    state: Arc<Mutex<ProcessState>>,
    exit: Arc<watch::Sender<Option<ProcessExit>>>,
) {
    let outcome = tokio::select! {
        status = child.wait() => {
            let status = match status {
                Ok(status) => Some(status),
                Err(e) => {
                    warn!(pid, error = %e, "error waiting for kernel host");
                    None
                }
            };
            warn!(pid, status = ?status, "kernel host exited unexpectedly");
            ProcessExit { status, requested: false }
        }
        _ = &mut kill_rx => terminate(&mut child, pid, policy).await,
    };

    *lock(&state) = ProcessState::Terminated;
    exit.send_replace(Some(outcome));
}

/// SIGTERM, bounded wait, then SIGKILL and one more bounded wait.
async fn terminate(child: &mut Child, pid: u32, policy: TerminationPolicy) -> ProcessExit {
    send_terminate(child, pid);

    match tokio::time::timeout(policy.terminate_grace, child.wait()).await {
        Ok(Ok(status)) => {
            info!(pid, status = %status, "kernel host exited");
            return ProcessExit {
                status: Some(status),
                requested: true,
            };
        }
        Ok(Err(e)) => warn!(pid, error = %e, "error waiting for kernel host after SIGTERM"),
        Err(_) => warn!(pid, "kernel host did not exit after SIGTERM, sending SIGKILL"),
    }

    if let Err(e) = child.start_kill() {
        warn!(pid, error = %e, "failed to SIGKILL kernel host");
    }
    let status = match tokio::time::timeout(policy.kill_grace, child.wait()).await {
        Ok(Ok(status)) => {
            info!(pid, status = %status, "kernel host exited after SIGKILL");
            Some(status)
        }
        Ok(Err(e)) => {
            warn!(pid, error = %e, "error waiting for kernel host after SIGKILL");
            None
        }
        Err(_) => {
            warn!(pid, "kernel host exit not confirmed after SIGKILL");
            None
        }
    };
    ProcessExit {
        status,
        requested: true,
    }
}

#[cfg(unix)]
fn send_terminate(_child: &mut Child, pid: u32) {
    // SAFETY: pid belongs to a child we spawned and have not yet reaped, so
    // it cannot have been recycled.
    let ret = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if ret != 0 {
        warn!(pid, "SIGTERM failed, will escalate to SIGKILL");
    }
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child, pid: u32) {
    if let Err(e) = child.start_kill() {
        warn!(pid, error = %e, "failed to kill kernel host");
    }
}
