//! Proxy kernels for a polyglot kernel host driven over stdio.
//!
//! A [`StdioKernelConnector`] launches a child "kernel host" process, talks
//! to it with newline-delimited JSON over the child's stdin/stdout, and hands
//! out [`ProxyKernel`] handles bound either to the host's composite kernel or
//! to one of its named sub-kernels.
//!
//! # Architecture
//!
//! ```text
//! StdioKernelConnector
//!     |-- process::launcher  spawn child, pipe stdin/stdout
//!     |-- transport          frame writes + one read loop, demux by token
//!     |-- connector::registry  one-time RequestKernelInfo handshake
//!     |-- process::owner     live-handle count, kill on last dispose
//!     v
//! ProxyKernel --send(command)--> KernelCommandResult { events }
//! ```

pub mod config;
pub mod connector;
pub mod error;
pub mod kernel;
pub mod process;
pub mod protocol;
pub mod proxy;
pub mod transport;

pub use config::{ConnectorConfig, EnvOverrides};
pub use connector::StdioKernelConnector;
pub use connector::registry::KernelRegistry;
pub use error::ConnectorError;
pub use kernel::{KernelInfo, KernelTarget, ROOT_PROXY_NAME};
pub use process::launcher::LaunchConfig;
pub use process::owner::{ProcessExit, ProcessState, TerminationPolicy};
pub use protocol::{
    CorrelationToken, FormattedValue, KernelCommand, KernelCommandResult, KernelEvent,
};
pub use proxy::ProxyKernel;
