//! Wire protocol between the connector and the kernel host.
//!
//! One JSON envelope per line, UTF-8, in both directions:
//!
//! ```text
//! -> {"token":"..","targetKernelName":"csharp","command":{"commandType":"SubmitCode","code":".."}}
//! <- {"token":"..","sourceKernelName":"csharp","event":{"eventType":"ReturnValueProduced",..}}
//! <- {"token":"..","sourceKernelName":"csharp","event":{"eventType":"CommandSucceeded"}}
//! ```

pub mod frame;
pub mod message;
pub mod result;

pub use frame::{FrameError, decode_frame, encode_frame};
pub use message::{
    CommandEnvelope, CorrelationToken, EventEnvelope, FormattedValue, KernelCommand, KernelEvent,
};
pub use result::KernelCommandResult;
