//! Per-stream transfer sessions.
//!
//! A stream is one ordered, reliable connection carrying a strictly
//! half-duplex exchange: the [`Sender`] issues one request, the [`Receiver`]
//! answers it, and nothing else is in flight. Files and their chunks are
//! handled in submission order.

mod connection;
mod context;
mod error;
mod receiver;
mod report;
mod sender;
mod source;

pub use connection::Connection;
pub use context::{FailurePolicy, SessionContext, SessionPolicy};
pub use error::{ErrorClass, SessionError};
pub use receiver::{Receiver, ReceiverSummary};
pub use report::{FileOutcome, FileReport, StreamReport};
pub use sender::{Sender, run_stream};
pub use source::{FsSource, MemorySource, SourceFuture, SourceProvider};
