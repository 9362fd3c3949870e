//! Backup job fan-out.
//!
//! Splits a job's file list across N streams and runs one sender session
//! per stream concurrently, each over its own connection. Streams share
//! nothing on this side; they deduplicate against each other only through
//! the receiver's index.

pub mod connector;
pub mod coordinator;
pub mod error;
pub mod partition;
pub mod report;

pub use connector::{ConnectFuture, StreamConnector, TcpConnector};
pub use coordinator::{CoordinatorEvent, JobSpec, StreamCoordinator};
pub use error::CoordinatorError;
pub use partition::partition;
pub use report::JobReport;
