//! Wire protocol for chunkvault backup streams.
//!
//! One persistent connection carries one stream. Every exchange is a single
//! request followed by a single reply; each message is one JSON line (see
//! [`codec`]) wrapped in the [`Message`] envelope.

pub mod codec;
pub mod constants;
pub mod envelope;
pub mod error;
pub mod messages;
pub mod types;

// Re-export primary types for convenience.
pub use codec::{read_message, write_message};
pub use constants::MessageType;
pub use envelope::{Message, WireError};
pub use error::ProtocolError;
pub use types::{DIGEST_LEN, Digest, DigestAlgorithm, FileDescriptor, FileType};
