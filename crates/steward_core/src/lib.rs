//! Steward Core Types
//!
//! Pure types shared by every Steward crate: member and child identifiers,
//! placement hashes, logical time and the core error. No I/O.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod hash;
pub mod id;
pub mod time;

// Re-exports
pub use error::{CoreError, CoreResult};
pub use hash::Hash;
pub use id::{ChildId, MemberId};
pub use time::{LamportClock, LogicalTime, Stamp, Timestamp};
