//! ONC RPC plumbing shared by the outgoing and callback directions (RFC 5531).
//!
//! - `wire`: record marking for stream transports
//! - `pending`: matching replies to outstanding calls by xid
//! - `work_queue`: ordered background jobs

mod pending;
pub mod wire;
mod work_queue;

pub use pending::PendingCalls;
pub use wire::{MAX_DATAGRAM_SIZE, MAX_FRAGMENT_SIZE, MAX_RPC_RECORD_LENGTH};
pub use work_queue::{WorkItem, WorkQueue};
