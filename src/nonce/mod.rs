//! Per-account nonce tracking
//!
//! Handles:
//! - Collision-free nonce allocation for concurrent senders
//! - Periodic resynchronization with the node's pending nonce

mod cache;
mod sync;

pub use cache::NonceCache;
pub use sync::NonceSynchronizer;
