//! OAuth state-token handling for the intake gateway.
//!
//! A state token is a signed HS256 JWT binding an authorization request
//! to a `(user, service)` pair, paired with a server-side pending entry
//! that is consumed exactly once when the provider calls back. Signature
//! and claims stop forgery; the pending entry stops replay and enforces
//! the TTL even if a token leaks after use.

mod pending;
mod state;

pub use pending::{
    pending_store_from_env, shared_memory_pending_store, MemoryPendingStore, PendingAuth,
    PendingStore, SharedPendingStore,
};
#[cfg(feature = "nats-store")]
pub use pending::KvPendingStore;
pub use state::{StateClaims, StateSigner};
