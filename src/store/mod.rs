//! Durable Session Records
//!
//! One logical table keyed by session code. The engine sits behind the
//! [`SessionStore`] trait; the default implementation is redb + MessagePack
//! (rmp-serde), with an in-memory store for tests.

mod session;

pub use session::{MemorySessionStore, RedbSessionStore, SessionStore, StoreError};
