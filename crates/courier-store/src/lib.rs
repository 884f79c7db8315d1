//! # courier-store
//!
//! Chat state for the Courier client.
//!
//! [`ChatStateStore`] is the in-memory arena of chats, messages, peers and
//! UI state, keyed by stable identifiers. Every operation takes `&mut self`
//! and completes synchronously, so a mutation is never observed half done.
//! [`Database`] persists a [`Snapshot`] of it to SQLite, with message
//! content sealed under a key derived from the user's identity.

pub mod database;
pub mod migrations;
pub mod models;
pub mod routing;
pub mod store;

mod ephemeral;
mod error;
mod peers;
mod snapshot;

pub use database::Database;
pub use error::{Result, StoreError};
pub use models::*;
pub use routing::RouteOutcome;
pub use store::ChatStateStore;
