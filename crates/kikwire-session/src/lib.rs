//! Per-account session persistence for kikwire.
//!
//! This crate holds the one piece of client state that must survive a
//! process restart:
//!
//! 1. **The record** ([`Session`]): device id, installation id, the
//!    server-assigned routing node, and the last captcha token.
//! 2. **Where it lives** ([`SessionStore`] trait): a synchronous
//!    key-value contract keyed by account id, with an in-memory
//!    implementation ([`MemoryStore`]) and a JSON-file one
//!    ([`JsonFileStore`]).
//!
//! # How it fits in the stack
//!
//! ```text
//! Client (above)    ← loads the session once, saves it when the node changes
//!     ↕
//! Session (this crate)
//! ```
//!
//! Stores are synchronous. The client picks its first handshake step
//! from the loaded node, so a load must complete before anything is sent.

mod error;
mod session;
mod store;

pub use error::SessionError;
pub use session::Session;
pub use store::{JsonFileStore, MemoryStore, SessionStore};
