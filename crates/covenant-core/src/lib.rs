//! Core types and trait definitions for the Covenant consistency engine.
//!
//! This crate is deliberately free of HTTP and database dependencies. It holds
//! the event model, the pure state-machine translators that fold events into
//! projection state, the invariant predicates, and the storage traits that
//! backends implement.

// We intentionally use native `async fn` in traits (stabilised in Rust 1.75).
// Suppress the advisory lint about `Send` bounds on the returned futures.
#![allow(async_fn_in_trait)]

pub mod delivery;
pub mod error;
pub mod event;
pub mod invariant;
pub mod ledger;
pub mod membership;
pub mod projection;
pub mod store;
pub mod stream;
pub mod subscription;

pub use error::{Error, Result};
