//! dabby-state — embedded store for the dabby core.
//!
//! Backed by [redb](https://docs.rs/redb), persists job records and
//! instance health records so a restarted process can resume scheduled
//! work (at-least-once) and remember circuit state.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Job keys are zero-padded decimal ids so a table scan yields ascending
//! id order, which is the dispatch order the scheduler guarantees.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
