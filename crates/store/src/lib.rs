//! Persistence and consistency layer.
//!
//! Three artifacts live under the data directory: `config.json`,
//! `state.json`, and `history.json`. Every write is whole-file atomic
//! (write to a `.tmp` sibling, then rename). Loads are tolerant: a
//! missing or corrupt file falls back to defaults with a warning so the
//! engine always starts.
//!
//! The store is the single serialization point for runtime state. All
//! mutations go through typed setters that validate the state-machine
//! invariants before persisting; invalid mutations are rejected in-process.

mod store;

pub use store::{HistoryPage, StateStore, StoreError};
