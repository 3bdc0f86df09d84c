//! RunStore - durable JSON document persistence
//!
//! A small store for a single JSON document that must survive crashes:
//! every save writes to a temporary file in the same directory and atomically
//! renames it over the target, so readers never observe a partial write.
//! Rolling `.bak` copies support best-effort repair when the live document
//! is corrupted.

mod store;

pub use store::{DocumentStore, StoreError};
