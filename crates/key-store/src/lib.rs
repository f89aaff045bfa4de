//! Key store for the reverse-search credential pool
//!
//! Holds the credential records (`ApiKey`) for both key kinds, end users and
//! their status, the append-only usage trail, and a handful of named markers. Everything above this crate
//! talks to storage through the `KeyStore` / `KeyTransaction` traits so the
//! JSON file backend can be swapped for a relational one.
//!
//! Transaction rules:
//! 1. `begin()` opens a transaction; reads see the store as of that moment
//! 2. `update()` is conditional on the row's `revision` (compare-and-swap)
//! 3. `commit()` publishes every write at once; dropping the transaction
//!    discards them

pub mod error;
pub mod file;
pub mod model;
pub mod store;

pub use error::{Error, Result};
pub use file::FileKeyStore;
pub use model::{ApiKey, KeyKind, UsageRecord, UserRecord, UserStatus};
pub use store::{KeyStore, KeyTransaction, StoreFuture};
