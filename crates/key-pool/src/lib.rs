//! Credential pool for the reverse-search proxy
//!
//! Leases SEARCH and PROXY keys to concurrent requests, reconciles their quota
//! after every provider call, and puts exhausted or suspended keys back into
//! rotation on a schedule. The key store is the single source of truth; the
//! in-process locks here only cut down contention between local tasks.
//!
//! Key lifecycle:
//! 1. Admin adds a key → stored active with its tier quota
//! 2. `KeyPool::lease` picks an eligible key at random → `first_leased_at` set on first use
//! 3. `QuotaLedger` applies the call outcome → SEARCH mirrors the provider's
//!    remaining counter, PROXY is suspended on rate-limit / quota signals
//! 4. Rate-limited PROXY keys carry `suspended_until` and come back on their own
//! 5. `Sweeper::sweep` reactivates SEARCH keys after the grace window and all
//!    PROXY keys once per calendar month
//!
//! Users are admitted before any key is leased: ordinary users are held to a
//! daily search limit, premium and admin users are not.
//!
//! Lock order is always: the user lock, then key locks (sorted by id), then
//! the store transaction. The kind lock and the sweep lock never nest with key
//! locks held by others.

pub mod error;
pub mod inventory;
pub mod ledger;
pub mod locks;
pub mod pool;
pub mod quota;
pub mod sweeper;
pub mod tier;
pub mod users;

pub use error::{Error, Result};
pub use inventory::{KeySummary, PoolStats};
pub use ledger::{Outcome, QuotaLedger, Settlement};
pub use locks::LockTable;
pub use pool::{KeyPool, LeasedKey};
pub use quota::{classify_fetch_error, classify_proxy_status, penalty};
pub use sweeper::{Sweeper, spawn_sweep_task};
pub use tier::QuotaPolicy;
pub use users::{Admission, UserSummary};
