//! Storage for the PPLNS pool.
//!
//! [`PoolStorage`] is the relational system of record (shares, blocks, coinbase payments,
//! ledger). [`ShareDedupStore`] is the sorted set that decides whether a share has been
//! credited before.
pub mod backends;
pub mod dedup;
pub mod error;
pub mod pool_storage;
pub mod types;

pub use dedup::*;
pub use error::*;
pub use pool_storage::*;
pub use types::*;

/// Current unix time in seconds.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
