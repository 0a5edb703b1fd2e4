//! Business logic: the account store and the token pool.

pub mod account_store;
pub mod token_pool;

pub use account_store::{AccountRecord, AccountStore};
pub use token_pool::{PoolStatus, TokenDetail, TokenPool, RATE_LIMIT_MARKER};
