pub mod pool;
pub mod transaction;

pub use pool::{KvPoolConfig, PoolStatus, RedisPool};
pub use transaction::KvTransaction;
