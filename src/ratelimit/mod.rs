//! Sliding-window rate limiting and its store ports.

mod clock;
mod store;
mod window;

#[cfg(feature = "redis-store")]
mod redis_store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use store::{MemoryOrderedSetStore, OrderedSetStore, StoreError};
pub use window::{Decision, SlidingWindowLimiter, WindowKey, WindowSettings};

#[cfg(feature = "redis-store")]
pub use redis_store::RedisOrderedSetStore;
