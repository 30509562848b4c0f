//! Concrete stack layouts

pub mod cache;
pub mod clone;
pub mod pool;

pub use cache::{CacheLayout, CacheStack};
pub use clone::{CloneLayout, CloneStack, check_dev_size};
pub use pool::{PoolLayout, PoolStack};
