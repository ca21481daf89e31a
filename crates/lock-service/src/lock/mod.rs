//! 分布式锁
//!
//! ```ignore
//! let registry = LockRegistry::new(store, LockConfig::default())?;
//! let mut handle = registry.obtain("orders:settlement");
//! if handle.try_lock(Duration::from_secs(5)).await? {
//!     // 临界区
//!     handle.unlock().await?;
//! }
//! ```

mod config;
mod handle;
mod registry;

pub use config::LockConfig;
pub use handle::LockHandle;
pub use registry::LockRegistry;
