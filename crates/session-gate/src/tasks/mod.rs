//! Background tasks for Session Gate.
//!
//! # Tasks
//!
//! - `key_refresh` - Refreshes the provider key set on a fixed schedule
//! - `cache_sweep` - Removes expired session cache entries

pub mod cache_sweep;
pub mod key_refresh;

pub use cache_sweep::start_cache_sweep;
pub use key_refresh::start_key_refresh;
