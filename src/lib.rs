//! CMake build orchestration
//!
//! - [`cms`]: CMake Server protocol client
//! - [`driver`]: configure/build/test driver with server and command-line backends
//! - [`cache`]: `CMakeCache.txt` reader
//! - [`cmake_tools`]: per-project driver ownership

pub mod cache;
pub mod cmake_tools;
pub mod cms;
pub mod config;
pub mod driver;
pub mod generator;
pub mod io;
pub mod logging;
pub mod version;

#[cfg(test)]
pub mod test_utils;

pub use cache::{CacheEntry, CacheEntryType, CacheValue, CmakeCache};
pub use cmake_tools::{CMakeTools, DebugLaunch, ToolsError};
pub use config::{CMakeToolsConfig, SettingValue};
pub use driver::{CMakeDriver, DriverError, DriverEvent, Kit, VariantOptions};
