//! vCloud Common Library
//!
//! Shared error types, resource-kind tables, provider value conversion and
//! runtime-property persistence for the vCloud lifecycle plugin.

pub mod db;
pub mod error;
pub mod types;
pub mod value;

// Re-export commonly used types
pub use db::Database;
pub use error::{Error, ProviderError, Result};
pub use types::*;
pub use value::{DynamicValue, Element, RuntimeProperties, Scalar};

/// Plugin version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default state directory
pub fn default_store_path() -> std::path::PathBuf {
    std::env::var_os("HOME")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".vcloud-plugin")
}

/// Default database path
pub fn default_db_path() -> std::path::PathBuf {
    default_store_path().join("state.db")
}
