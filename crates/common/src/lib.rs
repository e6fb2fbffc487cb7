//! vmrelay Common Library
//!
//! Shared types, the error taxonomy and the SQLite-backed store used by the
//! console broker.

pub mod crypto;
pub mod db;
pub mod error;
pub mod types;

// Re-export commonly used types
pub use crypto::SecretCipher;
pub use db::{Database, SampleOutcome};
pub use error::{Error, Result};
pub use types::*;

/// vmrelay version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default store path
pub fn default_store_path() -> std::path::PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".vmrelay")
}

/// Default database path
pub fn default_db_path() -> std::path::PathBuf {
    default_store_path().join("vmrelay.db")
}
