pub mod cache;
pub mod storage;

pub use cache::*;
pub use storage::*;

use std::path::PathBuf;

/// Default on-disk cache location: the platform cache dir, or a hidden
/// directory under the working directory when there is none.
pub fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .map(|dir| dir.join("surrotune"))
        .unwrap_or_else(|| PathBuf::from(".surrotune-cache"))
}
