//! Configuration record injected at list construction
//!
//! Nothing in the library reads process-global state; the embedding game
//! builds a [`Config`] once and hands it to [`crate::ResList::new`].

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default chunk size: 10 KiB. Also the wire default for the core's
/// `ChunkSize` field, so announcements using it omit the field entirely.
pub const DEFAULT_CHUNK_SIZE: u32 = 10 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Paths and external limits
    pub network: NetConfig,

    /// Protocol timing and concurrency tunables
    pub tunables: Tunables,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetConfig {
    /// Directory holding temporary resource files. Created at init; init
    /// fails if the path exists as a non-directory.
    pub work_path: PathBuf,

    /// Root of local resource discovery (sibling-directory walk)
    pub exe_path: PathBuf,

    /// Artifacts larger than this are marked unloadable
    pub max_load_file_size: u64,

    /// Directory-walk depth when matching announced cores against local files
    pub max_res_search_recursion: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tunables {
    /// Byte size of one transfer chunk; the last chunk may be short
    pub chunk_size: u32,

    /// Maximum outstanding chunk requests per resource
    pub max_load: usize,

    /// Maximum outstanding chunk requests per peer per resource
    pub max_load_per_peer_per_file: usize,

    /// Outstanding request lifetime before the slot is freed for re-request
    pub load_timeout: Duration,

    /// How long a loading resource may sit without any known source
    pub discover_timeout: Duration,

    /// Cadence of catalog-wide Discover broadcasts
    pub discover_interval: Duration,

    /// Cadence of per-resource Status broadcasts for dirty entries
    pub status_interval: Duration,

    /// Grace period between `remove()` and reaping a resource's files
    pub res_delete_time: Duration,

    /// Player big-icon entries above this many KiB are pruned
    pub max_bigicon_kb: u32,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            work_path: PathBuf::from("Network"),
            exe_path: PathBuf::from("."),
            max_load_file_size: 100 * 1024 * 1024,
            max_res_search_recursion: 1,
        }
    }
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_load: 5,
            max_load_per_peer_per_file: 2,
            load_timeout: Duration::from_secs(60),
            discover_timeout: Duration::from_secs(10),
            discover_interval: Duration::from_secs(3),
            status_interval: Duration::from_secs(5),
            res_delete_time: Duration::from_secs(60),
            max_bigicon_kb: 64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.tunables.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(config.network.max_res_search_recursion, 1);
        assert!(config.tunables.max_load >= config.tunables.max_load_per_peer_per_file);
    }

    #[test]
    fn test_serialization_roundtrip() {
        let config = Config::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(back.tunables.chunk_size, config.tunables.chunk_size);
        assert_eq!(back.network.work_path, config.network.work_path);
        assert_eq!(back.tunables.load_timeout, config.tunables.load_timeout);
    }
}
