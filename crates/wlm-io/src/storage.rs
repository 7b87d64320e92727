//! Per-network `.inp` file storage.
//!
//! Imported networks keep their original input text on disk so matrix builds
//! can hand the hydraulic engine a file path. Layout is one file per
//! network: `<root>/<network_id>.inp`, rooted at `WLM_STORAGE_DIR` or
//! `./storage/epanet/` when unset.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;
use wlm_core::{NetworkId, WlmError, WlmResult};

/// Environment variable overriding the storage root.
pub const STORAGE_DIR_ENV: &str = "WLM_STORAGE_DIR";

/// Default storage root relative to the working directory.
pub const DEFAULT_STORAGE_DIR: &str = "./storage/epanet";

/// File store for network input files.
#[derive(Debug, Clone)]
pub struct InpStorage {
    root: PathBuf,
}

impl InpStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root from `WLM_STORAGE_DIR`, falling back to the default.
    pub fn from_env() -> Self {
        let root = std::env::var(STORAGE_DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_STORAGE_DIR));
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, network: NetworkId) -> PathBuf {
        self.root.join(format!("{network}.inp"))
    }

    /// Persist the input text, creating the root on first use.
    pub fn save(&self, network: NetworkId, content: &str) -> WlmResult<PathBuf> {
        fs::create_dir_all(&self.root)?;
        let path = self.path_for(network);
        fs::write(&path, content)?;
        debug!(network = %network, path = %path.display(), "stored network input file");
        Ok(path)
    }

    pub fn exists(&self, network: NetworkId) -> bool {
        self.path_for(network).is_file()
    }

    pub fn load(&self, network: NetworkId) -> WlmResult<String> {
        let path = self.path_for(network);
        if !path.is_file() {
            return Err(WlmError::NotFound(format!(
                "no stored input file for network {network}"
            )));
        }
        Ok(fs::read_to_string(path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = InpStorage::new(dir.path());
        let network = NetworkId::new();

        assert!(!storage.exists(network));
        let path = storage.save(network, "[JUNCTIONS]\nJ1 10\n").unwrap();
        assert!(path.ends_with(format!("{network}.inp")));
        assert!(storage.exists(network));
        assert_eq!(storage.load(network).unwrap(), "[JUNCTIONS]\nJ1 10\n");
    }

    #[test]
    fn test_load_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let storage = InpStorage::new(dir.path());
        let err = storage.load(NetworkId::new()).unwrap_err();
        assert!(matches!(err, WlmError::NotFound(_)));
    }

    #[test]
    fn test_nested_root_created_on_save() {
        let dir = tempfile::tempdir().unwrap();
        let storage = InpStorage::new(dir.path().join("storage/epanet"));
        let network = NetworkId::new();
        storage.save(network, "x").unwrap();
        assert!(storage.exists(network));
    }
}
