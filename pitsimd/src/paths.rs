//! Cross-platform application paths

use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct AppPaths {
    data_dir: PathBuf,
}

impl AppPaths {
    pub fn new() -> Result<Self, String> {
        let base = dirs::data_dir().ok_or("Could not determine data directory")?;
        Self::at(base.join("pitsim"))
    }

    /// Use `data_dir` instead of the platform default.
    pub fn at(data_dir: PathBuf) -> Result<Self, String> {
        fs::create_dir_all(data_dir.join("checkpoints"))
            .map_err(|e| format!("Failed to create data directory: {}", e))?;
        Ok(Self { data_dir })
    }

    pub fn data_dir(&self) -> &PathBuf {
        &self.data_dir
    }

    /// Simulation config; the built-in demo is used when absent.
    pub fn config_file(&self) -> PathBuf {
        self.data_dir.join("config.json")
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.data_dir.join("checkpoints")
    }
}
