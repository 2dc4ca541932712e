//! Runtime settings

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// All tunables, loadable from a JSON file. Missing fields take defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreSettings {
    pub storage: StorageSettings,
    pub query: QuerySettings,
    pub workers: WorkerSettings,
    pub plot: PlotSettings,
}

/// Blob store and database locations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Root directory holding the database and the dataset folder
    pub root: PathBuf,

    /// Folder under `root` holding dataset files
    pub folder: String,

    /// Maximum bytes the dataset folder may occupy
    pub quota_bytes: u64,

    /// Size of each streamed write
    pub chunk_size: usize,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            root: PathBuf::from(".pointscope"),
            folder: "datasets".to_string(),
            quota_bytes: 2 * 1024 * 1024 * 1024,
            chunk_size: 1024 * 1024,
        }
    }
}

impl StorageSettings {
    pub fn dataset_dir(&self) -> PathBuf {
        self.root.join(&self.folder)
    }

    pub fn database_path(&self) -> PathBuf {
        self.root.join("pointscope.db")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuerySettings {
    /// Rows per result batch
    pub batch_rows: usize,

    /// Upper bound on points returned by sampled queries
    pub max_points: usize,
}

impl Default for QuerySettings {
    fn default() -> Self {
        Self {
            batch_rows: 10_000,
            max_points: 100_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Background worker slots
    pub pool_size: usize,

    /// Minimum percentage between two progress events
    pub progress_step: u8,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            pool_size: 2,
            progress_step: 5,
        }
    }
}

impl WorkerSettings {
    /// Pool size clamped to at least one slot
    pub fn effective_pool_size(&self) -> usize {
        self.pool_size.max(1)
    }
}

/// Plot defaults shared by every view
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlotSettings {
    /// Row count above which a dataset counts as large
    pub large_threshold: u64,
    pub progressive_chunk_size: usize,
    pub progressive_chunk_threshold: usize,
    pub default_gradient: String,
    pub default_shades: usize,
}

impl Default for PlotSettings {
    fn default() -> Self {
        Self {
            large_threshold: 50_000,
            progressive_chunk_size: 12_000,
            progressive_chunk_threshold: 10_000,
            default_gradient: "viridis".to_string(),
            default_shades: 512,
        }
    }
}

impl CoreSettings {
    /// Read settings from a JSON file
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file {}", path.display()))?;
        let settings: CoreSettings = serde_json::from_str(&text)
            .with_context(|| format!("Invalid settings in {}", path.display()))?;
        Ok(settings)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text)
            .with_context(|| format!("Failed to write settings file {}", path.display()))?;
        Ok(())
    }

    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.storage.root = root.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = CoreSettings::default();
        assert_eq!(settings.query.batch_rows, 10_000);
        assert_eq!(settings.workers.pool_size, 2);
        assert_eq!(settings.plot.default_gradient, "viridis");
        assert_eq!(settings.plot.default_shades, 512);
        assert_eq!(settings.storage.quota_bytes, 2 * 1024 * 1024 * 1024);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"workers": {"pool_size": 0}, "query": {"batch_rows": 7}}"#).unwrap();

        let settings = CoreSettings::load(&path).unwrap();
        assert_eq!(settings.query.batch_rows, 7);
        assert_eq!(settings.query.max_points, 100_000);
        assert_eq!(settings.workers.effective_pool_size(), 1);
        assert_eq!(settings.storage.folder, "datasets");
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let settings = CoreSettings::default().with_root(dir.path());
        settings.save(&path).unwrap();
        assert_eq!(CoreSettings::load(&path).unwrap(), settings);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(CoreSettings::load("/definitely/not/here.json").is_err());
    }
}
