//! Configuration for the `colq` command line tool.
//!
//! `colq.toml` in the working directory wins, then
//! `<config dir>/colq/config.toml`. A config file may point at a JSON
//! fixture describing the datasets and faults of a [`MemoryEngine`].
//!
//! ```toml
//! connection_string = "couchbases://localhost"
//! username = "admin"
//! password = "secret"
//! fixture = "fixture.json"
//!
//! [options]
//! num_io_threads = 2
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::engine::{EngineError, Warning};
use crate::error::{Error, Result};
use crate::memory::{Dataset, Faults, MemoryEngine};
use crate::options::{ClusterOptions, Credential, duration_ms};

pub const CONFIG_FILE: &str = "colq.toml";

/// Code used when a fixture fails a stream without naming an error.
const DEFAULT_STREAM_ERROR: i32 = 5002;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub connection_string: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub fixture: Option<PathBuf>,
    pub options: ClusterOptions,
}

impl CliConfig {
    /// Load `explicit` if given, else the first config file found, else
    /// defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load_file(path);
        }
        match Self::search_paths().into_iter().find(|p| p.exists()) {
            Some(path) => Self::load_file(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn search_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from(CONFIG_FILE)];
        if let Some(dir) = dirs::config_dir() {
            paths.push(dir.join("colq").join("config.toml"));
        }
        paths
    }

    fn load_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        let mut config = Self::from_toml(&content)?;
        // Fixture paths are relative to the config file.
        if let (Some(fixture), Some(dir)) = (&config.fixture, path.parent()) {
            if fixture.is_relative() {
                config.fixture = Some(dir.join(fixture));
            }
        }
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn credential(&self) -> Credential {
        Credential::new(
            self.username.clone().unwrap_or_default(),
            self.password.clone().unwrap_or_default(),
        )
    }
}

/// A scripted engine described in JSON.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Fixture {
    /// Reject opens that do not present this credential.
    pub credential: Option<Credential>,
    pub faults: Faults,
    pub datasets: Vec<FixtureDataset>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FixtureDataset {
    pub statement: String,
    #[serde(default)]
    pub rows: Vec<serde_json::Value>,
    #[serde(default)]
    pub warnings: Vec<Warning>,
    #[serde(default)]
    pub fail_at: Option<usize>,
    #[serde(default)]
    pub error: Option<EngineError>,
    #[serde(default, rename = "row_delay_ms", with = "duration_ms")]
    pub row_delay: Duration,
}

impl Fixture {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn into_engine(self) -> MemoryEngine {
        let mut engine = MemoryEngine::new().faults(self.faults);
        if let Some(credential) = self.credential {
            engine = engine.require_credential(credential);
        }
        for ds in self.datasets {
            let mut dataset = Dataset::new().json_rows(&ds.rows).row_delay(ds.row_delay);
            for w in ds.warnings {
                dataset = dataset.warning(w.code, w.message);
            }
            if let Some(index) = ds.fail_at {
                let error = ds
                    .error
                    .unwrap_or_else(|| EngineError::new(DEFAULT_STREAM_ERROR, "unsuccessful operation"));
                dataset = dataset.fail_at(index, error);
            }
            engine = engine.dataset(ds.statement, dataset);
        }
        engine
    }
}
