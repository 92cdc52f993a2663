use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{AppError, AppResult};
use crate::state::{ReserveState, StateStore};

/// JSON state file. Writes go to a temporary sibling and are renamed into
/// place, so a crash never leaves a half-written record behind.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "state.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl StateStore for JsonFileStore {
    fn read_state(&self) -> AppResult<ReserveState> {
        let bytes = fs::read(&self.path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => {
                AppError::StateUnavailable(format!("{} does not exist", self.path.display()))
            }
            _ => AppError::StateUnavailable(format!(
                "could not read {}: {}",
                self.path.display(),
                e
            )),
        })?;

        Ok(serde_json::from_slice(&bytes)?)
    }

    fn write_state(&self, state: &ReserveState) -> AppResult<()> {
        let json = serde_json::to_vec_pretty(state)?;
        let temp = self.temp_path();

        {
            let mut file = File::create(&temp)?;
            file.write_all(&json)?;
            file.sync_all()?;
        }
        fs::rename(&temp, &self.path)?;

        debug!("💾 State written to {}", self.path.display());
        Ok(())
    }
}
