//! Small JSON file remembering the last selected merchant across restarts.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("state file I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("state file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedState {
    pub last_merchant_id: Option<String>,
}

/// ~/.local/share/soundbox/state.json on Linux.
pub fn default_path() -> Option<PathBuf> {
    dirs::data_local_dir().map(|d| d.join("soundbox").join("state.json"))
}

impl SavedState {
    /// A missing file is an empty state, not an error.
    pub fn load(path: &Path) -> Result<Self, StateError> {
        match fs::read_to_string(path) {
            Ok(contents) => Ok(serde_json::from_str(&contents)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), StateError> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        debug!("Saved state to {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_empty_state() {
        let dir = tempfile::tempdir().unwrap();
        let state = SavedState::load(&dir.path().join("state.json")).unwrap();
        assert_eq!(state, SavedState::default());
    }

    #[test]
    fn remembers_last_merchant() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");

        let state = SavedState {
            last_merchant_id: Some("m_42".into()),
        };
        state.save(&path).unwrap();

        assert_eq!(SavedState::load(&path).unwrap(), state);
        assert!(fs::read_to_string(&path).unwrap().contains("lastMerchantId"));
    }

    #[test]
    fn corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "{not json").unwrap();
        assert!(matches!(SavedState::load(&path), Err(StateError::Json(_))));
    }
}
