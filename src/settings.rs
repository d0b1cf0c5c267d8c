use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::project::{read_json, write_json, ProjectError};

const SETTINGS_VERSION: u32 = 1;

/// Compiler configuration stored in `raic.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct CompilerSettings {
    pub version: u32,
    /// Builtins table file. None = compile against an empty table.
    #[serde(default)]
    pub builtins_path: Option<PathBuf>,
    /// Root that `#out` paths are relative to. None = the script directory.
    #[serde(default)]
    pub character_dir: Option<PathBuf>,
    #[serde(default = "default_entry_file")]
    pub entry_file: String,
    #[serde(default = "default_extension")]
    pub extension: String,
}

fn default_entry_file() -> String {
    crate::paths::MAIN_FILE.to_string()
}

fn default_extension() -> String {
    crate::paths::SOURCE_EXTENSION.to_string()
}

impl Default for CompilerSettings {
    fn default() -> Self {
        Self {
            version: SETTINGS_VERSION,
            builtins_path: None,
            character_dir: None,
            entry_file: default_entry_file(),
            extension: default_extension(),
        }
    }
}

/// Load settings from `path`. A missing file yields defaults.
pub fn load_settings(path: &Path) -> Result<CompilerSettings, ProjectError> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "no settings file, using defaults");
        return Ok(CompilerSettings::default());
    }
    let settings: CompilerSettings = read_json(path)?;
    if settings.version > SETTINGS_VERSION {
        return Err(ProjectError::InvalidProject(format!(
            "Settings version {} is newer than supported version {SETTINGS_VERSION}",
            settings.version
        )));
    }
    Ok(settings)
}

pub fn save_settings(path: &Path, settings: &CompilerSettings) -> Result<(), ProjectError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    write_json(path, settings)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_round_trip() {
        let dir = std::env::temp_dir().join("raic_test_settings");
        let _ = std::fs::remove_dir_all(&dir);
        let path = crate::paths::settings_path(&dir);

        let settings = CompilerSettings {
            builtins_path: Some(PathBuf::from("/rt/builtins.txt")),
            ..CompilerSettings::default()
        };
        save_settings(&path, &settings).unwrap();
        let loaded = load_settings(&path).expect("should load");
        assert_eq!(loaded, settings);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = std::env::temp_dir().join("raic_test_settings_partial");
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        let path = crate::paths::settings_path(&dir);
        std::fs::write(&path, r#"{ "version": 1, "character_dir": "/game" }"#).unwrap();

        let loaded = load_settings(&path).unwrap();
        assert_eq!(loaded.character_dir, Some(PathBuf::from("/game")));
        assert_eq!(loaded.entry_file, "main.rai");
        assert_eq!(loaded.extension, "rai");
        assert_eq!(loaded.builtins_path, None);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_load_missing_returns_defaults() {
        let path = std::env::temp_dir().join("raic_test_no_settings").join("raic.json");
        assert_eq!(load_settings(&path).unwrap(), CompilerSettings::default());
    }

    #[test]
    fn test_future_version_rejected() {
        let dir = std::env::temp_dir().join("raic_test_settings_version");
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        let path = crate::paths::settings_path(&dir);
        std::fs::write(&path, r#"{ "version": 99 }"#).unwrap();

        let err = load_settings(&path).unwrap_err();
        assert!(err.to_string().contains("newer than supported"));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
