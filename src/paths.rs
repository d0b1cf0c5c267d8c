//! Centralized path definitions for script directories and compiler config.
//!
//! This module is the single source of truth for leaf filenames and the rules
//! that turn `#out`/`#extends` directive text into paths. No other module
//! should hard-code these strings.

use std::path::{Path, PathBuf};

// ── Leaf filenames ───────────────────────────────────────────────

pub const SETTINGS_FILE: &str = "raic.json";
pub const MAIN_FILE: &str = "main.rai";
pub const SOURCE_EXTENSION: &str = "rai";

// ── Config ───────────────────────────────────────────────────────

pub fn settings_path(config_dir: &Path) -> PathBuf {
    config_dir.join(SETTINGS_FILE)
}

// ── Script directories ───────────────────────────────────────────

pub fn entry_path(dir: &Path, entry_file: &str) -> PathBuf {
    dir.join(entry_file)
}

pub fn is_source_file(path: &Path, extension: &str) -> bool {
    path.is_file() && path.extension().is_some_and(|e| e == extension)
}

/// `#extends` paths are relative to the directory holding the script directory.
pub fn extends_path(dir: &Path, extends: &str) -> PathBuf {
    dir.parent().unwrap_or(dir).join(extends)
}

/// `#out` paths are relative to the character directory when one is configured.
pub fn out_path(dir: &Path, character_dir: Option<&Path>, out: &str) -> PathBuf {
    character_dir.unwrap_or(dir).join(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directive_paths() {
        let dir = Path::new("/chars/fighter");
        assert_eq!(extends_path(dir, "base"), PathBuf::from("/chars/base"));
        assert_eq!(out_path(dir, None, "a.bin"), PathBuf::from("/chars/fighter/a.bin"));
        assert_eq!(
            out_path(dir, Some(Path::new("/game/chars")), "fighter/a.bin"),
            PathBuf::from("/game/chars/fighter/a.bin")
        );
    }
}
