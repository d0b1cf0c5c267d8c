use std::collections::HashMap;
use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use parking_lot::Mutex;
use serde::Serialize;

use crate::dsl::source::stitch;
use crate::paths;
use crate::settings::CompilerSettings;

// ── Error type ──────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ProjectError {
    Io(std::io::Error),
    Json(serde_json::Error),
    InvalidProject(String),
}

impl fmt::Display for ProjectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProjectError::Io(e) => write!(f, "I/O error: {e}"),
            ProjectError::Json(e) => write!(f, "JSON error: {e}"),
            ProjectError::InvalidProject(msg) => write!(f, "Invalid project: {msg}"),
        }
    }
}

impl std::error::Error for ProjectError {}

impl From<std::io::Error> for ProjectError {
    fn from(e: std::io::Error) -> Self {
        ProjectError::Io(e)
    }
}

impl From<serde_json::Error> for ProjectError {
    fn from(e: serde_json::Error) -> Self {
        ProjectError::Json(e)
    }
}

impl Serialize for ProjectError {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

// ── Writes ──────────────────────────────────────────────────────────

/// Per-file mutex map to serialize concurrent writes to the same path.
static FILE_LOCKS: LazyLock<Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Write bytes to `path` via a `.tmp` sibling, fsync, then rename over the target.
///
/// The previous file, if any, is kept as a `.bak` sibling (best-effort).
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<(), ProjectError> {
    let lock = FILE_LOCKS
        .lock()
        .entry(path.to_path_buf())
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone();
    let _guard = lock.lock();

    let file_name = path.file_name().unwrap_or_default();

    let mut tmp_name = OsString::from(file_name);
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(&tmp_name);

    let mut bak_name = OsString::from(file_name);
    bak_name.push(".bak");
    let bak_path = path.with_file_name(&bak_name);

    let mut file = fs::File::create(&tmp_path)?;
    file.write_all(data)?;
    file.sync_all()?;
    drop(file);

    if path.exists() {
        let _ = fs::rename(path, &bak_path);
    }
    fs::rename(&tmp_path, path)?;

    tracing::debug!(path = %path.display(), bytes = data.len(), "wrote file");
    Ok(())
}

pub(crate) fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), ProjectError> {
    let json = serde_json::to_string_pretty(value)?;
    atomic_write(path, json.as_bytes())
}

pub(crate) fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ProjectError> {
    let data = fs::read_to_string(path)?;
    let value = serde_json::from_str(&data)?;
    Ok(value)
}

// ── Chain loading ───────────────────────────────────────────────────

/// One script directory of an inheritance chain, stitched into a single unit.
#[derive(Debug, Clone)]
pub struct Layer {
    pub dir: PathBuf,
    /// Source files in stitch order.
    pub files: Vec<PathBuf>,
    pub source: String,
    /// `#extends` text from the entry file, as written.
    pub extends: Option<String>,
}

/// The first `#extends` target in an entry file. `#out` is left to the compiler.
fn scan_extends(text: &str) -> Option<String> {
    text.lines()
        .find_map(|line| line.trim().strip_prefix("#extends "))
        .map(|rest| rest.trim().to_string())
}

/// Load `dir` and every directory it `#extends`, base first.
pub fn load_chain(dir: &Path, settings: &CompilerSettings) -> Result<Vec<Layer>, ProjectError> {
    let mut visiting = Vec::new();
    let mut chain = Vec::new();
    collect_chain(dir, settings, &mut visiting, &mut chain)?;
    tracing::debug!(
        dir = %dir.display(),
        layers = chain.len(),
        "discovered inheritance chain"
    );
    Ok(chain)
}

fn collect_chain(
    dir: &Path,
    settings: &CompilerSettings,
    visiting: &mut Vec<PathBuf>,
    chain: &mut Vec<Layer>,
) -> Result<(), ProjectError> {
    let dir = fs::canonicalize(dir).map_err(|e| {
        ProjectError::InvalidProject(format!("script directory {}: {e}", dir.display()))
    })?;
    if visiting.contains(&dir) {
        return Err(ProjectError::InvalidProject(format!(
            "#extends cycle through {}",
            dir.display()
        )));
    }
    visiting.push(dir.clone());

    let entry = paths::entry_path(&dir, &settings.entry_file);
    if !entry.is_file() {
        return Err(ProjectError::InvalidProject(format!(
            "no {} in {}",
            settings.entry_file,
            dir.display()
        )));
    }
    let extends = scan_extends(&fs::read_to_string(&entry)?);
    if let Some(base) = &extends {
        collect_chain(&paths::extends_path(&dir, base), settings, visiting, chain)?;
    }

    let mut files: Vec<PathBuf> = fs::read_dir(&dir)?
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| paths::is_source_file(p, &settings.extension))
        .collect();
    files.sort();

    let mut contents = Vec::with_capacity(files.len());
    for file in &files {
        contents.push((file.to_string_lossy().into_owned(), fs::read_to_string(file)?));
    }
    let source = stitch(contents.iter().map(|(p, c)| (p.as_str(), c.as_str())));

    tracing::debug!(
        dir = %dir.display(),
        files = files.len(),
        extends = ?extends,
        "loaded layer"
    );
    chain.push(Layer {
        dir,
        files,
        source,
        extends,
    });
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_scan_extends_first_wins() {
        let text = "#out a.bin\n  #extends ../base \n#extends other\nscript main() { }";
        assert_eq!(scan_extends(text).as_deref(), Some("../base"));
        assert_eq!(scan_extends("script main() { }"), None);
    }

    #[test]
    fn test_chain_is_base_first_and_sorted() {
        let root = scratch("raic_test_chain");
        fs::create_dir_all(root.join("base")).unwrap();
        fs::create_dir_all(root.join("hero")).unwrap();
        fs::write(root.join("base/main.rai"), "script main() { }").unwrap();
        fs::write(root.join("hero/main.rai"), "#extends base\n").unwrap();
        fs::write(root.join("hero/b.rai"), "script b() { }").unwrap();
        fs::write(root.join("hero/a.rai"), "script a() { }").unwrap();
        fs::write(root.join("hero/notes.txt"), "ignored").unwrap();

        let chain = load_chain(&root.join("hero"), &CompilerSettings::default()).unwrap();
        assert_eq!(chain.len(), 2);
        assert!(chain[0].dir.ends_with("base"));
        assert_eq!(chain[0].extends, None);
        assert_eq!(chain[1].extends.as_deref(), Some("base"));

        let names: Vec<_> = chain[1]
            .files
            .iter()
            .map(|f| f.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.rai", "b.rai", "main.rai"]);

        let a = chain[1].files[0].to_string_lossy().into_owned();
        assert!(chain[1]
            .source
            .starts_with(&format!("\n\n#__FILE__ {a}\n\nscript a() {{ }}")));

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn test_extends_cycle() {
        let root = scratch("raic_test_cycle");
        fs::create_dir_all(root.join("a")).unwrap();
        fs::create_dir_all(root.join("b")).unwrap();
        fs::write(root.join("a/main.rai"), "#extends b").unwrap();
        fs::write(root.join("b/main.rai"), "#extends a").unwrap();

        let err = load_chain(&root.join("a"), &CompilerSettings::default()).unwrap_err();
        assert!(err.to_string().contains("cycle"), "got: {err}");

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn test_missing_entry_file() {
        let root = scratch("raic_test_no_main");
        let err = load_chain(&root, &CompilerSettings::default()).unwrap_err();
        assert!(err.to_string().contains("no main.rai"), "got: {err}");
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn test_atomic_write_keeps_backup() {
        let root = scratch("raic_test_atomic");
        let path = root.join("out.bin");
        atomic_write(&path, &[1, 2]).unwrap();
        atomic_write(&path, &[3]).unwrap();
        assert_eq!(fs::read(&path).unwrap(), vec![3]);
        assert_eq!(fs::read(root.join("out.bin.bak")).unwrap(), vec![1, 2]);
        assert!(!root.join("out.bin.tmp").exists());
        let _ = fs::remove_dir_all(&root);
    }
}
