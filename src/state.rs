use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;

use crate::dsl::encoder::encode;
use crate::dsl::resolver::Session;
use crate::dsl::symbols::{Identifier, Symbol};
use crate::dsl::{Builtins, CompilationUnit};
use crate::error::AppError;
use crate::paths;
use crate::project::{self, Layer};
use crate::settings::CompilerSettings;

// ── Compiled output ────────────────────────────────────────────────

/// Result of compiling one script directory and its inheritance chain.
pub struct CompiledProject {
    /// Base first; layer `i` compiled at depth `i + 1`.
    pub layers: Vec<Layer>,
    pub unit: CompilationUnit,
    /// One encoded image per layer, taken right after that layer compiled.
    pub images: Vec<Vec<u8>>,
    pub builtins: Arc<Builtins>,
}

impl CompiledProject {
    /// Where layer `index` wants its image written, if it declared `#out`.
    pub fn out_path(&self, index: usize, settings: &CompilerSettings) -> Option<PathBuf> {
        let layer = self.layers.get(index)?;
        let depth = u32::try_from(index + 1).ok()?;
        let out = self.unit.layer(depth)?.out.as_deref()?;
        Some(paths::out_path(&layer.dir, settings.character_dir.as_deref(), out))
    }
}

struct CachedBuiltins {
    modified: Option<SystemTime>,
    table: Arc<Builtins>,
}

// ── Workspace ──────────────────────────────────────────────────────

/// Process-wide compiler state shared by every request.
///
/// Compilations are serialized behind `compile_lock`; the last successful
/// result per directory stays queryable after a failed compile.
pub struct Workspace {
    settings: CompilerSettings,
    builtins: Mutex<Option<CachedBuiltins>>,
    compile_lock: Mutex<()>,
    last_good: Mutex<HashMap<PathBuf, Arc<CompiledProject>>>,
}

impl Workspace {
    pub fn new(settings: CompilerSettings) -> Self {
        Self {
            settings,
            builtins: Mutex::new(None),
            compile_lock: Mutex::new(()),
            last_good: Mutex::new(HashMap::new()),
        }
    }

    /// The builtins table, re-read whenever the file's modification time changes.
    pub fn builtins(&self) -> Result<Arc<Builtins>, AppError> {
        let mut cache = self.builtins.lock();
        let Some(path) = &self.settings.builtins_path else {
            if let Some(cached) = cache.as_ref() {
                return Ok(cached.table.clone());
            }
            tracing::warn!("no builtins path configured, compiling against an empty table");
            let table = Arc::new(Builtins::default());
            *cache = Some(CachedBuiltins {
                modified: None,
                table: table.clone(),
            });
            return Ok(table);
        };

        let modified = fs::metadata(path)
            .and_then(|m| m.modified())
            .map_err(|e| AppError::BuiltinsError {
                message: format!("{}: {e}", path.display()),
            })?;
        if let Some(cached) = cache.as_ref().filter(|c| c.modified == Some(modified)) {
            return Ok(cached.table.clone());
        }

        let text = fs::read_to_string(path)?;
        let table = Arc::new(Builtins::parse(&text)?);
        tracing::info!(
            path = %path.display(),
            commands = table.commands().count(),
            globals = table.globals().count(),
            "loaded builtins table"
        );
        *cache = Some(CachedBuiltins {
            modified: Some(modified),
            table: table.clone(),
        });
        Ok(table)
    }

    /// Compile `dir` and its chain, encoding each layer as soon as it is resolved.
    pub fn check(&self, dir: &Path) -> Result<Arc<CompiledProject>, AppError> {
        let _guard = self.compile_lock.lock();
        let builtins = self.builtins()?;
        let layers = project::load_chain(dir, &self.settings)?;

        let mut session = Session::new(&builtins).entry_file(&self.settings.entry_file);
        let mut images = Vec::with_capacity(layers.len());
        for layer in &layers {
            let depth = session.compile_layer(&layer.source)?;
            images.push(encode(session.unit(), depth, &builtins)?);
        }
        let unit = session.finish();

        tracing::info!(
            dir = %dir.display(),
            layers = layers.len(),
            scripts = unit.scripts().len(),
            functions = unit.functions().len(),
            "compiled"
        );
        let compiled = Arc::new(CompiledProject {
            layers,
            unit,
            images,
            builtins: builtins.clone(),
        });
        self.last_good
            .lock()
            .insert(dir.to_path_buf(), compiled.clone());
        Ok(compiled)
    }

    /// Compile and write every layer that declares `#out`. Returns the written paths.
    pub fn build(&self, dir: &Path) -> Result<Vec<PathBuf>, AppError> {
        let compiled = self.check(dir)?;
        let mut written = Vec::new();
        for (index, image) in compiled.images.iter().enumerate() {
            let Some(path) = compiled.out_path(index, &self.settings) else {
                if let Some(layer) = compiled.layers.get(index) {
                    tracing::warn!(dir = %layer.dir.display(), "layer has no #out, skipping");
                }
                continue;
            };
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            project::atomic_write(&path, image)?;
            tracing::info!(path = %path.display(), bytes = image.len(), "wrote image");
            written.push(path);
        }
        Ok(written)
    }

    /// Last successful compile of `dir`, if any.
    pub fn last_good(&self, dir: &Path) -> Option<Arc<CompiledProject>> {
        self.last_good.lock().get(dir).cloned()
    }

    /// Recompile, falling back to the last good result when the source is broken.
    fn current(&self, dir: &Path) -> Result<Arc<CompiledProject>, AppError> {
        match self.check(dir) {
            Ok(compiled) => Ok(compiled),
            Err(e) => {
                tracing::debug!(error = %e, "compile failed, using last good result");
                self.last_good(dir).ok_or(e)
            }
        }
    }

    pub fn symbols(&self, dir: &Path) -> Result<Vec<Symbol>, AppError> {
        let compiled = self.current(dir)?;
        Ok(compiled.unit.symbols(&compiled.builtins))
    }

    /// [`Self::symbols`] plus what is visible inside the body of `callable`.
    pub fn symbols_in(&self, dir: &Path, callable: &str) -> Result<Vec<Symbol>, AppError> {
        let compiled = self.current(dir)?;
        let scope = compiled
            .unit
            .body_of(callable)
            .ok_or_else(|| AppError::NotFound {
                what: format!("script or function '{callable}'"),
            })?;
        Ok(compiled.unit.symbols_in_scope(&compiled.builtins, scope))
    }

    pub fn definition(&self, dir: &Path, name: &str) -> Result<Identifier, AppError> {
        let compiled = self.current(dir)?;
        compiled
            .unit
            .find_definition(name)
            .cloned()
            .ok_or_else(|| AppError::NotFound {
                what: format!("definition of '{name}'"),
            })
    }
}
