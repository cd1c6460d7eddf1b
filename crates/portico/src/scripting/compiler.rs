//! Script compilation and bytecode caching.
//!
//! Scripts live in the configured directory as `.rhai` files; the file
//! stem is the script's logical name. Names with a `global-` prefix are
//! startup scripts (see [`crate::scripting::registry`]). The first request
//! that references a name reads and compiles the file and caches the
//! compiled AST; an explicit reload invalidates everything.

use crate::models::error::GatewayError;
use ahash::AHasher;
use chrono::{DateTime, Utc};
use log::{debug, info};
use rhai::{Engine, AST};
use std::hash::Hasher;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

/// File extension scripts must carry.
pub const SCRIPT_EXTENSION: &str = "rhai";

/// Filename prefix marking a startup script.
pub const GLOBAL_PREFIX: &str = "global-";

/// One compiled script retained until reload.
#[derive(Debug, Clone)]
pub struct CompiledScript {
    pub ast: AST,
    /// Stable hash of the source bytes; identical sources re-hash
    /// identically across reloads.
    pub source_hash: u64,
    pub loaded_at: DateTime<Utc>,
}

/// Name-keyed cache of compiled scripts.
///
/// Readers take a read lock; reload takes the write lock and swaps the
/// map out.
pub struct ScriptCache {
    dir: PathBuf,
    entries: RwLock<ahash::AHashMap<String, Arc<CompiledScript>>>,
}

impl ScriptCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            entries: RwLock::new(ahash::AHashMap::new()),
        }
    }

    pub fn scripts_dir(&self) -> &Path {
        &self.dir
    }

    /// Returns the cached compilation for `name`, loading and compiling
    /// the file on first use.
    ///
    /// # Errors
    ///
    /// [`GatewayError::ScriptLoad`] for traversal-unsafe names, missing or
    /// unreadable files, and compile failures.
    pub fn load(&self, engine: &Engine, name: &str) -> Result<Arc<CompiledScript>, GatewayError> {
        if let Some(entry) = self
            .entries
            .read()
            .expect("script cache poisoned")
            .get(name)
        {
            return Ok(Arc::clone(entry));
        }

        let entry = Arc::new(self.compile(engine, name)?);

        let mut entries = self.entries.write().expect("script cache poisoned");
        // A racing request may have compiled the same script; keep the
        // first entry so hashes and load times stay consistent.
        let entry = entries
            .entry(name.to_string())
            .or_insert(entry)
            .clone();
        Ok(entry)
    }

    fn compile(&self, engine: &Engine, name: &str) -> Result<CompiledScript, GatewayError> {
        if name.is_empty() || name.contains('/') || name.contains('\\') || name.contains("..") {
            return Err(GatewayError::ScriptLoad {
                name: name.to_string(),
                message: "script names must be plain file stems".to_string(),
            });
        }

        let path = self.dir.join(format!("{}.{}", name, SCRIPT_EXTENSION));
        let source = std::fs::read_to_string(&path).map_err(|e| GatewayError::ScriptLoad {
            name: name.to_string(),
            message: format!("{}: {}", path.display(), e),
        })?;

        let ast = engine
            .compile(&source)
            .map_err(|e| GatewayError::ScriptLoad {
                name: name.to_string(),
                message: e.to_string(),
            })?;

        let mut hasher = AHasher::default();
        hasher.write(source.as_bytes());
        let source_hash = hasher.finish();

        debug!(
            "component=script event=compiled name={} hash={:x}",
            name, source_hash
        );

        Ok(CompiledScript {
            ast,
            source_hash,
            loaded_at: Utc::now(),
        })
    }

    /// Invalidates every cached compilation and rescans the directory.
    ///
    /// Returns the number of script files currently present. Entries are
    /// recompiled lazily on next use; unchanged sources produce the same
    /// `source_hash` set.
    pub fn reload(&self) -> usize {
        let mut entries = self.entries.write().expect("script cache poisoned");
        let dropped = entries.len();
        entries.clear();
        drop(entries);

        let present = self.scan_names().map(|names| names.len()).unwrap_or(0);
        info!(
            "component=script event=cache_reloaded dropped={} present={}",
            dropped, present
        );
        present
    }

    /// Logical names of every `global-*` script on disk, sorted for a
    /// deterministic startup order.
    pub fn global_script_names(&self) -> Result<Vec<String>, GatewayError> {
        let mut names: Vec<String> = self
            .scan_names()
            .map_err(|e| GatewayError::ScriptLoad {
                name: self.dir.display().to_string(),
                message: e.to_string(),
            })?
            .into_iter()
            .filter(|n| n.starts_with(GLOBAL_PREFIX))
            .collect();
        names.sort();
        Ok(names)
    }

    fn scan_names(&self) -> std::io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some(SCRIPT_EXTENSION) {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        Ok(names)
    }

    /// Snapshot of the cached `(name, source_hash)` set.
    pub fn hashes(&self) -> Vec<(String, u64)> {
        let entries = self.entries.read().expect("script cache poisoned");
        let mut hashes: Vec<(String, u64)> = entries
            .iter()
            .map(|(name, entry)| (name.clone(), entry.source_hash))
            .collect();
        hashes.sort();
        hashes
    }
}
