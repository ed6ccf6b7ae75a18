//! Guest module compilation and the content-addressed module cache.
//!
//! A plugin binary is compiled once per distinct content. Reloading a plugin
//! whose bytes did not change reuses the cached machine code.

use std::hash::{DefaultHasher, Hash, Hasher};
use std::path::Path;
use std::time::Instant;

use dashmap::DashMap;
use tracing::{debug, info, instrument};
use wasmtime::{Engine, Module};

use zeno_common::RuntimeError;

/// A compiled core WebAssembly module.
///
/// Cloning is cheap; the underlying Wasmtime module is reference counted
/// and may be instantiated into many stores.
#[derive(Clone)]
pub struct CompiledModule {
    inner: Module,

    /// Hash of the original Wasm bytes.
    content_hash: String,

    compiled_at: Instant,
}

impl CompiledModule {
    /// Compile a core module from WebAssembly bytes.
    ///
    /// # Errors
    ///
    /// Returns `CompilationFailed` if the bytes are not a valid module.
    #[instrument(skip(engine, bytes), fields(bytes_len = bytes.len()))]
    pub fn from_bytes(engine: &Engine, bytes: &[u8]) -> Result<Self, RuntimeError> {
        let start = Instant::now();

        Self::validate_wasm_header(bytes)?;

        let module = Module::new(engine, bytes).map_err(|e| {
            RuntimeError::compilation_failed(format!("Core module compilation failed: {e}"))
        })?;

        let content_hash = compute_hash(bytes);
        info!(
            content_hash = %content_hash,
            duration_ms = start.elapsed().as_millis(),
            "Core module compiled"
        );

        Ok(Self {
            inner: module,
            content_hash,
            compiled_at: Instant::now(),
        })
    }

    /// Compile a core module from WAT (WebAssembly Text Format).
    ///
    /// # Errors
    ///
    /// Returns `CompilationFailed` if the text does not parse or validate.
    #[instrument(skip(engine, wat))]
    pub fn from_wat(engine: &Engine, wat: &str) -> Result<Self, RuntimeError> {
        let start = Instant::now();

        let module = Module::new(engine, wat).map_err(|e| {
            RuntimeError::compilation_failed(format!("WAT compilation failed: {e}"))
        })?;

        let content_hash = compute_hash(wat.as_bytes());
        debug!(
            content_hash = %content_hash,
            duration_ms = start.elapsed().as_millis(),
            "WAT module compiled"
        );

        Ok(Self {
            inner: module,
            content_hash,
            compiled_at: Instant::now(),
        })
    }

    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    pub fn compiled_at(&self) -> Instant {
        self.compiled_at
    }

    pub fn module(&self) -> &Module {
        &self.inner
    }

    /// Names of the functions this module exports.
    pub fn exported_functions(&self) -> Vec<String> {
        self.inner
            .exports()
            .filter(|e| e.ty().func().is_some())
            .map(|e| e.name().to_string())
            .collect()
    }

    fn validate_wasm_header(bytes: &[u8]) -> Result<(), RuntimeError> {
        if bytes.len() < 8 {
            return Err(RuntimeError::compilation_failed(
                "Invalid Wasm: file too small",
            ));
        }

        if &bytes[0..4] != b"\0asm" {
            return Err(RuntimeError::compilation_failed(
                "Invalid Wasm: bad magic number",
            ));
        }

        Ok(())
    }
}

impl std::fmt::Debug for CompiledModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledModule")
            .field("content_hash", &self.content_hash)
            .finish_non_exhaustive()
    }
}

/// Compiled modules keyed by the hash of their bytes.
#[derive(Debug, Default)]
pub struct ModuleCache {
    modules: DashMap<String, CompiledModule>,
}

impl ModuleCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached module for `bytes`, compiling on a miss.
    ///
    /// # Errors
    ///
    /// Returns `CompilationFailed` when a miss does not compile.
    pub fn get_or_compile(
        &self,
        engine: &Engine,
        bytes: &[u8],
    ) -> Result<CompiledModule, RuntimeError> {
        let hash = compute_hash(bytes);
        if let Some(module) = self.modules.get(&hash) {
            debug!(content_hash = %hash, "module cache hit");
            return Ok(module.clone());
        }
        let module = CompiledModule::from_bytes(engine, bytes)?;
        self.modules.insert(hash, module.clone());
        Ok(module)
    }

    /// Read `path` and resolve it through the cache.
    ///
    /// # Errors
    ///
    /// Returns `Io` when the file cannot be read and `CompilationFailed`
    /// when it does not compile.
    pub fn load_file(
        &self,
        engine: &Engine,
        path: impl AsRef<Path>,
    ) -> Result<CompiledModule, RuntimeError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)
            .map_err(|e| RuntimeError::io(format!("read {}: {e}", path.display())))?;
        self.get_or_compile(engine, &bytes)
    }

    /// Drop the entry for `content_hash`.
    pub fn evict(&self, content_hash: &str) -> bool {
        self.modules.remove(content_hash).is_some()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

/// Compute a hash of the given bytes.
pub fn compute_hash(bytes: &[u8]) -> String {
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}
