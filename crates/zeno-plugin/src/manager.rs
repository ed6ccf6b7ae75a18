//! Plugin lifecycle: discovery, load, hot reload, unload.
//!
//! The plugin map sits behind a read-write lock. Slot dispatch takes the
//! read side just long enough to clone a plugin handle; reload holds the
//! write side, so a call never observes a half-swapped plugin.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{error, info, instrument, warn};
use wasmtime::Linker;
use zeno_common::{ExecutionConfig, PluginConfig, RuntimeError};
use zeno_core::Engine;
use zeno_db::DatabaseManager;
use zeno_wasm::{ModuleCache, WasmEngine};

use crate::backend::PluginBackend;
use crate::host::HostContext;
use crate::linker::{PluginState, register_all};
use crate::manifest::{PluginManifest, SlotDeclaration};
use crate::sidecar::SidecarBackend;
use crate::slot::PluginSlot;
use crate::wasm::WasmBackend;
use crate::Permissions;

/// A plugin as currently loaded.
pub struct LoadedPlugin {
    pub manifest: PluginManifest,
    pub dir: PathBuf,
    pub backend: Arc<dyn PluginBackend>,
    pub slots: Vec<SlotDeclaration>,
    /// Content hash of a Wasm binary.
    pub content_hash: Option<String>,
    pub loaded_at: chrono::DateTime<chrono::Utc>,
}

impl LoadedPlugin {
    pub fn info(&self) -> PluginInfo {
        PluginInfo {
            name: self.manifest.name.clone(),
            version: self.manifest.version.clone(),
            kind: self.backend.kind(),
            dir: self.dir.display().to_string(),
            slots: self.slots.iter().map(|s| s.name.clone()).collect(),
            loaded_at: self.loaded_at.to_rfc3339(),
        }
    }
}

impl std::fmt::Debug for LoadedPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedPlugin")
            .field("name", &self.manifest.name)
            .field("kind", &self.backend.kind())
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

/// Summary served by the admin API.
#[derive(Debug, Clone, Serialize)]
pub struct PluginInfo {
    pub name: String,
    pub version: String,
    pub kind: &'static str,
    pub dir: String,
    pub slots: Vec<String>,
    pub loaded_at: String,
}

pub struct PluginManager {
    root: PathBuf,
    engine: Engine,
    wasm: WasmEngine,
    cache: ModuleCache,
    linker: Arc<Linker<PluginState>>,
    execution: ExecutionConfig,
    databases: Option<Arc<DatabaseManager>>,
    plugins: RwLock<BTreeMap<String, Arc<LoadedPlugin>>>,
    this: Weak<PluginManager>,
}

impl PluginManager {
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the host functions cannot be linked.
    pub fn new(
        engine: Engine,
        wasm: WasmEngine,
        config: &PluginConfig,
        execution: ExecutionConfig,
        databases: Option<Arc<DatabaseManager>>,
    ) -> Result<Arc<Self>, RuntimeError> {
        let mut linker = Linker::new(wasm.inner());
        register_all(&mut linker)?;
        let linker = Arc::new(linker);
        let root = PathBuf::from(&config.dir);

        Ok(Arc::new_cyclic(|this| Self {
            root,
            engine,
            wasm,
            cache: ModuleCache::new(),
            linker,
            execution,
            databases,
            plugins: RwLock::new(BTreeMap::new()),
            this: this.clone(),
        }))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Load every plugin directory under the root.
    ///
    /// A missing root is not an error. Plugins that load stay loaded even
    /// when others fail.
    ///
    /// # Errors
    ///
    /// Returns `Plugin` listing every directory that failed.
    #[instrument(skip(self), fields(root = %self.root.display()))]
    pub async fn load_all(&self) -> Result<Vec<String>, RuntimeError> {
        let mut dirs: Vec<PathBuf> = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries
                .filter_map(Result::ok)
                .map(|entry| entry.path())
                .filter(|path| path.is_dir() && PluginManifest::locate(path).is_some())
                .collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("plugin directory does not exist; no plugins loaded");
                return Ok(Vec::new());
            }
            Err(e) => {
                return Err(RuntimeError::io(format!("read {}: {e}", self.root.display())));
            }
        };
        dirs.sort();

        let mut loaded = Vec::new();
        let mut failures = Vec::new();
        for dir in dirs {
            match self.load_dir(&dir).await {
                Ok(name) => loaded.push(name),
                Err(e) => {
                    error!(dir = %dir.display(), error = %e, "plugin failed to load");
                    failures.push(format!("{}: {e}", dir.display()));
                }
            }
        }
        if failures.is_empty() {
            Ok(loaded)
        } else {
            Err(RuntimeError::plugin("*", failures.join("; ")))
        }
    }

    /// Load the plugin in `dir` and register its slots.
    ///
    /// # Errors
    ///
    /// Returns `Plugin` for a duplicate name, `Security` when a slot would
    /// shadow one the plugin does not own, and load errors as they occur.
    pub async fn load_dir(&self, dir: &Path) -> Result<String, RuntimeError> {
        let plugin = self.build(dir).await?;
        let name = plugin.manifest.name.clone();

        let mut plugins = self.plugins.write().await;
        if plugins.contains_key(&name) {
            plugin.backend.shutdown().await;
            return Err(RuntimeError::plugin(&name, "already loaded"));
        }
        if let Err(e) = self.check_slot_names(&plugin, &[]) {
            plugin.backend.shutdown().await;
            return Err(e);
        }
        self.register_slots(&plugin);
        info!(plugin = %name, slots = plugin.slots.len(), kind = plugin.backend.kind(), "plugin loaded");
        plugins.insert(name.clone(), Arc::new(plugin));
        Ok(name)
    }

    /// Swap in a freshly loaded copy of `name`.
    ///
    /// The current copy keeps serving until the new one is ready and stays
    /// in place if loading fails.
    ///
    /// # Errors
    ///
    /// Returns `Plugin` for an unknown name, or the load error.
    #[instrument(skip(self))]
    pub async fn reload(&self, name: &str) -> Result<(), RuntimeError> {
        let mut plugins = self.plugins.write().await;
        let old = plugins
            .remove(name)
            .ok_or_else(|| RuntimeError::plugin(name, "not loaded"))?;

        let fresh = match self.build(&old.dir).await {
            Ok(fresh) if fresh.manifest.name != name => {
                fresh.backend.shutdown().await;
                Err(RuntimeError::plugin(
                    name,
                    format!("manifest now names '{}'", fresh.manifest.name),
                ))
            }
            Ok(fresh) => match self.check_slot_names(&fresh, &old.slots) {
                Ok(()) => Ok(fresh),
                Err(e) => {
                    fresh.backend.shutdown().await;
                    Err(e)
                }
            },
            Err(e) => Err(e),
        };
        let fresh = match fresh {
            Ok(fresh) => fresh,
            Err(e) => {
                warn!(plugin = name, error = %e, "reload failed; keeping previous version");
                plugins.insert(name.to_string(), old);
                return Err(e);
            }
        };

        for stale in &old.slots {
            if !fresh.slots.iter().any(|s| s.name == stale.name) {
                self.engine.registry().unregister(&stale.name);
            }
        }
        self.register_slots(&fresh);
        old.backend.shutdown().await;
        if let Some(hash) = &old.content_hash {
            if fresh.content_hash.as_ref() != Some(hash) {
                self.cache.evict(hash);
            }
        }
        info!(plugin = name, slots = fresh.slots.len(), "plugin reloaded");
        plugins.insert(name.to_string(), Arc::new(fresh));
        Ok(())
    }

    /// Reload every plugin, continuing past failures.
    ///
    /// # Errors
    ///
    /// Returns `Plugin` listing every failed reload.
    pub async fn reload_all(&self) -> Result<(), RuntimeError> {
        let names = self.names().await;
        let mut failures = Vec::new();
        for name in names {
            if let Err(e) = self.reload(&name).await {
                failures.push(format!("{name}: {e}"));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(RuntimeError::plugin("*", failures.join("; ")))
        }
    }

    /// Remove `name` and its slots.
    ///
    /// # Errors
    ///
    /// Returns `Plugin` for an unknown name.
    pub async fn unload(&self, name: &str) -> Result<(), RuntimeError> {
        let plugin = self
            .plugins
            .write()
            .await
            .remove(name)
            .ok_or_else(|| RuntimeError::plugin(name, "not loaded"))?;
        for slot in &plugin.slots {
            self.engine.registry().unregister(&slot.name);
        }
        plugin.backend.shutdown().await;
        if let Some(hash) = &plugin.content_hash {
            self.cache.evict(hash);
        }
        info!(plugin = name, "plugin unloaded");
        Ok(())
    }

    pub async fn get(&self, name: &str) -> Option<Arc<LoadedPlugin>> {
        self.plugins.read().await.get(name).cloned()
    }

    pub async fn names(&self) -> Vec<String> {
        self.plugins.read().await.keys().cloned().collect()
    }

    pub async fn list(&self) -> Vec<PluginInfo> {
        self.plugins
            .read()
            .await
            .values()
            .map(|p| p.info())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.plugins.read().await.len()
    }

    /// Unload every plugin.
    pub async fn shutdown(&self) {
        for name in self.names().await {
            if let Err(e) = self.unload(&name).await {
                warn!(plugin = %name, error = %e, "unload during shutdown failed");
            }
        }
    }

    async fn build(&self, dir: &Path) -> Result<LoadedPlugin, RuntimeError> {
        let manifest = PluginManifest::load(dir)?;
        let name = manifest.name.clone();
        let config = manifest.resolve_config()?;
        let binary = manifest.binary_path(dir);
        if !binary.is_file() {
            return Err(RuntimeError::plugin(
                &name,
                format!("binary {} not found", binary.display()),
            ));
        }

        let (backend, content_hash): (Arc<dyn PluginBackend>, Option<String>) = if manifest.is_wasm() {
            let module = self.cache.load_file(self.wasm.inner(), &binary)?;
            let host = HostContext::new(
                &name,
                Permissions::from_manifest(&manifest.permissions, self.execution.max_http_requests),
                dir.to_path_buf(),
                self.databases.clone(),
            )?;
            let backend = WasmBackend::load(
                &name,
                &self.wasm,
                module,
                self.linker.clone(),
                self.execution.clone(),
                host,
                &config,
            )
            .await?;
            let hash = backend.content_hash().to_string();
            let backend: Arc<dyn PluginBackend> = Arc::new(backend);
            (backend, Some(hash))
        } else {
            let backend = SidecarBackend::spawn(
                &name,
                binary,
                dir,
                &manifest.permissions.env,
                &config,
                manifest.slots.clone(),
                Duration::from_millis(self.execution.timeout_ms),
            )
            .await?;
            let backend: Arc<dyn PluginBackend> = Arc::new(backend);
            (backend, None)
        };

        let slots = match backend.slots().await {
            Ok(slots) => slots,
            Err(e) => {
                backend.shutdown().await;
                return Err(e);
            }
        };
        if let Some(unnamed) = slots.iter().position(|s| s.name.trim().is_empty()) {
            backend.shutdown().await;
            return Err(RuntimeError::plugin(
                &name,
                format!("slot declaration {unnamed} has no name"),
            ));
        }

        Ok(LoadedPlugin {
            manifest,
            dir: dir.to_path_buf(),
            backend,
            slots,
            content_hash,
            loaded_at: chrono::Utc::now(),
        })
    }

    /// A plugin may only claim names that are free or that it held before.
    fn check_slot_names(
        &self,
        plugin: &LoadedPlugin,
        owned: &[SlotDeclaration],
    ) -> Result<(), RuntimeError> {
        for slot in &plugin.slots {
            let previously_owned = owned.iter().any(|s| s.name == slot.name);
            if !previously_owned && self.engine.registry().contains(&slot.name) {
                return Err(RuntimeError::security(format!(
                    "plugin '{}' cannot replace slot '{}'",
                    plugin.manifest.name, slot.name
                )));
            }
        }
        Ok(())
    }

    fn register_slots(&self, plugin: &LoadedPlugin) {
        for slot in &plugin.slots {
            self.engine.register(
                slot.name.clone(),
                Arc::new(PluginSlot::new(self.this.clone(), &plugin.manifest.name)),
                slot.metadata(),
            );
        }
    }
}

impl std::fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginManager")
            .field("root", &self.root)
            .field("cached_modules", &self.cache.len())
            .finish_non_exhaustive()
    }
}
