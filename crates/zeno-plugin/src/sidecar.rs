//! Sidecar plugin backend: a native process spoken to over NDJSON.
//!
//! The host writes one [`CallRequest`] per line to the child's stdin and
//! reads one [`Envelope`] line back from its stdout. The child's stderr is
//! inherited. Slots come from the manifest's `slots` list, or from a
//! `plugin_register_slots` request when the manifest declares none.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use zeno_common::RuntimeError;
use zeno_core::ValueMap;

use crate::backend::{CallOutcome, CallRequest, PluginBackend};
use crate::host::Envelope;
use crate::manifest::SlotDeclaration;

/// Environment variable carrying the resolved plugin config as JSON.
pub const CONFIG_ENV: &str = "ZENO_PLUGIN_CONFIG";

/// Request name used to ask a sidecar for its slots.
pub const REGISTER_SLOTS: &str = "plugin_register_slots";

struct SidecarProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

pub struct SidecarBackend {
    name: String,
    binary: PathBuf,
    dir: PathBuf,
    env: Vec<(String, String)>,
    timeout: Duration,
    declared: Vec<SlotDeclaration>,
    /// A dead or desynchronized process is dropped and respawned on the
    /// next call.
    process: Mutex<Option<SidecarProcess>>,
    closed: std::sync::atomic::AtomicBool,
}

impl SidecarBackend {
    /// Launch the sidecar.
    ///
    /// Only `PATH`, the variables listed in the manifest's `env`
    /// permission and the config variable reach the child.
    ///
    /// # Errors
    ///
    /// Returns `Plugin` when the process cannot be spawned.
    pub async fn spawn(
        name: &str,
        binary: PathBuf,
        dir: &Path,
        allowed_env: &[String],
        config: &serde_json::Map<String, serde_json::Value>,
        declared: Vec<SlotDeclaration>,
        timeout: Duration,
    ) -> Result<Self, RuntimeError> {
        let mut env: Vec<(String, String)> = std::iter::once("PATH")
            .chain(allowed_env.iter().map(String::as_str))
            .filter_map(|key| std::env::var(key).ok().map(|v| (key.to_string(), v)))
            .collect();
        let config = serde_json::to_string(config)
            .map_err(|e| RuntimeError::plugin(name, format!("config: {e}")))?;
        env.push((CONFIG_ENV.to_string(), config));

        let backend = Self {
            name: name.to_string(),
            binary,
            dir: dir.to_path_buf(),
            env,
            timeout,
            declared,
            process: Mutex::new(None),
            closed: std::sync::atomic::AtomicBool::new(false),
        };
        let process = backend.launch()?;
        *backend.process.lock().await = Some(process);
        info!(plugin = name, binary = %backend.binary.display(), "sidecar started");
        Ok(backend)
    }

    fn launch(&self) -> Result<SidecarProcess, RuntimeError> {
        let mut child = Command::new(&self.binary)
            .current_dir(&self.dir)
            .env_clear()
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                RuntimeError::plugin(
                    &self.name,
                    format!("spawn {}: {e}", self.binary.display()),
                )
            })?;
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(RuntimeError::plugin(&self.name, "sidecar pipes unavailable"));
        };
        Ok(SidecarProcess {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
        })
    }

    async fn roundtrip(&self, request: &CallRequest) -> Result<Envelope, RuntimeError> {
        if self.closed.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(RuntimeError::plugin(&self.name, "plugin has been unloaded"));
        }
        let mut line = serde_json::to_string(request)
            .map_err(|e| RuntimeError::plugin(&self.name, format!("request: {e}")))?;
        line.push('\n');

        let mut guard = self.process.lock().await;
        if guard.is_none() {
            warn!(plugin = %self.name, "respawning sidecar");
            *guard = Some(self.launch()?);
        }
        let Some(process) = guard.as_mut() else {
            return Err(RuntimeError::plugin(&self.name, "sidecar unavailable"));
        };

        let exchange = async {
            process.stdin.write_all(line.as_bytes()).await?;
            process.stdin.flush().await?;
            process.stdout.next_line().await
        };
        let reply = match tokio::time::timeout(self.timeout, exchange).await {
            Ok(Ok(Some(reply))) => reply,
            Ok(Ok(None)) => {
                *guard = None;
                return Err(RuntimeError::plugin(&self.name, "sidecar exited"));
            }
            Ok(Err(e)) => {
                *guard = None;
                return Err(RuntimeError::plugin(&self.name, format!("sidecar I/O: {e}")));
            }
            Err(_) => {
                // The reply may still arrive; the stream can no longer be trusted.
                *guard = None;
                return Err(RuntimeError::Timeout {
                    duration_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
                });
            }
        };
        debug!(plugin = %self.name, slot = %request.slot_name, "sidecar replied");
        serde_json::from_str(&reply)
            .map_err(|e| RuntimeError::plugin(&self.name, format!("malformed reply: {e}")))
    }
}

#[async_trait]
impl PluginBackend for SidecarBackend {
    fn kind(&self) -> &'static str {
        "sidecar"
    }

    async fn slots(&self) -> Result<Vec<SlotDeclaration>, RuntimeError> {
        if !self.declared.is_empty() {
            return Ok(self.declared.clone());
        }
        let reply = self
            .roundtrip(&CallRequest {
                slot_name: REGISTER_SLOTS.into(),
                parameters: serde_json::Map::new(),
                context: None,
            })
            .await?;
        if !reply.success {
            return Err(RuntimeError::plugin(
                &self.name,
                reply.error.unwrap_or_else(|| "slot registration failed".into()),
            ));
        }
        let slots = match reply.data {
            Some(serde_json::Value::Object(mut data)) => data.remove("slots").unwrap_or_default(),
            Some(other) => other,
            None => serde_json::Value::Array(Vec::new()),
        };
        serde_json::from_value(slots)
            .map_err(|e| RuntimeError::plugin(&self.name, format!("slot declarations: {e}")))
    }

    async fn call(&self, request: CallRequest, _scope: ValueMap) -> Result<CallOutcome, RuntimeError> {
        self.roundtrip(&request).await.map(CallOutcome::reply)
    }

    async fn shutdown(&self) {
        self.closed.store(true, std::sync::atomic::Ordering::SeqCst);
        let Some(mut process) = self.process.lock().await.take() else {
            return;
        };
        drop(process.stdin);
        match tokio::time::timeout(Duration::from_secs(2), process.child.wait()).await {
            Ok(Ok(status)) => debug!(plugin = %self.name, %status, "sidecar exited"),
            _ => {
                if let Err(e) = process.child.kill().await {
                    warn!(plugin = %self.name, error = %e, "failed to kill sidecar");
                }
            }
        }
    }
}

impl std::fmt::Debug for SidecarBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SidecarBackend")
            .field("name", &self.name)
            .field("binary", &self.binary)
            .finish_non_exhaustive()
    }
}
