//! Zeno CLI entry point.
//!
//! `zeno serve` loads a program tree, wires databases, the job queue and
//! plugins into one engine, and serves the routes the program registers.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use zeno_common::{ConfigFile, RuntimeConfig};
use zeno_core::{Analyzer, Engine};
use zeno_db::DatabaseManager;
use zeno_plugin::PluginManager;
use zeno_server::{AppState, MiddlewareRegistry, ZenoServer};
use zeno_vm::Chunk;
use zeno_wasm::WasmEngine;
use zeno_worker::{JobHandlers, Queue, SqliteQueue, WorkerPool};

#[derive(Parser)]
#[command(name = "zeno")]
#[command(about = "Declarative application runtime", long_about = None)]
#[command(version)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true, env = "ZENO_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve a program over HTTP
    Serve {
        /// Program tree (defaults to `program` from the config file)
        program: Option<PathBuf>,
    },

    /// Run static analysis and report every problem
    Check { program: PathBuf },

    /// Compile the root tree to bytecode
    Compile {
        program: PathBuf,

        #[arg(short, long, default_value = "out.zbc")]
        output: PathBuf,
    },

    /// Print the instructions of a compiled chunk
    Disasm { file: PathBuf },

    /// Print slot documentation as JSON
    Docs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let (config, file_program) = load_config(cli.config.as_deref())?;
    init_tracing(config.server.is_production());

    match cli.command {
        Commands::Serve { program } => {
            let program = program
                .or(file_program)
                .context("no program given and none set in the config file")?;
            serve(config, &program).await
        }
        Commands::Check { program } => check(&config, &program).await,
        Commands::Compile { program, output } => compile(&program, &output),
        Commands::Disasm { file } => disasm(&file),
        Commands::Docs => {
            let (engine, plugins) = offline_engine(&config).await?;
            let docs = engine.documentation();
            if let Some(manager) = plugins {
                manager.shutdown().await;
            }
            println!("{}", serde_json::to_string_pretty(&docs)?);
            Ok(())
        }
    }
}

/// Defaults, then the TOML file, then the environment.
fn load_config(path: Option<&Path>) -> anyhow::Result<(RuntimeConfig, Option<PathBuf>)> {
    let (mut config, program) = match path {
        Some(path) => {
            let file = ConfigFile::from_file(path)
                .with_context(|| format!("failed to load {}", path.display()))?;
            (file.runtime, file.program.map(PathBuf::from))
        }
        None => (RuntimeConfig::default(), None),
    };
    config
        .apply_process_env()
        .context("invalid environment configuration")?;
    Ok((config, program))
}

fn init_tracing(production: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,zeno=debug".into());
    let json = production.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
    });
    let plain =
        (!production).then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr));
    tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(plain)
        .init();
}

async fn serve(config: RuntimeConfig, program: &Path) -> anyhow::Result<()> {
    info!(program = %program.display(), env = %config.server.app_env, "Starting zeno");
    let shutdown = CancellationToken::new();
    let engine = Engine::new();

    let databases = Arc::new(
        DatabaseManager::from_config(&config.database)
            .await
            .context("failed to connect databases")?,
    );
    zeno_db::register(&engine, &databases);

    let queue: Arc<dyn Queue> = Arc::new(
        SqliteQueue::open(&config.worker.queue_db)
            .await
            .context("failed to open the job queue")?
            .with_lease(config.worker.lease())
            .with_max_attempts(config.worker.max_attempts),
    );
    let handlers = Arc::new(JobHandlers::new());
    zeno_worker::register(&engine, &queue, &handlers);

    let plugins = if config.plugins.enabled {
        let wasm = WasmEngine::new(&config.engine)?;
        if config.engine.epoch_interruption {
            let _ticker = wasm.spawn_epoch_ticker(Duration::from_millis(1), shutdown.clone());
        }
        let manager = PluginManager::new(
            engine.clone(),
            wasm,
            &config.plugins,
            config.execution.clone(),
            Some(Arc::clone(&databases)),
        )?;
        match manager.load_all().await {
            Ok(names) => info!(plugins = ?names, "plugins loaded"),
            Err(e) => warn!(error = %e, "some plugins failed to load"),
        }
        Some(manager)
    } else {
        None
    };

    let mut state = AppState::from_config(engine.clone(), &config.server);
    if let Some(manager) = &plugins {
        state = state.with_plugins(Arc::clone(manager));
    }
    let routes = state
        .load_program(program)
        .await
        .with_context(|| format!("failed to load {}", program.display()))?;
    info!(routes, "program loaded");

    let workers = if config.worker.enabled {
        if handlers.is_empty() {
            warn!("worker enabled but the program declares no job handlers");
        }
        let pool = WorkerPool::new(Arc::clone(&queue), engine.clone(), handlers, &config.worker)
            .with_job_timeout(config.server.request_timeout());
        Some(Arc::new(pool).spawn(shutdown.clone()))
    } else {
        None
    };

    let watcher = if config.server.live_reload {
        let dir = program
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        Some(zeno_server::livereload::watch(state.clone(), dir, shutdown.clone())?)
    } else {
        None
    };

    if config.admin.enabled && !config.admin.is_configured() {
        warn!("admin API enabled without a token; it stays disabled");
    }
    let result = ZenoServer::new(state, config.server, config.admin)
        .run(shutdown.clone())
        .await;

    shutdown.cancel();
    if let Some(watcher) = watcher {
        let _ = watcher.await;
    }
    if let Some(workers) = workers {
        workers.shutdown().await;
    }
    if let Some(manager) = plugins {
        manager.shutdown().await;
    }
    databases.close().await;
    result?;
    Ok(())
}

/// Engine with every built-in slot and the configured plugins, but no
/// network connections. Shut the returned manager down when done.
async fn offline_engine(
    config: &RuntimeConfig,
) -> anyhow::Result<(Engine, Option<Arc<PluginManager>>)> {
    let engine = Engine::new();
    let databases = Arc::new(DatabaseManager::new());
    zeno_db::register(&engine, &databases);

    let queue: Arc<dyn Queue> = Arc::new(SqliteQueue::in_memory().await?);
    zeno_worker::register(&engine, &queue, &Arc::new(JobHandlers::new()));
    zeno_server::slots::register(&engine, &Arc::new(MiddlewareRegistry::new()));

    if config.plugins.enabled {
        let wasm = WasmEngine::new(&config.engine)?;
        let manager = PluginManager::new(
            engine.clone(),
            wasm,
            &config.plugins,
            config.execution.clone(),
            None,
        )?;
        if let Err(e) = manager.load_all().await {
            warn!(error = %e, "some plugins failed to load");
        }
        return Ok((engine, Some(manager)));
    }
    Ok((engine, None))
}

async fn check(config: &RuntimeConfig, program: &Path) -> anyhow::Result<()> {
    let (engine, plugins) = offline_engine(config).await?;
    let root = engine
        .loader()
        .load(program)
        .with_context(|| format!("failed to load {}", program.display()))?;
    let problems = Analyzer::new(&engine).run(&root);
    if let Some(manager) = plugins {
        manager.shutdown().await;
    }
    if problems.is_empty() {
        println!("{}: ok", program.display());
        return Ok(());
    }
    for problem in &problems {
        eprintln!("{problem}");
    }
    bail!("{} problem(s) found", problems.len())
}

fn compile(program: &Path, output: &Path) -> anyhow::Result<()> {
    let root = Engine::new()
        .loader()
        .load(program)
        .with_context(|| format!("failed to load {}", program.display()))?;
    let chunk = zeno_vm::compile(&root)?;
    let bytes = chunk.to_bytes()?;
    std::fs::write(output, &bytes)
        .with_context(|| format!("failed to write {}", output.display()))?;
    println!("{} -> {} ({} bytes)", program.display(), output.display(), bytes.len());
    Ok(())
}

fn disasm(file: &Path) -> anyhow::Result<()> {
    let bytes = std::fs::read(file).with_context(|| format!("failed to read {}", file.display()))?;
    let chunk = Chunk::from_bytes(&bytes)?;
    let name = file
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("chunk");
    print!("{}", zeno_vm::disassemble(&chunk, name));
    Ok(())
}
