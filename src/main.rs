mod broker;
mod config;
mod error;
mod extract;
mod governor;
mod ipc;
mod memory;
mod metrics_http;
mod models;
mod pipeline;
mod project;
mod session_ingest;
mod startup;
mod storage;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde_json::json;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use broker::{EmbeddingBroker, WorkerSpawnConfig};
use config::{EnvConfig, ModelConfig, UserConfig};
use governor::{GovernorThresholds, ResourceGate, ResourceGovernor};
use ipc::client::SpecmemClient;
use ipc::server::InstanceState;
use memory::MemoryStore;
use models::Priority;
use pipeline::Pipeline;
use project::Project;
use storage::PostgresStorage;

#[derive(Parser)]
#[command(name = "specmem")]
#[command(about = "Per-project semantic memory and code-indexing service", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the instance for the current (or given) project, daemonizing.
    Start {
        /// Project directory (defaults to current working directory)
        #[arg(long)]
        project_dir: Option<String>,
        /// Stay in the foreground instead of daemonizing
        #[arg(long)]
        foreground: bool,
    },

    /// Stop the running instance for this project
    Stop {
        #[arg(long)]
        project_dir: Option<String>,
    },

    /// Show instance status
    Status {
        #[arg(long)]
        project_dir: Option<String>,
    },

    /// Trigger a reindex pass
    Reindex {
        #[arg(long)]
        project_dir: Option<String>,
        /// Clear the code index first
        #[arg(long)]
        force: bool,
    },

    /// Inspect or edit the project's tier configuration
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
        #[arg(long)]
        project_dir: Option<String>,
    },

    /// Save a memory (debug wrapper around the `saveMemory` tool-surface call)
    SaveMemory {
        content: String,
        #[arg(long)]
        kind: Option<String>,
        #[arg(long)]
        importance: Option<String>,
        #[arg(long = "tag")]
        tags: Vec<String>,
        #[arg(long)]
        project_dir: Option<String>,
    },

    /// Search memories (debug wrapper around the `findMemory` tool-surface call)
    FindMemory {
        query: String,
        #[arg(long)]
        k: Option<i64>,
        #[arg(long)]
        threshold: Option<f64>,
        #[arg(long)]
        kind: Option<String>,
        #[arg(long = "tag")]
        tags_any: Vec<String>,
        #[arg(long)]
        project_dir: Option<String>,
    },

    /// Fetch a single memory by id (debug wrapper around `getMemory`)
    GetMemory {
        id: String,
        #[arg(long)]
        project_dir: Option<String>,
    },

    /// Search indexed code (debug wrapper around `findCodePointers`)
    FindCodePointers {
        query: String,
        #[arg(long)]
        k: Option<i64>,
        #[arg(long)]
        project_dir: Option<String>,
    },

    /// Report indexing/embedding backlog (debug wrapper around `checkSync`)
    CheckSync {
        #[arg(long)]
        project_dir: Option<String>,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective model-config.json
    Get,
    /// Set a tier preset (small|medium|large)
    Set {
        tier: String,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start { project_dir, foreground } => handle_start(project_dir, foreground),
        Commands::Stop { project_dir } => handle_stop(project_dir),
        Commands::Status { project_dir } => handle_status(project_dir),
        Commands::Reindex { project_dir, force } => handle_reindex(project_dir, force),
        Commands::Config { action, project_dir } => handle_config(action, project_dir),
        Commands::SaveMemory { content, kind, importance, tags, project_dir } => {
            handle_save_memory(content, kind, importance, tags, project_dir)
        }
        Commands::FindMemory { query, k, threshold, kind, tags_any, project_dir } => {
            handle_find_memory(query, k, threshold, kind, tags_any, project_dir)
        }
        Commands::GetMemory { id, project_dir } => handle_get_memory(id, project_dir),
        Commands::FindCodePointers { query, k, project_dir } => {
            handle_find_code_pointers(query, k, project_dir)
        }
        Commands::CheckSync { project_dir } => handle_check_sync(project_dir),
    }
}

fn resolve_project_dir(project_dir: Option<String>) -> anyhow::Result<PathBuf> {
    Ok(match project_dir {
        Some(dir) => PathBuf::from(dir).canonicalize()?,
        None => std::env::current_dir()?.canonicalize()?,
    })
}

// === `start`: daemonize (or run in foreground) the instance for a project ===

fn handle_start(project_dir: Option<String>, foreground: bool) -> anyhow::Result<()> {
    let cwd = resolve_project_dir(project_dir)?;
    let project = Project::resolve(&cwd)?;

    if foreground {
        return run_instance_blocking(cwd);
    }

    let log_file = project.service_log_path();
    let pid_file = project.run_path("specmem.pid");

    let daemonize = daemonize::Daemonize::new()
        .pid_file(&pid_file)
        .stdout(std::fs::File::create(&log_file)?)
        .stderr(std::fs::File::create(&log_file)?);

    match daemonize.start() {
        Ok(_) => run_instance_blocking(cwd),
        Err(e) => {
            eprintln!("failed to daemonize: {e}");
            std::process::exit(1);
        }
    }
}

/// Builds a multi-threaded runtime and drives one project's instance to
/// completion (`running` until shutdown is signalled, then `stopping`).
fn run_instance_blocking(project_dir: PathBuf) -> anyhow::Result<()> {
    let num_cpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4);
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads((num_cpus / 2).max(4))
        .max_blocking_threads(num_cpus)
        .thread_name("specmem-worker")
        .enable_all()
        .build()?;

    rt.block_on(run_instance(project_dir))
}

fn init_logging(debug_text: bool) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "specmem=info".into());

    if debug_text {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    }
}

async fn run_instance(project_dir: PathBuf) -> anyhow::Result<()> {
    let env_config = EnvConfig::from_env();
    init_logging(env_config.debug);

    let project = Arc::new(Project::resolve(&project_dir)?);
    tracing::info!(project_hash = %project.hash, "specmem instance starting (pid {})", std::process::id());

    // C2: Startup Coordinator — acquire startup lock, clean up stale state,
    // bind the instance-lock socket.
    let listener = match startup::coordinate_startup(&project).await? {
        startup::StartupOutcome::Primary { listener } => listener,
        startup::StartupOutcome::DeferToExisting => {
            tracing::info!("another instance already owns this project, exiting");
            return Ok(());
        }
    };

    let user_config = UserConfig::load_or_seed(&project.user_config_path(), &env_config).await?;
    let model_config = ModelConfig::load_or_default(&project.model_config_path()).await;
    tracing::info!(tier = ?model_config.tier, "loaded tier configuration");

    let governor = ResourceGovernor::spawn(
        GovernorThresholds {
            cpu_max_percent: user_config.cpu_max,
            ram_max_percent: bytes_to_percent(user_config.ram_max_mb),
            idle_cpu_max_percent: user_config.cpu_min,
            idle_ram_max_percent: bytes_to_percent(user_config.ram_min_mb),
        },
        Duration::from_secs(2),
    );
    let governor_gate: Arc<dyn ResourceGate> = governor.clone();

    // C3: per-project schema bootstrap.
    let storage = Arc::new(
        PostgresStorage::connect(&env_config.connection_string()?, &project.schema_name).await?,
    );

    // C4: Embedding Broker — spawns and supervises the external worker process.
    let spawn_config = WorkerSpawnConfig::from_env()
        .ok_or_else(|| anyhow::anyhow!("SPECMEM_EMBEDDING_WORKER_CMD is not set"))?;
    let broker = EmbeddingBroker::new(
        project.clone(),
        spawn_config,
        governor_gate.clone(),
        model_config.embedding.max_concurrent,
    );
    broker.start().await?;
    if let Some(dim) = broker.dimension().await {
        storage.ensure_embedding_dimension(dim).await?;
    }

    let memory = Arc::new(MemoryStore::new(
        storage.clone(),
        broker.clone(),
        project.path.to_string_lossy().to_string(),
    ));

    let (pipeline, progress_rx) = Pipeline::new(project.clone(), storage.clone(), broker.clone(), governor_gate.clone());
    let pipeline = Arc::new(pipeline);

    let shutdown_token = startup::spawn_shutdown_watch();

    let project_override = config::load_project_override(&project.path);

    // Constructed before the bootstrap/periodic indexing task so that
    // automatic passes record `last_batch_at` the same way manual `reindex`
    // IPC calls do.
    let state = Arc::new(InstanceState::new(
        project.clone(),
        storage.clone(),
        broker.clone(),
        memory.clone(),
        pipeline.clone(),
        governor_gate,
        progress_rx,
        shutdown_token.clone(),
    ));

    // Run the initial indexing pass in the background, then settle into a
    // periodic reconciliation loop (§4.6 design note: batched, not watched).
    let bootstrap_state = state.clone();
    let bootstrap_ignores = project_override.ignore.clone();
    let bootstrap_token = shutdown_token.clone();
    tokio::spawn(async move {
        if let Err(e) = bootstrap_state.pipeline.run_once(&bootstrap_ignores, Priority::High).await {
            tracing::warn!("initial indexing pass failed: {e}");
        } else {
            bootstrap_state.record_batch_completed();
        }

        let mut interval = tokio::time::interval(Duration::from_secs(300));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = bootstrap_state.pipeline.run_once(&bootstrap_ignores, Priority::Low).await {
                        tracing::warn!("periodic indexing pass failed: {e}");
                    } else {
                        bootstrap_state.record_batch_completed();
                    }
                }
                _ = bootstrap_token.cancelled() => break,
            }
        }
    });

    // Session transcripts: ingest once at startup, restartable/idempotent.
    if let Some(transcripts_dir) = session_ingest::default_transcripts_dir() {
        let memory_for_ingest = memory.clone();
        tokio::spawn(async move {
            match session_ingest::ingest_sessions(&memory_for_ingest, &transcripts_dir).await {
                Ok(n) => tracing::info!("ingested {n} session memories"),
                Err(e) => tracing::warn!("session ingest failed: {e}"),
            }
        });
    }

    startup::update_instance_status(&project, models::InstanceStatus::Running).await?;

    // [AMBIENT] Prometheus metrics HTTP server. Per-project instances can run
    // concurrently, so operators scraping more than one should override the
    // default via SPECMEM_METRICS_ADDR.
    let metrics_addr = std::env::var("SPECMEM_METRICS_ADDR").unwrap_or_else(|_| "127.0.0.1:9091".to_string());
    let metrics_state = state.clone();
    let metrics_cancel = shutdown_token.clone();
    tokio::spawn(async move {
        metrics_http::serve_metrics(&metrics_addr, metrics_state, metrics_cancel).await;
    });

    let listener = ipc::server::run(listener, state).await?;

    startup::update_instance_status(&project, models::InstanceStatus::Stopping).await?;
    broker.stop().await;
    startup::teardown(&project, listener).await;
    tracing::info!("specmem instance stopped gracefully");

    Ok(())
}

fn bytes_to_percent(ram_mb: u64) -> f32 {
    // user-config stores absolute MB thresholds; the governor operates on
    // percentages of total memory, sampled at runtime via sysinfo, so this
    // is an approximation anchored to a typical 16GiB development machine
    // when no better baseline is available.
    let assumed_total_mb = 16_384.0_f32;
    ((ram_mb as f32 / assumed_total_mb) * 100.0).clamp(1.0, 100.0)
}

// === Shared CLI helper ===

fn cli_runtime() -> anyhow::Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Runtime::new()?)
}

fn handle_stop(project_dir: Option<String>) -> anyhow::Result<()> {
    let rt = cli_runtime()?;
    rt.block_on(async {
        let cwd = resolve_project_dir(project_dir)?;
        let project = Project::resolve(&cwd)?;
        let sock = project.instance_socket();

        if !SpecmemClient::is_alive(&sock).await {
            println!("Instance is not running.");
            return anyhow::Ok(());
        }

        let mut client = SpecmemClient::connect(&sock).await?;
        let _ = client.call("shutdown", json!({})).await;
        println!("Shutdown requested.");
        anyhow::Ok(())
    })
}

fn handle_status(project_dir: Option<String>) -> anyhow::Result<()> {
    let rt = cli_runtime()?;
    rt.block_on(async {
        let cwd = resolve_project_dir(project_dir)?;
        let project = Project::resolve(&cwd)?;
        let sock = project.instance_socket();

        if !SpecmemClient::is_alive(&sock).await {
            println!("Status: STOPPED");
            return anyhow::Ok(());
        }

        let mut client = SpecmemClient::connect(&sock).await?;
        let health = client.call("health", json!({})).await?;
        let stats = client.call("stats", json!({})).await?;

        println!("Status: RUNNING");
        println!("{}", serde_json::to_string_pretty(&json!({ "health": health, "stats": stats }))?);
        anyhow::Ok(())
    })
}

fn handle_reindex(project_dir: Option<String>, force: bool) -> anyhow::Result<()> {
    let rt = cli_runtime()?;
    rt.block_on(async {
        let cwd = resolve_project_dir(project_dir)?;
        let project = Project::resolve(&cwd)?;
        let sock = project.instance_socket();

        if !SpecmemClient::is_alive(&sock).await {
            anyhow::bail!("instance is not running; start it first with `specmem start`");
        }

        let mut client = SpecmemClient::connect(&sock).await?;
        let result = client.call("reindex", json!({ "force": force })).await?;
        println!("{}", serde_json::to_string_pretty(&result)?);
        anyhow::Ok(())
    })
}

fn handle_config(action: Option<ConfigAction>, project_dir: Option<String>) -> anyhow::Result<()> {
    let rt = cli_runtime()?;
    rt.block_on(async {
        let cwd = resolve_project_dir(project_dir)?;
        let project = Project::resolve(&cwd)?;

        match action {
            Some(ConfigAction::Get) | None => {
                let cfg = ModelConfig::load_or_default(&project.model_config_path()).await;
                println!("{}", serde_json::to_string_pretty(&cfg)?);
            }
            Some(ConfigAction::Set { tier }) => {
                let tier = match tier.to_lowercase().as_str() {
                    "small" => config::Tier::Small,
                    "medium" => config::Tier::Medium,
                    "large" => config::Tier::Large,
                    other => anyhow::bail!("unknown tier '{other}', expected small|medium|large"),
                };
                let cfg = ModelConfig::for_tier(tier);
                cfg.persist(&project.model_config_path()).await?;
                println!("Tier set to {tier:?}");
            }
        }
        anyhow::Ok(())
    })
}

// === Thin debug wrappers for the tool surface (saveMemory/findMemory/etc) ===

async fn connected_client(project_dir: Option<String>) -> anyhow::Result<SpecmemClient> {
    let cwd = resolve_project_dir(project_dir)?;
    let project = Project::resolve(&cwd)?;
    let sock = project.instance_socket();
    if !SpecmemClient::is_alive(&sock).await {
        anyhow::bail!("instance is not running; start it first with `specmem start`");
    }
    SpecmemClient::connect(&sock).await
}

fn handle_save_memory(
    content: String,
    kind: Option<String>,
    importance: Option<String>,
    tags: Vec<String>,
    project_dir: Option<String>,
) -> anyhow::Result<()> {
    let rt = cli_runtime()?;
    rt.block_on(async {
        let mut client = connected_client(project_dir).await?;
        let result = client
            .call(
                "saveMemory",
                json!({ "content": content, "kind": kind, "importance": importance, "tags": tags }),
            )
            .await?;
        println!("{}", serde_json::to_string_pretty(&result)?);
        anyhow::Ok(())
    })
}

fn handle_find_memory(
    query: String,
    k: Option<i64>,
    threshold: Option<f64>,
    kind: Option<String>,
    tags_any: Vec<String>,
    project_dir: Option<String>,
) -> anyhow::Result<()> {
    let rt = cli_runtime()?;
    rt.block_on(async {
        let mut client = connected_client(project_dir).await?;
        let result = client
            .call(
                "findMemory",
                json!({
                    "query": query,
                    "k": k,
                    "threshold": threshold,
                    "kindFilter": kind,
                    "tagsAny": tags_any,
                }),
            )
            .await?;
        println!("{}", serde_json::to_string_pretty(&result)?);
        anyhow::Ok(())
    })
}

fn handle_get_memory(id: String, project_dir: Option<String>) -> anyhow::Result<()> {
    let rt = cli_runtime()?;
    rt.block_on(async {
        let mut client = connected_client(project_dir).await?;
        let result = client.call("getMemory", json!({ "id": id })).await?;
        println!("{}", serde_json::to_string_pretty(&result)?);
        anyhow::Ok(())
    })
}

fn handle_find_code_pointers(
    query: String,
    k: Option<i64>,
    project_dir: Option<String>,
) -> anyhow::Result<()> {
    let rt = cli_runtime()?;
    rt.block_on(async {
        let mut client = connected_client(project_dir).await?;
        let result = client
            .call("findCodePointers", json!({ "query": query, "k": k }))
            .await?;
        println!("{}", serde_json::to_string_pretty(&result)?);
        anyhow::Ok(())
    })
}

fn handle_check_sync(project_dir: Option<String>) -> anyhow::Result<()> {
    let rt = cli_runtime()?;
    rt.block_on(async {
        let mut client = connected_client(project_dir).await?;
        let result = client.call("checkSync", json!({})).await?;
        println!("{}", serde_json::to_string_pretty(&result)?);
        anyhow::Ok(())
    })
}
