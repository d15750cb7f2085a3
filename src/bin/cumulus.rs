use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use cumulus::actions::builtin::register_builtins;
use cumulus::config::Config;
use cumulus::flow::redis_store::RedisFlowStore;
use cumulus::flow::{
    FlowBuilder, FlowScheduler, FlowStore, InMemoryFlowStore, ParamOverrides, load_template_from_yaml,
};
use cumulus::queue::redis_broker::{RedisResultBackend, RedisTaskQueue};
use cumulus::queue::{
    InMemoryResultBackend, InMemoryTaskQueue, QueueAdapter, ResultBackend, SubmitRequest, TaskQueue,
    Worker,
};
use cumulus::registry::TaskRegistry;
use cumulus::wait::wait_for_flow_with_cancel;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to a YAML config file
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Redis connection URL (overrides the config file)
    #[arg(long, global = true)]
    redis: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build a flow from a template and run it in memory (Standalone Mode)
    Run {
        /// Path to the flow template YAML file
        template: PathBuf,

        /// Parameter overrides, `{"params": [{"action_name", "param"}]}`
        #[arg(long)]
        params: Option<PathBuf>,
    },

    /// Consume tasks from Redis and execute them
    Worker {
        /// Worker name (for logging)
        #[arg(long, default_value = "worker")]
        name: String,
    },

    /// Drive pending flows stored in Redis
    Scheduler,

    /// Submit a task payload (JSON) to Redis
    Submit {
        payload: PathBuf,
    },

    /// Print the recorded state of a queued instance
    Status {
        task_id: String,
    },

    /// Create a flow from a template in Redis and wait for it
    Flow {
        template: PathBuf,

        #[arg(long)]
        params: Option<PathBuf>,

        /// Return right after the flow is created
        #[arg(long)]
        no_wait: bool,
    },
}

struct Backends {
    queue: Arc<dyn TaskQueue>,
    backend: Arc<dyn ResultBackend>,
    store: Arc<dyn FlowStore>,
}

fn redis_backends(config: &Config) -> Result<Backends> {
    let settings = &config.redis;
    let client = redis::Client::open(settings.url.as_str())
        .with_context(|| format!("Invalid Redis URL {}", settings.url))?;
    Ok(Backends {
        queue: Arc::new(RedisTaskQueue::new(client.clone(), settings.queue_key.clone())),
        backend: Arc::new(RedisResultBackend::new(
            client.clone(),
            settings.key_prefix.clone(),
            settings.result_ttl_secs,
        )),
        store: Arc::new(RedisFlowStore::new(client, settings.key_prefix.clone())),
    })
}

fn memory_backends() -> Backends {
    Backends {
        queue: Arc::new(InMemoryTaskQueue::new(1024)),
        backend: Arc::new(InMemoryResultBackend::default()),
        store: Arc::new(InMemoryFlowStore::new()),
    }
}

fn load_overrides(path: Option<PathBuf>) -> Result<ParamOverrides> {
    let Some(path) = path else {
        return Ok(ParamOverrides::default());
    };
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read parameters from {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Failed to parse parameters from {}", path.display()))
}

fn shutdown_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested.");
            token.cancel();
        }
    });
    cancel
}

async fn build_and_wait(
    config: &Config,
    store: Arc<dyn FlowStore>,
    template: PathBuf,
    params: Option<PathBuf>,
    wait: bool,
    cancel: &CancellationToken,
) -> Result<()> {
    let template = load_template_from_yaml(&template)?;
    let overrides = load_overrides(params)?;
    let flow = FlowBuilder::new(store.clone())
        .build_from_template(&template, &overrides, BTreeMap::new())
        .await?;
    println!("{}", flow.id);
    if wait {
        wait_for_flow_with_cancel(store.as_ref(), &flow.id, &config.wait.options(), cancel).await?;
        info!(flow_id = %flow.id, "Flow succeeded.");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(url) = cli.redis {
        config.redis.url = url;
    }

    let registry = Arc::new(TaskRegistry::new());
    let namespace = config.worker.namespace.clone();
    register_builtins(&registry, &namespace);
    let cancel = shutdown_on_ctrl_c();

    match cli.command {
        Commands::Run { template, params } => {
            info!("Running in Standalone Memory Mode");
            let b = memory_backends();
            let worker = Arc::new(Worker::new(
                "local",
                &registry,
                &namespace,
                b.queue.clone(),
                b.backend.clone(),
                config.worker.options(),
            ));
            let adapter = Arc::new(QueueAdapter::new(b.queue, b.backend, registry.clone(), &namespace));
            let scheduler = Arc::new(FlowScheduler::new(b.store.clone(), adapter, config.scheduler.options()));

            let background = cancel.child_token();
            let worker_handle = tokio::spawn(worker.run(background.clone()));
            let scheduler_handle = tokio::spawn(scheduler.watch(background.clone()));

            let outcome = build_and_wait(&config, b.store, template, params, true, &cancel).await;
            background.cancel();
            worker_handle.await??;
            scheduler_handle.await??;
            outcome?;
        }

        Commands::Worker { name } => {
            info!("[{}] Starting worker, Redis: {}", name, config.redis.url);
            let b = redis_backends(&config)?;
            let worker = Arc::new(Worker::new(
                name,
                &registry,
                &namespace,
                b.queue,
                b.backend,
                config.worker.options(),
            ));
            worker.run(cancel).await?;
        }

        Commands::Scheduler => {
            info!("Starting flow scheduler, Redis: {}", config.redis.url);
            let b = redis_backends(&config)?;
            let adapter = Arc::new(QueueAdapter::new(b.queue, b.backend, registry.clone(), &namespace));
            let scheduler = Arc::new(FlowScheduler::new(b.store, adapter, config.scheduler.options()));
            scheduler.watch(cancel).await?;
        }

        Commands::Submit { payload } => {
            let raw = std::fs::read_to_string(&payload)
                .with_context(|| format!("Failed to read payload from {}", payload.display()))?;
            let request: SubmitRequest = serde_json::from_str(&raw)
                .with_context(|| format!("Failed to parse payload from {}", payload.display()))?;
            let b = redis_backends(&config)?;
            let adapter = QueueAdapter::new(b.queue, b.backend, registry.clone(), &namespace);
            match adapter.submit(request).await {
                Ok(response) => println!("{}", serde_json::to_string_pretty(&response)?),
                Err(e) => {
                    error!(error = %e, "Submission rejected");
                    return Err(e.into());
                }
            }
        }

        Commands::Status { task_id } => {
            let b = redis_backends(&config)?;
            let adapter = QueueAdapter::new(b.queue, b.backend, registry.clone(), &namespace);
            match adapter.task_state(&task_id).await? {
                Some(state) => println!("{}", serde_json::to_string_pretty(&state)?),
                None => println!("{} has no recorded state (never dispatched)", task_id),
            }
        }

        Commands::Flow { template, params, no_wait } => {
            let b = redis_backends(&config)?;
            build_and_wait(&config, b.store, template, params, !no_wait, &cancel).await?;
        }
    }

    Ok(())
}
