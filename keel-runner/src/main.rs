//! Keel Runner
//!
//! A worker that turns queued job payloads into supervised tool runs.
//!
//! Architecture:
//! - Configuration: Load settings from environment or defaults
//! - Queue: Redis lists carrying job payloads, plus the cleaner
//! - Repositories: Document store access (jobs, templates, projects, activity)
//! - Families: Command and environment building per tool (ansible, terraform)
//! - Services: Job pipeline, state machine, SSH agent, credentials, processes
//! - Scheduler: Queue consumers, one job per consumer slot
//!
//! Each consumer takes one payload, records `pending`, waits for the previous
//! job if there is one, runs the tool with a private SSH agent and private
//! credential files, and records the terminal status.

mod config;
mod context;
mod family;
mod queue;
mod repository;
mod scheduler;
mod secret;
mod service;
mod shutdown;

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::family::{AnsibleFamily, JobFamily, TerraformFamily};
use crate::queue::{JobQueue, QueueCleaner, RedisQueue};
use crate::repository::{DocumentStore, HttpDocumentStore};
use crate::secret::SecretCodec;
use crate::service::{AgentService, JobPipeline, StandardAgentService};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "keel_runner=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Keel Runner");

    // Load configuration
    let config = load_config()?;
    info!(
        "Loaded configuration: store_url={}, consumers={}, proot={}",
        config.store_url, config.consumers, config.proot_enabled
    );
    if config.uses_dev_secret() {
        warn!("SECRET_KEY not set, using the development key");
    }

    let codec = SecretCodec::new(&config.secret_key).context("Invalid secret key")?;
    let store: Arc<dyn DocumentStore> = Arc::new(HttpDocumentStore::new(config.store_url.clone()));
    let agents: Arc<dyn AgentService> = Arc::new(StandardAgentService::new());

    // Heartbeats must outlive a few missed cleaner ticks
    let queue: Arc<dyn JobQueue> = Arc::new(connect_with_retry(&config, config.cleaner_interval * 4).await?);
    info!("Queue backend connected");

    let shutdown = shutdown::install_shutdown_handler();

    let ansible = AnsibleFamily::new(config.clone(), codec.clone());
    let terraform = TerraformFamily::new(config.clone());
    let queue_names = vec![ansible.queue_name(), terraform.queue_name()];

    let mut handles = Vec::new();
    handles.extend(scheduler::spawn_consumers(
        Arc::new(JobPipeline::new(
            ansible,
            config.clone(),
            codec.clone(),
            Arc::clone(&store),
            Arc::clone(&agents),
        )),
        Arc::clone(&queue),
        config.consumers,
        config.queue_poll_interval,
        &shutdown,
    ));
    handles.extend(scheduler::spawn_consumers(
        Arc::new(JobPipeline::new(
            terraform,
            config.clone(),
            codec,
            store,
            agents,
        )),
        Arc::clone(&queue),
        config.consumers,
        config.queue_poll_interval,
        &shutdown,
    ));

    let cleaner = QueueCleaner::new(queue, queue_names, config.cleaner_interval);
    handles.push(tokio::spawn(cleaner.run(shutdown.clone())));

    info!("Runner initialized successfully");

    for handle in handles {
        if let Err(e) = handle.await {
            error!("Runner task failed: {}", e);
        }
    }

    info!("Keel Runner stopped");
    Ok(())
}

/// Loads configuration from environment variables with fallback to defaults
fn load_config() -> Result<Config> {
    match Config::from_env() {
        Ok(config) => {
            config.validate()?;
            Ok(config)
        }
        Err(e) => {
            info!("Failed to load config from environment ({}), using defaults", e);
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }
}

/// Connects to the queue backend with exponential backoff
///
/// Redis may not be ready yet when the runner starts (common in container
/// environments).
async fn connect_with_retry(config: &Config, heartbeat_ttl: Duration) -> Result<RedisQueue> {
    const MAX_RETRIES: u32 = 10;
    const INITIAL_DELAY_MS: u64 = 500;
    const MAX_DELAY_MS: u64 = 30_000;

    let mut attempt = 0;
    let mut delay_ms = INITIAL_DELAY_MS;

    loop {
        attempt += 1;

        match RedisQueue::connect(&config.redis_url, heartbeat_ttl).await {
            Ok(queue) => {
                if attempt > 1 {
                    info!("Connected to the queue backend after {} attempt(s)", attempt);
                }
                return Ok(queue);
            }
            Err(e) => {
                if attempt >= MAX_RETRIES {
                    error!("Failed to connect to the queue backend after {} attempts", MAX_RETRIES);
                    return Err(anyhow::anyhow!("Failed to connect to the queue backend: {}", e));
                }

                warn!(
                    "Failed to connect to the queue backend (attempt {}/{}): {}",
                    attempt, MAX_RETRIES, e
                );
                warn!("Retrying in {} ms...", delay_ms);

                tokio::time::sleep(Duration::from_millis(delay_ms)).await;

                delay_ms = (delay_ms * 2).min(MAX_DELAY_MS);
            }
        }
    }
}
