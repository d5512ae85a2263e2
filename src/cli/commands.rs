//! CLI command definitions for storee.
//!
//! `serve` runs the scheduler and its operator API. The other commands talk
//! to the queue store directly, so they work whether or not a scheduler is
//! running.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use crate::config::SchedulerConfig;
use crate::metrics::init_metrics;
use crate::scheduler::queue::{
    BATCH_DEAD_LETTER_QUEUE, INCOMPLETE_STORY_QUEUE, STORY_DEAD_LETTER_QUEUE,
    UNDELIVERED_CALLBACK_QUEUE,
};
use crate::scheduler::{
    peek_dead_letters, DeadLetterKind, HttpCallbackSender, HttpComputeBackend, Priority,
    PriorityTaskQueue, Scheduler, StoryQueue, StoryRequest,
};
use crate::store::{QueueStore, RedisStore};

/// Priority-aware story batching scheduler.
#[derive(Parser)]
#[command(name = "storee")]
#[command(about = "Split stories into typed subtasks and dispatch them in weighted batches")]
#[command(version)]
#[command(
    long_about = "storee decomposes submitted stories into character, scene and clip tasks and sends them to a compute backend in size/time-bounded batches, premium traffic first.\n\nConfiguration is read from the environment (and a .env file).\n\nExample usage:\n  storee serve --workers 8\n  storee submit --user u1 --priority paid --file story.txt --callback-url http://me/cb"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run the scheduler and the operator HTTP API.
    Serve(ServeArgs),

    /// Queue a story for decomposition.
    Submit(SubmitArgs),

    /// Show queue lengths, including dead-letter lists.
    Stats(StatsArgs),

    /// Inspect a dead-letter list without removing anything.
    #[command(name = "dead-letters", alias = "dlq")]
    DeadLetters(DeadLettersArgs),
}

/// Arguments for the serve command.
#[derive(Parser, Debug)]
pub struct ServeArgs {
    /// Listen address of the operator API (overrides BIND_ADDR).
    #[arg(long)]
    pub bind: Option<String>,

    /// Initial number of workers (overrides WORKERS_INITIAL).
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Seconds to wait for in-flight batches on shutdown.
    #[arg(long, default_value = "30")]
    pub shutdown_timeout: u64,
}

/// Arguments for the submit command.
#[derive(Parser, Debug)]
pub struct SubmitArgs {
    /// Submitting user.
    #[arg(short = 'u', long)]
    pub user: String,

    /// paid, premium or free.
    #[arg(short = 'p', long, default_value = "free")]
    pub priority: Priority,

    /// Story content; scenes are separated by blank lines.
    #[arg(short = 'c', long, conflicts_with = "file", required_unless_present = "file")]
    pub content: Option<String>,

    /// Read the story content from a file.
    #[arg(short = 'f', long)]
    pub file: Option<PathBuf>,

    /// URL notified once per finished subtask.
    #[arg(long)]
    pub callback_url: String,

    /// Story id; defaults to the request id.
    #[arg(long)]
    pub story_id: Option<String>,

    /// Output as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for the stats command.
#[derive(Parser, Debug)]
pub struct StatsArgs {
    /// Output as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for the dead-letters command.
#[derive(Parser, Debug)]
pub struct DeadLettersArgs {
    /// batches, stories, incomplete or callbacks.
    pub kind: DeadLetterKind,

    /// Maximum number of entries to show, newest first.
    #[arg(short = 'n', long, default_value = "20")]
    pub limit: usize,

    /// Output as JSON lines.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Parse CLI arguments and return the Cli struct.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Serve(args) => run_serve_command(args).await,
        Commands::Submit(args) => run_submit_command(args).await,
        Commands::Stats(args) => run_stats_command(args).await,
        Commands::DeadLetters(args) => run_dead_letters_command(args).await,
    }
}

async fn connect_store(config: &SchedulerConfig) -> anyhow::Result<Arc<dyn QueueStore>> {
    let store = RedisStore::connect(&config.redis_url)
        .await
        .context("Failed to connect to the queue store")?;
    Ok(Arc::new(store))
}

// ============================================================================
// Serve
// ============================================================================

async fn run_serve_command(args: ServeArgs) -> anyhow::Result<()> {
    let mut config = SchedulerConfig::from_env()?;
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }
    if let Some(workers) = args.workers {
        config.initial_workers = workers;
        config.validate()?;
    }

    init_metrics().context("Failed to initialize metrics")?;

    let store = connect_store(&config).await?;
    store.ping().await.context("Queue store health check failed")?;
    info!("Queue store health check passed");

    let backend = Arc::new(HttpComputeBackend::new(
        config.backend_url.clone(),
        config.backend_api_key.clone(),
        config.backend_timeout,
    )?);
    let callbacks = Arc::new(HttpCallbackSender::new(config.callback_timeout)?);

    let bind_addr = config.bind_addr.clone();
    let scheduler = Arc::new(Scheduler::new(config, store, backend, callbacks));
    scheduler.start().await?;

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", bind_addr))?;
    info!(addr = %bind_addr, "Operator API listening");

    axum::serve(listener, crate::api::router(Arc::clone(&scheduler)))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    scheduler
        .shutdown(Duration::from_secs(args.shutdown_timeout))
        .await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

// ============================================================================
// Submit
// ============================================================================

async fn run_submit_command(args: SubmitArgs) -> anyhow::Result<()> {
    let content = match (&args.content, &args.file) {
        (Some(content), _) => content.clone(),
        (None, Some(path)) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?,
        (None, None) => anyhow::bail!("either --content or --file is required"),
    };
    if content.trim().is_empty() {
        anyhow::bail!("story content is empty");
    }

    let config = SchedulerConfig::from_env()?;
    let stories = StoryQueue::new(connect_store(&config).await?);

    let mut story = StoryRequest::new(args.user, args.priority, content, args.callback_url);
    if let Some(story_id) = args.story_id {
        story = story.with_story_id(story_id);
    }
    stories.enqueue_story(&story).await?;

    if args.json {
        let output = serde_json::json!({
            "request_id": story.request_id,
            "status": "queued",
            "priority": story.priority,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!("✓ Story queued");
        println!("  Request id: {}", story.request_id);
        println!("  Priority:   {}", story.priority);
    }
    Ok(())
}

// ============================================================================
// Stats
// ============================================================================

async fn run_stats_command(args: StatsArgs) -> anyhow::Result<()> {
    let config = SchedulerConfig::from_env()?;
    let store = connect_store(&config).await?;

    let task_lengths = PriorityTaskQueue::new(Arc::clone(&store)).lengths().await?;
    let story_lengths = StoryQueue::new(Arc::clone(&store)).lengths().await?;
    let mut terminal = std::collections::BTreeMap::new();
    for queue in [
        BATCH_DEAD_LETTER_QUEUE,
        STORY_DEAD_LETTER_QUEUE,
        INCOMPLETE_STORY_QUEUE,
        UNDELIVERED_CALLBACK_QUEUE,
    ] {
        terminal.insert(queue.to_string(), store.len(queue).await?);
    }

    if args.json {
        let output = serde_json::json!({
            "task_queues": task_lengths,
            "story_queues": story_lengths,
            "dead_letters": terminal,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("=== Task queues ===");
    for (queue, len) in &task_lengths {
        println!("  {:<22}{}", queue, len);
    }
    println!("=== Story queues ===");
    for (class, len) in &story_lengths {
        println!("  {:<22}{}", format!("story_queue:{}", class), len);
    }
    println!("=== Dead letters ===");
    for (queue, len) in &terminal {
        println!("  {:<22}{}", queue, len);
    }
    Ok(())
}

// ============================================================================
// Dead letters
// ============================================================================

async fn run_dead_letters_command(args: DeadLettersArgs) -> anyhow::Result<()> {
    let config = SchedulerConfig::from_env()?;
    let store = connect_store(&config).await?;
    let entries = peek_dead_letters(store.as_ref(), args.kind, args.limit).await?;

    if entries.is_empty() {
        if args.json {
            println!("[]");
        } else {
            println!("{} is empty.", args.kind.queue_name());
        }
        return Ok(());
    }

    if args.json {
        for entry in &entries {
            println!("{}", serde_json::to_string(entry)?);
        }
        return Ok(());
    }

    println!("{} (newest first, {} shown)", args.kind.queue_name(), entries.len());
    for entry in &entries {
        println!("{}", serde_json::to_string_pretty(entry)?);
    }
    Ok(())
}
