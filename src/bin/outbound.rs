//! outbound CLI: run dispatchers and inspect the work queue.

use clap::{Parser, Subcommand};
use outbound::config::Config;
use outbound::config::secrets::redact_url;
use outbound::db::{Db, PgQueueStore};
use outbound::engine::Dispatcher;
use outbound::handler::HandlerRegistry;
use outbound::handler::builtin::{LogMailer, register_builtins};
use outbound::model::work::{NewWorkItem, Status, WorkFilter, WorkId};
use outbound::queue::QueueStore;
use outbound::telemetry::{TelemetryConfig, init_telemetry};
use outbound::transport::{AmqpTransport, RedisStreamTransport, TransportRouter};
use secrecy::ExposeSecret;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "outbound", about = "Durable work-queue dispatcher")]
struct Cli {
    /// TOML file with a [dispatch] table
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run dispatcher instances until Ctrl-C
    Serve {
        /// Number of dispatcher instances
        #[arg(long, default_value_t = 1)]
        workers: usize,
    },
    /// Enqueue a work item
    Enqueue {
        /// Work type (selects the handler)
        work_type: String,
        /// Payload, usually JSON
        payload: String,
        /// Delay the first attempt by this many seconds
        #[arg(long)]
        delay_secs: Option<i64>,
    },
    /// List work items, newest first
    List {
        /// Filter by status (pending, completed, dead_lettered)
        #[arg(long)]
        status: Option<String>,
        /// Filter by work type
        #[arg(long, name = "type")]
        work_type: Option<String>,
        /// Maximum items to show
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Show one work item
    Show { id: WorkId },
    /// Mark a work item completed (operator resolution)
    Complete { id: WorkId },
    /// Item counts per status
    Stats,
    /// Apply database migrations
    Migrate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Command::Serve { workers } => cmd_serve(config, workers).await,
        Command::Enqueue {
            work_type,
            payload,
            delay_secs,
        } => {
            let store = open_store(&config).await?;
            cmd_enqueue(&store, work_type, payload, delay_secs).await
        }
        Command::List {
            status,
            work_type,
            limit,
        } => {
            let store = open_store(&config).await?;
            cmd_list(&store, status, work_type, limit).await
        }
        Command::Show { id } => cmd_show(&open_store(&config).await?, id).await,
        Command::Complete { id } => {
            open_store(&config).await?.complete(id).await?;
            println!("Completed: {id}");
            Ok(())
        }
        Command::Stats => cmd_stats(&open_store(&config).await?).await,
        Command::Migrate => {
            open_store(&config).await?;
            println!("Migrations applied.");
            Ok(())
        }
    }
}

/// Connect, apply pending migrations, and return the Postgres queue store.
async fn open_store(config: &Config) -> anyhow::Result<PgQueueStore> {
    let db = Db::connect(config.database_url.expose_secret()).await?;
    db.migrate().await?;
    Ok(db.queue_store(config.dispatch.max_retries))
}

async fn cmd_serve(config: Config, workers: usize) -> anyhow::Result<()> {
    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "outbound".to_string(),
        default_filter: config.log_level.clone(),
    })?;

    let router = build_router(&config);
    let mut registry = HandlerRegistry::new();
    register_builtins(&mut registry, LogMailer, router)?;
    let registry = Arc::new(registry);
    tracing::info!(work_types = ?registry.work_types(), "handlers registered");

    tracing::info!(database = %redact_url(&config.database_url), "connecting to database");
    let db = Db::connect(config.database_url.expose_secret()).await?;
    db.migrate().await?;
    let store = Arc::new(db.queue_store(config.dispatch.max_retries));
    let result = serve(store, registry, config, workers).await;
    db.close().await;
    result
}

/// Both transports are needed for publish handlers.
fn build_router(config: &Config) -> Option<TransportRouter> {
    let (Some(amqp_url), Some(redis_url)) = (&config.amqp_url, &config.redis_url) else {
        if config.amqp_url.is_some() || config.redis_url.is_some() {
            tracing::warn!("AMQP_URL and REDIS_URL must both be set to enable publishing");
        }
        return None;
    };

    tracing::info!(
        primary = %redact_url(amqp_url),
        secondary = %redact_url(redis_url),
        "transport router configured"
    );
    Some(TransportRouter::new(
        Arc::new(AmqpTransport::new(amqp_url.clone(), &config.amqp_queue)),
        Arc::new(RedisStreamTransport::new(redis_url.clone(), &config.redis_stream)),
        config.dispatch.recovery_cooldown,
    ))
}

async fn serve<S: QueueStore>(
    store: Arc<S>,
    registry: Arc<HandlerRegistry>,
    config: Config,
    workers: usize,
) -> anyhow::Result<()> {
    let dispatcher = Dispatcher::new(store, registry, config.dispatch);
    let mut instances = dispatcher.spawn_instances(workers.max(1));

    let token = dispatcher.shutdown_token();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("shutdown requested");
        token.cancel();
    });

    while let Some(joined) = instances.join_next().await {
        joined??;
    }
    Ok(())
}

async fn cmd_enqueue(
    store: &PgQueueStore,
    work_type: String,
    payload: String,
    delay_secs: Option<i64>,
) -> anyhow::Result<()> {
    let mut new = NewWorkItem::new(work_type, payload.into_bytes());
    if let Some(secs) = delay_secs {
        new = new.not_before(chrono::Utc::now() + chrono::Duration::seconds(secs));
    }
    let id = store.enqueue(new).await?;
    println!("Enqueued: {id}");
    Ok(())
}

async fn cmd_list(
    store: &PgQueueStore,
    status: Option<String>,
    work_type: Option<String>,
    limit: i64,
) -> anyhow::Result<()> {
    let status: Option<Status> = match status {
        Some(s) => Some(s.parse()?),
        None => None,
    };
    let items = store
        .list(&WorkFilter {
            status,
            work_type,
            limit: Some(limit),
        })
        .await?;

    if items.is_empty() {
        println!("No work items found.");
        return Ok(());
    }

    let max_retries = store.max_retries();
    println!(
        "{:<8}  {:<20}  {:<13}  {:<8}  {:<16}  CREATED",
        "ID", "TYPE", "STATUS", "ATTEMPTS", "NEXT ATTEMPT"
    );
    println!("{}", "-".repeat(90));

    for item in &items {
        let next = item
            .next_attempt_at
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<8}  {:<20}  {:<13}  {:<8}  {:<16}  {}",
            item.id,
            item.work_type,
            item.status(max_retries),
            item.attempt_count,
            next,
            item.created_at.format("%Y-%m-%d %H:%M")
        );
    }

    println!("\n{} item(s)", items.len());
    Ok(())
}

async fn cmd_show(store: &PgQueueStore, id: WorkId) -> anyhow::Result<()> {
    let item = store.get(id).await?;

    println!("ID:           {}", item.id);
    println!("Type:         {}", item.work_type);
    println!("Status:       {}", item.status(store.max_retries()));
    println!("Attempts:     {}", item.attempt_count);
    println!("Created:      {}", item.created_at);
    if let Some(at) = item.last_attempt_at {
        println!("Last Attempt: {at}");
    }
    if let Some(at) = item.next_attempt_at {
        println!("Next Attempt: {at}");
    }
    if let Some(at) = item.completed_at {
        println!("Completed:    {at}");
    }
    if let Some(at) = item.dead_lettered_at {
        println!("Dead-lettered: {at}");
    }
    if let Some(ref err) = item.last_error {
        println!("Last Error:   {err}");
    }
    println!("---");
    match serde_json::from_slice::<serde_json::Value>(&item.payload) {
        Ok(json) => println!("{}", serde_json::to_string_pretty(&json)?),
        Err(_) => println!("{}", item.payload_text()),
    }
    Ok(())
}

async fn cmd_stats(store: &PgQueueStore) -> anyhow::Result<()> {
    let counts = store.counts().await?;
    if counts.is_empty() {
        println!("Queue is empty.");
        return Ok(());
    }
    for (status, n) in counts {
        println!("{:<13}  {n}", status.to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serve_always_uses_the_database_queue() {
        let cli = Cli::try_parse_from(["outbound", "serve", "--workers", "4"]).unwrap();
        assert!(matches!(cli.command, Command::Serve { workers: 4 }));
        assert!(Cli::try_parse_from(["outbound", "serve", "--memory"]).is_err());
    }
}
