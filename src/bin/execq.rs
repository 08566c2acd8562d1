//! execq CLI: run the executor proxy, run a local worker, inspect queues.

use anyhow::Context;
use clap::{Parser, Subcommand};
use execq::config::{Config, QueueSettings, Settings};
use execq::db::Db;
use execq::engine::{Resetter, RetryPolicy, Worker, WorkerConfig, default_identity};
use execq::handler::CommandHandler;
use execq::model::{ClaimFilter, NewRecord, RecordId, State};
use execq::proxy::{ExecutorProxy, QueueHandle, QueueRegistry};
use execq::store::{ExecutorStore, Store};
use execq::telemetry::{TelemetryConfig, TelemetryGuard, init_telemetry};
use secrecy::{ExposeSecret, SecretString};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser)]
#[command(name = "execq", about = "Durable work-queue execution engine")]
struct Cli {
    /// Engine settings and queue definitions
    #[arg(long, global = true, default_value = "execq.toml")]
    settings: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the executor proxy and a stalled-record resetter per queue
    Serve,
    /// Run a local worker that executes a command for each record
    Work {
        /// Queue to consume
        #[arg(long)]
        queue: String,
        /// Only claim records with this tag
        #[arg(long)]
        tag: Option<String>,
        /// Override the configured concurrency
        #[arg(long)]
        max_concurrency: Option<usize>,
        /// Command and arguments to run per record
        #[arg(required = true, trailing_var_arg = true)]
        command: Vec<String>,
    },
    #[command(flatten)]
    Records(RecordCommand),
}

#[derive(Subcommand)]
enum RecordCommand {
    /// Enqueue a record
    Enqueue {
        #[arg(long)]
        queue: String,
        /// JSON payload
        #[arg(long, default_value = "{}")]
        payload: String,
        #[arg(long)]
        tag: Option<String>,
        /// Delay before the record becomes claimable
        #[arg(long)]
        delay_secs: Option<i64>,
    },
    /// List records
    List {
        #[arg(long)]
        queue: String,
        /// Filter by state
        #[arg(long)]
        state: Option<String>,
        /// Maximum records to show
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Show a record
    Show {
        #[arg(long)]
        queue: String,
        id: RecordId,
    },
    /// Cancel a record
    Cancel {
        #[arg(long)]
        queue: String,
        id: RecordId,
    },
    /// Requeue stalled records once and exit
    ResetStalled {
        #[arg(long)]
        queue: String,
    },
    /// List executors that have talked to the proxy
    ListExecutors,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = Config::from_env()?;
    let settings = Settings::load(&cli.settings)?;

    match cli.command {
        Command::Serve => cmd_serve(config, settings).await,
        Command::Work {
            queue,
            tag,
            max_concurrency,
            command,
        } => cmd_work(config, settings, queue, tag, max_concurrency, command).await,
        Command::Records(command) => {
            let db = Db::connect(config.database_url.expose_secret()).await?;
            db.migrate().await?;
            cmd_records(&db, &settings, command).await
        }
    }
}

async fn cmd_records(db: &Db, settings: &Settings, command: RecordCommand) -> anyhow::Result<()> {
    match command {
        RecordCommand::Enqueue {
            queue,
            payload,
            tag,
            delay_secs,
        } => cmd_enqueue(db, queue, payload, tag, delay_secs).await,
        RecordCommand::List {
            queue,
            state,
            limit,
        } => cmd_list(db, queue, state, limit).await,
        RecordCommand::Show { queue, id } => cmd_show(db, queue, id).await,
        RecordCommand::Cancel { queue, id } => {
            if db.store(&queue).cancel(id).await? {
                println!("Canceled: {id}");
            } else {
                println!("Record {id} is already finished");
            }
            Ok(())
        }
        RecordCommand::ResetStalled { queue } => {
            let store: Arc<dyn Store> = Arc::new(db.store(&queue));
            let reset = Resetter::from_settings(store, &settings.worker)
                .run_once()
                .await?;
            println!("Requeued {} record(s)", reset.len());
            Ok(())
        }
        RecordCommand::ListExecutors => cmd_list_executors(db).await,
    }
}

fn telemetry(config: &Config, role: &str, instance_id: &str) -> anyhow::Result<TelemetryGuard> {
    Ok(init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "execq".to_string(),
        instance_id: instance_id.to_string(),
        role: role.to_string(),
        log_level: config.log_level.clone(),
    })?)
}

/// Cancel `token` on ctrl-c.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown requested");
        token.cancel();
    });
}

fn access_token(config: &Config, queue: &QueueSettings) -> anyhow::Result<SecretString> {
    if let Some(var) = &queue.access_token_env {
        let token = std::env::var(var)
            .ok()
            .filter(|v| !v.is_empty())
            .with_context(|| format!("queue {}: {var} is not set", queue.name))?;
        return Ok(SecretString::from(token));
    }
    config
        .executor_access_token
        .clone()
        .with_context(|| format!("queue {}: no access token configured", queue.name))
}

async fn cmd_serve(config: Config, settings: Settings) -> anyhow::Result<()> {
    let _guard = telemetry(&config, "proxy", &default_identity())?;

    if settings.queues.is_empty() {
        anyhow::bail!("no queues defined in settings");
    }

    let db = Db::connect(config.database_url.expose_secret()).await?;
    db.migrate().await?;
    db.health_check().await?;

    let shutdown = CancellationToken::new();
    let mut registry = QueueRegistry::new();
    let mut resetters = Vec::new();

    for queue in &settings.queues {
        let store: Arc<dyn Store> = Arc::new(db.store(&queue.name));
        let filter = queue
            .tag
            .as_ref()
            .map(ClaimFilter::tagged)
            .unwrap_or_else(ClaimFilter::any);
        registry.register(
            QueueHandle::new(Arc::clone(&store), access_token(&config, queue)?).filter(filter),
        )?;

        let resetter = Resetter::from_settings(store, &settings.worker);
        let stop = shutdown.clone();
        let handle = resetter.clone();
        tokio::spawn(async move {
            stop.cancelled().await;
            handle.shutdown();
        });
        resetters.push(tokio::spawn(async move { resetter.run().await }));
    }

    let proxy = Arc::new(ExecutorProxy::new(
        Arc::new(registry),
        RetryPolicy::from_settings(&settings.worker),
        Arc::new(db.executors()),
    ));

    cancel_on_ctrl_c(shutdown.clone());

    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("bind {}", config.listen_addr))?;
    execq::proxy::http::serve(listener, proxy, shutdown).await?;

    for resetter in resetters {
        resetter.await?;
    }
    Ok(())
}

async fn cmd_work(
    config: Config,
    settings: Settings,
    queue: String,
    tag: Option<String>,
    max_concurrency: Option<usize>,
    command: Vec<String>,
) -> anyhow::Result<()> {
    let mut worker_config = WorkerConfig::from_settings(&settings.worker);
    let _guard = telemetry(&config, "worker", &worker_config.identity)?;

    let db = Db::connect(config.database_url.expose_secret()).await?;
    db.migrate().await?;

    let (program, args) = command
        .split_first()
        .context("a command to run is required")?;
    let handler = Arc::new(CommandHandler::new(program).args(args.iter().cloned()));

    if let Some(n) = max_concurrency {
        worker_config.max_concurrency = n.max(1);
    }
    if let Some(tag) = tag {
        worker_config.filter = ClaimFilter::tagged(tag);
    }

    let store: Arc<dyn Store> = Arc::new(db.store(&queue));
    let worker = Worker::new(Arc::clone(&store), handler, worker_config);
    let resetter = Resetter::from_settings(store, &settings.worker);

    let shutdown = CancellationToken::new();
    cancel_on_ctrl_c(shutdown.clone());
    {
        let worker = worker.clone();
        let resetter = resetter.clone();
        tokio::spawn(async move {
            shutdown.cancelled().await;
            worker.shutdown();
            resetter.shutdown();
        });
    }

    let resetter_task = tokio::spawn(async move { resetter.run().await });
    worker.run().await;
    resetter_task.await?;
    Ok(())
}

async fn cmd_enqueue(
    db: &Db,
    queue: String,
    payload: String,
    tag: Option<String>,
    delay_secs: Option<i64>,
) -> anyhow::Result<()> {
    let payload: serde_json::Value =
        serde_json::from_str(&payload).context("payload must be valid JSON")?;

    let mut new = NewRecord::new(payload);
    if let Some(tag) = tag {
        new = new.tag(tag);
    }
    if let Some(secs) = delay_secs {
        let at = chrono::TimeDelta::try_seconds(secs)
            .and_then(|delay| chrono::Utc::now().checked_add_signed(delay))
            .with_context(|| format!("delay of {secs}s is out of range"))?;
        new = new.process_after(at);
    }

    let record = db.store(&queue).enqueue(new).await?;
    println!("Enqueued: {} (queue: {}, state: {})", record.id, record.queue, record.state);
    Ok(())
}

async fn cmd_list(
    db: &Db,
    queue: String,
    state: Option<String>,
    limit: usize,
) -> anyhow::Result<()> {
    let state: Option<State> = state.map(|s| s.parse()).transpose()?;
    let records = db.store(&queue).list(state, limit).await?;

    if records.is_empty() {
        println!("No records found.");
        return Ok(());
    }

    println!(
        "{:<10}  {:<10}  {:<12}  {:<5}  {:<6}  QUEUED",
        "ID", "STATE", "TAG", "FAILS", "RESETS"
    );
    println!("{}", "-".repeat(72));

    for record in &records {
        println!(
            "{:<10}  {:<10}  {:<12}  {:<5}  {:<6}  {}",
            record.id,
            record.state,
            record.tag.as_deref().unwrap_or("-"),
            record.num_failures,
            record.num_resets,
            record.queued_at.format("%Y-%m-%d %H:%M:%S")
        );
    }

    println!("\n{} record(s)", records.len());
    Ok(())
}

async fn cmd_list_executors(db: &Db) -> anyhow::Result<()> {
    let executors = db.executors().list_executors().await?;
    if executors.is_empty() {
        println!("No executors seen.");
        return Ok(());
    }

    println!("{:<32}  {:<16}  {:<19}  LAST SEEN", "NAME", "QUEUE", "FIRST SEEN");
    println!("{}", "-".repeat(90));
    for executor in &executors {
        println!(
            "{:<32}  {:<16}  {:<19}  {}",
            executor.name,
            executor.queue,
            executor.first_seen_at.format("%Y-%m-%d %H:%M:%S"),
            executor.last_seen_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    println!("\n{} executor(s)", executors.len());
    Ok(())
}

async fn cmd_show(db: &Db, queue: String, id: RecordId) -> anyhow::Result<()> {
    let record = db.store(&queue).get(id).await?;
    let opt = |v: Option<String>| v.unwrap_or_else(|| "-".to_string());

    println!("ID:         {}", record.id);
    println!("Queue:      {}", record.queue);
    println!("State:      {}", record.state);
    println!("Tag:        {}", opt(record.tag.clone()));
    println!("Payload:    {}", serde_json::to_string_pretty(&record.payload)?);
    println!("Failures:   {}", record.num_failures);
    println!("Resets:     {}", record.num_resets);
    println!("Queued:     {}", record.queued_at);
    println!("Process At: {}", opt(record.process_after.map(|t| t.to_string())));
    println!("Started:    {}", opt(record.started_at.map(|t| t.to_string())));
    println!("Finished:   {}", opt(record.finished_at.map(|t| t.to_string())));
    println!(
        "Heartbeat:  {}",
        opt(record.last_heartbeat_at.map(|t| t.to_string()))
    );
    println!("Owner:      {}", opt(record.worker_hostname.clone()));
    println!("Claim:      {}", opt(record.claim_token.clone()));
    if let Some(message) = &record.failure_message {
        println!("---");
        println!("Error:      {message}");
    }
    Ok(())
}
