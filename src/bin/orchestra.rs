//! orchestra CLI — API server, worker pool, and operator commands.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use rand::Rng;
use secrecy::ExposeSecret;
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

use orchestra_rs::admission::AdmissionCoordinator;
use orchestra_rs::config::Config;
use orchestra_rs::db::Db;
use orchestra_rs::executor::{
    Executor, ExecutorConfig, LogFailureHandler, TaskHandler, WorkerPool,
};
use orchestra_rs::fanout::FanOut;
use orchestra_rs::http::{ApiContext, router};
use orchestra_rs::model::{NewTask, Priority, QueueName, TaskId, TaskType};
use orchestra_rs::notifier::run_update_relay;
use orchestra_rs::scheduler::Scheduler;
use orchestra_rs::telemetry::{TelemetryConfig, init_telemetry};

#[derive(Parser)]
#[command(name = "orchestra", about = "Task orchestration engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the API server, update relay, and worker pool
    Serve {
        /// Address to bind the HTTP/WebSocket API on
        #[arg(long, default_value = "0.0.0.0:8000")]
        bind: SocketAddr,
        /// Workers draining the I/O-bound queues
        #[arg(long, default_value_t = 2)]
        io_workers: usize,
        /// Workers draining the CPU-bound queue
        #[arg(long, default_value_t = 1)]
        cpu_workers: usize,
    },
    /// Task operations
    Task {
        #[command(subcommand)]
        action: TaskAction,
    },
}

#[derive(Subcommand)]
enum TaskAction {
    /// Submit a task
    Submit {
        /// Opaque payload handed to the task body
        payload: Option<String>,
        /// io_bound or cpu_bound
        #[arg(long, default_value = "io_bound")]
        task_type: String,
        /// high, medium, or low (I/O-bound only)
        #[arg(long, default_value = "medium")]
        priority: String,
        /// Seconds before the task becomes eligible
        #[arg(long, default_value_t = 0)]
        delay: u64,
        /// Dedup key; repeated submissions return the original task
        #[arg(long)]
        idempotency_key: Option<String>,
    },
    /// List tasks, most recent first
    List {
        #[arg(long, default_value_t = 0)]
        skip: i64,
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Show a task
    Show {
        /// Task id
        id: i64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            bind,
            io_workers,
            cpu_workers,
        } => cmd_serve(bind, io_workers, cpu_workers).await,
        Command::Task { action } => {
            let config = Config::from_env()?;
            let db = Arc::new(Db::connect(config.database_url.expose_secret()).await?);
            db.migrate().await?;
            Scheduler::new(Arc::clone(&db)).ensure_queues().await?;

            match action {
                TaskAction::Submit {
                    payload,
                    task_type,
                    priority,
                    delay,
                    idempotency_key,
                } => cmd_task_submit(db, payload, task_type, priority, delay, idempotency_key).await,
                TaskAction::List { skip, limit } => cmd_task_list(&db, skip, limit).await,
                TaskAction::Show { id } => cmd_task_show(&db, id).await,
            }
        }
    }
}

async fn cmd_serve(bind: SocketAddr, io_workers: usize, cpu_workers: usize) -> anyhow::Result<()> {
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "orchestra".to_string(),
    })?;

    let db = Arc::new(Db::connect(config.database_url.expose_secret()).await?);
    db.migrate().await?;
    Scheduler::new(Arc::clone(&db)).ensure_queues().await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (event_tx, _) = broadcast::channel(256);

    // Upstream relay: NOTIFY channel -> in-process broadcast.
    {
        let db = Arc::clone(&db);
        let tx = event_tx.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = run_update_relay(db, tx, shutdown).await {
                warn!("update relay exited with error: {e}");
            }
        });
    }

    // Fan-out: broadcast -> connected observers.
    let fanout = Arc::new(FanOut::new());
    {
        let fanout = Arc::clone(&fanout);
        let rx = event_tx.subscribe();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { fanout.run(rx, shutdown).await });
    }

    // Worker pool: strict-priority I/O family plus the CPU queue.
    let failure_handler = Arc::new(LogFailureHandler);
    let mut pool = WorkerPool::new();
    for i in 0..io_workers {
        pool.spawn(
            Executor::new(
                format!("io-{i}"),
                QueueName::IO.to_vec(),
                Arc::clone(&db),
                Arc::new(SimulatedIoHandler),
                failure_handler.clone(),
                ExecutorConfig::default(),
            ),
            shutdown_rx.clone(),
        );
    }
    for i in 0..cpu_workers {
        pool.spawn(
            Executor::new(
                format!("cpu-{i}"),
                vec![QueueName::CpuBound],
                Arc::clone(&db),
                Arc::new(SimulatedCpuHandler),
                failure_handler.clone(),
                ExecutorConfig::default(),
            ),
            shutdown_rx.clone(),
        );
    }

    // HTTP/WebSocket surface.
    let ctx = Arc::new(ApiContext {
        admission: AdmissionCoordinator::new(Arc::clone(&db)),
        db: Arc::clone(&db),
        fanout,
    });
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(%bind, io_workers, cpu_workers, "orchestra serving");

    let mut http_shutdown = shutdown_rx.clone();
    let server = axum::serve(listener, router(ctx)).with_graceful_shutdown(async move {
        let _ = http_shutdown.changed().await;
    });

    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    server.await?;
    pool.join().await;
    Ok(())
}

// ---------------------------------------------------------------------------
// Demo task bodies
// ---------------------------------------------------------------------------

/// I/O-bound demo body: short wait, ~30% simulated transient failures.
struct SimulatedIoHandler;

#[async_trait::async_trait]
impl TaskHandler for SimulatedIoHandler {
    async fn execute(&self, task_id: TaskId, _payload: &str) -> anyhow::Result<()> {
        if rand::thread_rng().gen_bool(0.3) {
            anyhow::bail!("simulated network failure");
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
        info!(%task_id, "io-bound body finished");
        Ok(())
    }
}

/// CPU-bound demo body: longer wait, never fails.
struct SimulatedCpuHandler;

#[async_trait::async_trait]
impl TaskHandler for SimulatedCpuHandler {
    async fn execute(&self, task_id: TaskId, _payload: &str) -> anyhow::Result<()> {
        tokio::time::sleep(Duration::from_secs(15)).await;
        info!(%task_id, "cpu-bound body finished");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Operator commands
// ---------------------------------------------------------------------------

async fn cmd_task_submit(
    db: Arc<Db>,
    payload: Option<String>,
    task_type: String,
    priority: String,
    delay: u64,
    idempotency_key: Option<String>,
) -> anyhow::Result<()> {
    let task_type: TaskType = task_type.parse()?;
    let priority: Priority = priority.parse()?;

    let mut new = NewTask::new(task_type)
        .priority(priority)
        .delay(Duration::from_secs(delay));
    if let Some(payload) = payload {
        new = new.payload(payload);
    }
    if let Some(key) = idempotency_key {
        new = new.idempotency_key(key);
    }

    let admission = AdmissionCoordinator::new(db);
    let task = admission.submit(new).await?;

    println!(
        "Accepted: task {} (status: {}, queue: {})",
        task.id,
        task.status,
        QueueName::for_task(task.task_type, task.priority)
    );
    Ok(())
}

async fn cmd_task_list(db: &Db, skip: i64, limit: i64) -> anyhow::Result<()> {
    let tasks = db.list_tasks(skip, limit).await?;

    if tasks.is_empty() {
        println!("No tasks found.");
        return Ok(());
    }

    // Header
    println!(
        "{:<6}  {:<10}  {:<10}  {:<8}  {:<7}  CREATED",
        "ID", "TYPE", "STATUS", "PRIORITY", "RETRIES"
    );
    println!("{}", "-".repeat(70));

    for task in &tasks {
        println!(
            "{:<6}  {:<10}  {:<10}  {:<8}  {:<7}  {}",
            task.id.0,
            task.task_type.as_str(),
            task.status.as_str(),
            task.priority.as_str(),
            task.retry_count,
            task.created_at.format("%Y-%m-%d %H:%M")
        );
    }

    println!("\n{} task(s)", tasks.len());
    Ok(())
}

async fn cmd_task_show(db: &Db, id: i64) -> anyhow::Result<()> {
    let task = db.get_task(TaskId(id)).await?;

    println!("ID:          {}", task.id);
    println!("Type:        {}", task.task_type);
    println!("Priority:    {}", task.priority);
    println!("Status:      {}", task.status);
    println!("Retries:     {}", task.retry_count);
    println!(
        "Idempotency: {}",
        task.idempotency_key.as_deref().unwrap_or("-")
    );
    println!("Payload:     {}", task.payload.as_deref().unwrap_or("-"));
    println!("Created:     {}", task.created_at);
    if let Some(finished) = task.finished_at {
        println!("Finished:    {finished}");
    }
    if let Some(ref err) = task.error_message {
        println!("Error:       {err}");
    }
    Ok(())
}
