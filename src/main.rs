use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, bail};
use secrecy::SecretString;
use uuid::Uuid;

use taskpilot::api::operator_routes;
use taskpilot::collaborator::HttpCollaborator;
use taskpilot::config::RunnerConfig;
use taskpilot::confirm::{ConfirmationPoller, ImapMailbox, Mailbox, UnconfiguredMailbox};
use taskpilot::identity::{self, IdentityPool, MailboxConfig};
use taskpilot::runner::{Executor, Workflow};
use taskpilot::session::{SessionFactory, SessionPool};
use taskpilot::store::{Database, LibSqlBackend};
use taskpilot::tasks::{TaskStatus, TaskStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first().map(String::as_str) else {
        print_usage();
        return Ok(());
    };

    let config = RunnerConfig::from_env()?;

    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(Path::new(&config.db_path))
            .await
            .with_context(|| format!("Failed to open database at {}", config.db_path))?,
    );

    match command {
        "serve" => serve(db, config).await,
        "run" => run_batch(db, config, &args[1..]).await,
        "add-task" => add_task(db, &args[1..]).await,
        "add-tasks" => add_tasks(db, &args[1..]).await,
        "list" => list_tasks(db).await,
        "stats" => stats(db, config).await,
        "cancel-all" => cancel_all(db).await,
        "reset" => reset_tasks(db, &args[1..]).await,
        "add-identity" => add_identity(db, config, &args[1..]).await,
        "gen-identity" => gen_identity(db, config).await,
        "set-mailbox" => set_mailbox(db, &args[1..]).await,
        other => {
            print_usage();
            bail!("unknown command: {other}");
        }
    }
}

fn print_usage() {
    eprintln!("taskpilot v{}", env!("CARGO_PKG_VERSION"));
    eprintln!();
    eprintln!("Usage: taskpilot <command> [args]");
    eprintln!();
    eprintln!("  serve                          start the operator HTTP API");
    eprintln!("  run [--parallel [N]] [--include-failed]");
    eprintln!("                                 process outstanding tasks");
    eprintln!("  add-task <json>                queue one task payload");
    eprintln!("  add-tasks <file>               queue a JSON array of payloads");
    eprintln!("  list                           list tasks");
    eprintln!("  stats                          pool and task statistics");
    eprintln!("  cancel-all                     cancel all outstanding tasks");
    eprintln!("  reset <task-id>...             re-queue tasks orphaned in processing");
    eprintln!("  add-identity <handle> <secret> [config-ref]");
    eprintln!("  gen-identity                   generate and store a fresh identity");
    eprintln!("  set-mailbox <host> <port> <user> <secret> <domain>");
}

/// Wire the full executor stack: identity pool, session pool, confirmation
/// poller and the HTTP collaborator.
async fn build_executor(db: Arc<dyn Database>, config: RunnerConfig) -> anyhow::Result<Arc<Executor>> {
    let agent_url = std::env::var("TASKPILOT_AGENT_URL")
        .unwrap_or_else(|_| "http://127.0.0.1:8700".to_string());
    let collaborator = Arc::new(HttpCollaborator::new(agent_url));

    let identities = Arc::new(IdentityPool::load(Arc::clone(&db), config.daily_limit).await?);

    let sessions = Arc::new(SessionPool::new(
        Arc::clone(&collaborator) as Arc<dyn SessionFactory>,
        config.session_pool_size,
        config.session_poll_interval,
    ));

    let mailbox: Box<dyn Mailbox> = match db.get_mailbox_config().await? {
        Some(mailbox_config) => Box::new(ImapMailbox::new(mailbox_config)),
        None => {
            tracing::warn!("No mailbox configured; confirmation waits will time out");
            Box::new(UnconfiguredMailbox)
        }
    };
    let poller = Arc::new(ConfirmationPoller::new(mailbox, config.confirm_scan_depth));

    let tasks = Arc::new(TaskStore::new(db));

    Ok(Arc::new(Executor::new(
        identities,
        sessions,
        poller,
        tasks,
        collaborator as Arc<dyn Workflow>,
        config,
    )))
}

async fn serve(db: Arc<dyn Database>, config: RunnerConfig) -> anyhow::Result<()> {
    let port: u16 = std::env::var("TASKPILOT_PORT")
        .unwrap_or_else(|_| "8080".to_string())
        .parse()
        .unwrap_or(8080);

    let executor = build_executor(db, config).await?;

    eprintln!("🚚 taskpilot v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   API: http://0.0.0.0:{port}/api/tasks");
    eprintln!("   Stats: http://0.0.0.0:{port}/api/stats");

    let app = operator_routes(Arc::clone(&executor));
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("Failed to bind port {port}"))?;
    axum::serve(listener, app).await?;

    executor.session_pool().close_all().await;
    Ok(())
}

async fn run_batch(
    db: Arc<dyn Database>,
    config: RunnerConfig,
    args: &[String],
) -> anyhow::Result<()> {
    let mut parallel = None;
    let mut include_failed = false;
    let mut iter = args.iter().peekable();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            // Worker count is optional; bare `--parallel` uses the
            // configured max_workers.
            "--parallel" => {
                let explicit = iter.peek().and_then(|v| v.parse::<usize>().ok());
                if explicit.is_some() {
                    iter.next();
                }
                parallel = Some(explicit.unwrap_or(config.max_workers));
            }
            "--include-failed" => include_failed = true,
            other => bail!("unknown flag: {other}"),
        }
    }

    let executor = build_executor(db, config).await?;
    let report = executor.run_outstanding(include_failed, parallel).await?;
    executor.session_pool().close_all().await;

    println!(
        "done: {} succeeded, {} failed",
        report.succeeded, report.failed
    );
    Ok(())
}

async fn add_task(db: Arc<dyn Database>, args: &[String]) -> anyhow::Result<()> {
    let raw = args.first().context("add-task needs a JSON payload")?;
    let payload: serde_json::Value = serde_json::from_str(raw).context("payload is not JSON")?;
    let task = TaskStore::new(db).add(payload).await?;
    println!("added {}", task.id);
    Ok(())
}

async fn add_tasks(db: Arc<dyn Database>, args: &[String]) -> anyhow::Result<()> {
    let path = args.first().context("add-tasks needs a file path")?;
    let raw = std::fs::read_to_string(path).with_context(|| format!("cannot read {path}"))?;
    let payloads: Vec<serde_json::Value> =
        serde_json::from_str(&raw).context("file is not a JSON array of payloads")?;

    let store = TaskStore::new(db);
    for payload in payloads {
        let task = store.add(payload).await?;
        println!("added {}", task.id);
    }
    Ok(())
}

async fn list_tasks(db: Arc<dyn Database>) -> anyhow::Result<()> {
    for task in TaskStore::new(db).list(None).await? {
        let note = task
            .error
            .as_deref()
            .map(|e| format!(" - {e}"))
            .unwrap_or_default();
        println!("[{}] {}{}", task.status, task.id, note);
    }
    Ok(())
}

async fn stats(db: Arc<dyn Database>, config: RunnerConfig) -> anyhow::Result<()> {
    let identities = IdentityPool::load(Arc::clone(&db), config.daily_limit).await?;
    let tasks = TaskStore::new(db);
    let summary = serde_json::json!({
        "identities": identities.stats().await,
        "tasks": tasks.counts().await?,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn cancel_all(db: Arc<dyn Database>) -> anyhow::Result<()> {
    let cancelled = TaskStore::new(db).cancel_all().await?;
    println!("cancelled {cancelled} tasks");
    Ok(())
}

async fn reset_tasks(db: Arc<dyn Database>, args: &[String]) -> anyhow::Result<()> {
    if args.is_empty() {
        bail!("reset needs at least one task id");
    }
    let store = TaskStore::new(db);
    for raw in args {
        let id: Uuid = raw.parse().with_context(|| format!("bad task id: {raw}"))?;
        let mut task = store
            .get(id)
            .await?
            .with_context(|| format!("no such task: {id}"))?;
        if task.status == TaskStatus::Failed {
            store.requeue(&mut task).await?;
        } else {
            store.reset_orphaned(&mut task).await?;
        }
        println!("reset {id}");
    }
    Ok(())
}

async fn add_identity(
    db: Arc<dyn Database>,
    config: RunnerConfig,
    args: &[String],
) -> anyhow::Result<()> {
    let [handle, secret, rest @ ..] = args else {
        bail!("add-identity needs <handle> <secret> [config-ref]");
    };
    let config_ref = rest.first().map(String::as_str).unwrap_or("");

    let pool = IdentityPool::load(db, config.daily_limit).await?;
    pool.add(handle, secret, config_ref).await?;
    println!("added identity {handle}");
    Ok(())
}

async fn gen_identity(db: Arc<dyn Database>, config: RunnerConfig) -> anyhow::Result<()> {
    let mailbox = db
        .get_mailbox_config()
        .await?
        .context("set-mailbox first; identity handles live under its domain")?;

    let handle = identity::generate_handle(&mailbox.domain);
    let secret = identity::generate_secret(12);

    let pool = IdentityPool::load(db, config.daily_limit).await?;
    pool.add(&handle, &secret, "").await?;
    println!("added identity {handle}");
    Ok(())
}

async fn set_mailbox(db: Arc<dyn Database>, args: &[String]) -> anyhow::Result<()> {
    let [host, port, username, secret, domain] = args else {
        bail!("set-mailbox needs <host> <port> <user> <secret> <domain>");
    };

    db.set_mailbox_config(&MailboxConfig {
        host: host.clone(),
        port: port.parse().context("port must be a number")?,
        username: username.clone(),
        secret: SecretString::from(secret.clone()),
        domain: domain.clone(),
    })
    .await?;
    println!("mailbox configured: {username} on {host}");
    Ok(())
}
