mod config;
mod engine;

use chrono::Utc;
use clap::{Parser, Subcommand};
use config::ConvoGuardConfig;
use convoguard_channels::{CircuitBreaker, OutboundDispatcher, WhatsAppChannel};
use convoguard_compliance::{
    sweep_audit, AuditLog, DeletionRegistry, RetentionCategory, SqliteAuditStore,
};
use convoguard_gateway::{AuthConfig, GatewayServer};
use convoguard_orchestrator::{ConvoContext, InboundDispatcher, SessionOrchestrator};
use convoguard_security::{resolve_key, EncryptionKey, Keyring, RateLimiter};
use convoguard_session::{migrate, EncryptedSessionStore, FileKv, StateCache};
use engine::ConsentGate;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "convoguard", about = "ConvoGuard: conversation state and resilience layer")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "convoguard.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP ingress and background jobs
    Serve {
        /// Host to bind to (overrides config)
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Re-encrypt every stored session under the current key
    RotateKey,
    /// Run one retention pass and exit
    Sweep,
    /// Print a fresh base64 session key
    GenKey,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let cli = Cli::parse();

    if let Commands::GenKey = cli.command {
        println!("{}", EncryptionKey::generate().to_base64());
        return Ok(());
    }

    let config_str = tokio::fs::read_to_string(&cli.config).await.map_err(|e| {
        anyhow::anyhow!("Failed to read config file '{}': {e}", cli.config.display())
    })?;
    let config: ConvoGuardConfig = toml::from_str(&config_str)?;
    config.validate()?;

    match cli.command {
        Commands::Serve { host, port } => serve(config, host, port).await?,
        Commands::RotateKey => rotate_key(&config).await?,
        Commands::Sweep => sweep(&config).await?,
        Commands::GenKey => {}
    }

    Ok(())
}

/// Current key plus every retired key listed in the config.
///
/// `strict` requires the current key to be present in the environment even
/// outside production; offline tools must never seal with an ephemeral key.
fn load_keyring(config: &ConvoGuardConfig, strict: bool) -> anyhow::Result<Keyring> {
    let encryption = &config.encryption;
    let configured = std::env::var(&encryption.key_env).ok();
    let key = match configured.as_deref() {
        None if strict => anyhow::bail!("{} is not set", encryption.key_env),
        raw => resolve_key(config.environment, raw)?,
    };

    let mut keyring = Keyring::new(encryption.key_version, key);
    for retired in &encryption.retired {
        let raw = std::env::var(&retired.key_env)
            .map_err(|_| anyhow::anyhow!("{} is not set", retired.key_env))?;
        keyring = keyring.with_retired(retired.version, EncryptionKey::from_base64(&raw)?)?;
    }
    Ok(keyring)
}

async fn open_store(config: &ConvoGuardConfig, keyring: Keyring) -> anyhow::Result<EncryptedSessionStore> {
    let backend = Arc::new(FileKv::new(config.sessions_dir()).await?);
    Ok(EncryptedSessionStore::new(backend, Arc::new(keyring)))
}

async fn serve(config: ConvoGuardConfig, host: Option<String>, port: Option<u16>) -> anyhow::Result<()> {
    let host = host.unwrap_or_else(|| config.server.host.clone());
    let port = port.unwrap_or(config.server.port);
    info!(environment = ?config.environment, "Starting ConvoGuard on {host}:{port}");

    let keyring = load_keyring(&config, false)?;
    let store = Arc::new(open_store(&config, keyring).await?);

    let audit_store = Arc::new(SqliteAuditStore::open(config.audit_db_path())?);
    let audit = Arc::new(AuditLog::new(audit_store.clone(), config.audit.writer.clone()));

    let channel = Arc::new(WhatsAppChannel::from_env(&config.outbound.whatsapp)?);
    let breaker = Arc::new(CircuitBreaker::new("whatsapp", &config.breaker));
    let outbound = Arc::new(OutboundDispatcher::new(channel, breaker, &config.outbound.delivery));

    let ctx = ConvoContext {
        limiter: Arc::new(RateLimiter::from_config(&config.rate_limit)),
        cache: Arc::new(StateCache::new(config.cache.capacity)?),
        store,
        audit: audit.clone(),
        audit_store: audit_store.clone(),
        outbound,
        deletions: Arc::new(DeletionRegistry::new(
            audit_store,
            config.retention.deletion_grace(),
        )),
        retention: config.retention.clone(),
    };
    let resumed = ctx.deletions.resume_interrupted().await?;
    if resumed > 0 {
        info!(resumed, "Requeued erasures left in progress by the previous run");
    }
    let orchestrator = Arc::new(SessionOrchestrator::new(ctx, Arc::new(ConsentGate), &config.store));

    let (inbound, dispatch_loop) = InboundDispatcher::spawn(
        orchestrator.clone(),
        config.server.inbound_queue,
        config.server.max_in_flight,
    );

    let schedule = &config.schedule;
    let jobs = [
        every(schedule.retention_interval_secs, {
            let orchestrator = orchestrator.clone();
            move || {
                let orchestrator = orchestrator.clone();
                async move {
                    if let Err(e) = orchestrator.run_retention_sweep(Utc::now()).await {
                        warn!(error = %e, "Retention sweep failed");
                    }
                }
            }
        }),
        every(schedule.deletion_interval_secs, {
            let orchestrator = orchestrator.clone();
            move || {
                let orchestrator = orchestrator.clone();
                async move {
                    orchestrator.process_due_deletions(Utc::now()).await;
                }
            }
        }),
        every(schedule.limiter_cleanup_interval_secs, {
            let limiter = orchestrator.context().limiter.clone();
            let max_idle = Duration::from_secs(config.rate_limit.idle_secs);
            move || {
                let limiter = limiter.clone();
                async move {
                    let removed = limiter.cleanup(max_idle).await;
                    if removed > 0 {
                        debug!(removed, "Forgot idle senders");
                    }
                }
            }
        }),
        every(schedule.flush_interval_secs, {
            let orchestrator = orchestrator.clone();
            move || {
                let orchestrator = orchestrator.clone();
                async move {
                    let report = orchestrator.flush_outbound().await;
                    if report.remaining > 0 {
                        warn!(remaining = report.remaining, "Outbound replies still parked");
                    }
                }
            }
        }),
    ];

    let auth_config = AuthConfig::new(config.server.api_keys.clone());
    if auth_config.is_enabled() {
        info!(keys = config.server.api_keys.len(), "API key auth enabled");
    }
    let app = GatewayServer::build(orchestrator, inbound, auth_config);

    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("ConvoGuard listening on {addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    for job in jobs {
        job.abort();
    }
    // The router held every dispatcher handle; the loop now finishes what was accepted.
    let drain = Duration::from_secs(config.server.drain_timeout_secs);
    match tokio::time::timeout(drain, dispatch_loop).await {
        Ok(Ok(())) => info!("Inbound queue drained"),
        Ok(Err(e)) => warn!(error = %e, "Inbound dispatcher ended abnormally"),
        Err(_) => warn!(timeout_secs = drain.as_secs(), "Inbound queue not drained before timeout"),
    }
    audit.settled().await;
    info!(written = audit.written(), abandoned = audit.abandoned(), "ConvoGuard stopped");
    Ok(())
}

/// Run `job` every `secs` seconds on a background task.
fn every<F, Fut>(secs: u64, job: F) -> tokio::task::JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(secs.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            job().await;
        }
    })
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Could not listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

async fn rotate_key(config: &ConvoGuardConfig) -> anyhow::Result<()> {
    if config.encryption.retired.is_empty() {
        warn!("No retired keys configured; only records already under the current key can be read");
    }
    let keyring = load_keyring(config, true)?;
    let backend = FileKv::new(config.sessions_dir()).await?;
    let report = migrate::reencrypt_all(&backend, &keyring).await?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.is_complete() {
        anyhow::bail!("{} session(s) could not be migrated", report.failed.len());
    }
    Ok(())
}

async fn sweep(config: &ConvoGuardConfig) -> anyhow::Result<()> {
    let now = Utc::now();
    let audit_store = SqliteAuditStore::open(config.audit_db_path())?;
    let mut report = sweep_audit(&audit_store, &config.retention, now).await?;

    let store = open_store(config, load_keyring(config, false)?).await?;
    let cutoff = config.retention.cutoff(RetentionCategory::SessionData, now);
    report.sessions = store.purge_inactive(cutoff).await?.len();

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
