//! campclerk binary: serve, migrate, doctor.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use secrecy::ExposeSecret;

use campclerk::challenge::ChallengeBroker;
use campclerk::checkpoint::CheckpointService;
use campclerk::classifier::SignalClassifier;
use campclerk::config::Config;
use campclerk::db::{Database, LibSqlBackend};
use campclerk::executor::{AttemptExecutor, LoggingExecutor};
use campclerk::inbound::ReplyRouter;
use campclerk::notify::{EmailSender, HttpEmailSender, HttpSmsGateway, Notifier, SmsSender};
use campclerk::poller::Poller;
use campclerk::settlement::{HttpPaymentProcessor, PaymentProcessor, SettlementCommitter};
use campclerk::web::server::{AppState, start_server};
use campclerk::window::QuarterSeasonFallback;

#[derive(Parser, Debug)]
#[command(name = "campclerk", version, about = "Registration execution coordinator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the coordinator: adaptive poller, ticket sweep, and webhook server.
    Serve,
    /// Apply database migrations and exit.
    Migrate,
    /// Validate configuration and probe external dependencies.
    Doctor {
        /// Exit non-zero when any check fails.
        #[arg(long)]
        strict: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve => serve().await,
        Command::Migrate => migrate().await,
        Command::Doctor { strict } => campclerk::cli::doctor::run_doctor_command(strict).await,
    }
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("campclerk=info,tower_http=warn"));

    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn open_database(config: &Config) -> anyhow::Result<LibSqlBackend> {
    let backend = if config.database.path.as_os_str() == ":memory:" {
        LibSqlBackend::new_memory().await
    } else {
        LibSqlBackend::new_local(&config.database.path).await
    };
    backend.context("failed to open database")
}

async fn migrate() -> anyhow::Result<()> {
    let config = Config::load().context("configuration")?;
    let backend = open_database(&config).await?;
    backend.run_migrations().await.context("migrations")?;
    tracing::info!(path = %config.database.path.display(), "migrations applied");
    Ok(())
}

async fn serve() -> anyhow::Result<()> {
    let config = Config::load().context("configuration")?;

    let backend = open_database(&config).await?;
    backend.run_migrations().await.context("migrations")?;
    let db: Arc<dyn Database> = Arc::new(backend);

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .context("http client")?;

    let sms: Option<Arc<dyn SmsSender>> = config.notify.sms.as_ref().map(|c| {
        Arc::new(HttpSmsGateway::new(
            client.clone(),
            c.endpoint.clone(),
            c.auth_token.clone(),
            c.from.clone(),
        )) as Arc<dyn SmsSender>
    });
    let email: Option<Arc<dyn EmailSender>> = config.notify.email.as_ref().map(|c| {
        Arc::new(HttpEmailSender::new(
            client.clone(),
            c.endpoint.clone(),
            c.api_key.clone(),
            c.from.clone(),
        )) as Arc<dyn EmailSender>
    });
    if sms.is_none() && email.is_none() {
        tracing::warn!("no notification channel configured; challenge tickets will go unnotified");
    }
    let notifier = Notifier::new(sms, email);

    let checkpoints = Arc::new(CheckpointService::new(
        db.clone(),
        config.checkpoints.keep,
        chrono::Duration::seconds(config.checkpoints.max_recovery_age_secs),
    ));

    let executor: Arc<dyn AttemptExecutor> = Arc::new(LoggingExecutor);

    let broker = Arc::new(ChallengeBroker::new(
        db.clone(),
        notifier,
        checkpoints,
        executor.clone(),
        config.challenge.clone(),
    ));

    let processor: Arc<dyn PaymentProcessor> = Arc::new(HttpPaymentProcessor::new(
        client.clone(),
        config.payments.base_url.clone(),
        config.payments.secret.clone(),
    ));
    let committer = Arc::new(SettlementCommitter::new(
        db.clone(),
        processor,
        config.payments.max_attempts,
    ));

    let replies = Arc::new(ReplyRouter::new(db.clone(), broker.clone()));

    let classifier = SignalClassifier::new(Duration::from_secs(config.poller.probe_timeout_secs))
        .context("probe client")?;
    let poller = Arc::new(Poller::new(
        db.clone(),
        classifier,
        executor,
        Arc::new(QuarterSeasonFallback),
    ));

    let state = Arc::new(AppState {
        db,
        committer,
        broker: broker.clone(),
        replies,
        callback_secret: config.server.callback_secret.clone(),
        inbound_auth_token: config.server.inbound_auth_token.clone(),
        shutdown_tx: tokio::sync::RwLock::new(None),
    });

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("server address")?;
    let bound = start_server(
        addr,
        state.clone(),
        config.server.operator_token.expose_secret().to_string(),
    )
    .await?;
    tracing::info!(addr = %bound, "campclerk up");

    let poll_handle = tokio::spawn(poller.run(Duration::from_secs(config.poller.tick_secs)));
    let sweep_handle = tokio::spawn(
        broker.run_sweeper(Duration::from_secs(config.challenge.sweep_interval_secs)),
    );

    tokio::signal::ctrl_c().await.context("signal handler")?;
    tracing::info!("shutdown requested");

    poll_handle.abort();
    sweep_handle.abort();
    state.shutdown().await;

    Ok(())
}
