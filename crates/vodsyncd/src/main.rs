use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use vodsync::db::progress_repo;
use vodsync::download::{DownloadSettings, DownloadWorker, HttpMediaFetcher};
use vodsync::server::{self, AppState};
use vodsync::upload::{ResumableUploader, UploadSettings, UploadWorker};
use vodsync::{
    init_logging, load_config, BackoffPolicy, ChatNotifier, Config, Correlator, Database,
    HelixSource, HttpOAuthClient, IngestScheduler, ReplayService, ReplaySettings, SqliteTokenStore,
    TokenManager, VodProgressBroadcaster, WorkerOptions,
};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser, Debug)]
#[command(author, version, about = "Archives broadcasts, publishes them and replays their chat", long_about = None)]
struct Cli {
    /// Configuration file (YAML or JSON)
    #[arg(long, short, default_value = "vodsync.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Runs discovery, both workers and the HTTP surface until interrupted
    Run,
    /// Runs a single discovery pass and exits
    IngestOnce,
    /// Puts a failed VOD back into the pipeline
    Reenqueue { vod_id: i64 },
    /// Correlates a VOD's chat now
    Correlate { vod_id: i64 },
    /// Prints a VOD's progress as JSON
    Status { vod_id: i64 },
    /// Prints the consent URL for the upload account
    AuthUrl,
    /// Exchanges an authorization code and stores the resulting tokens
    AuthExchange { code: String },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), BoxError> {
    let config = load_config(&cli.config)?;
    init_logging(&config.logging)?;

    let db_path = config
        .database
        .resolved_path()
        .ok_or("no database path configured and no home directory to default to")?;
    let db = Database::open(&db_path)?;

    match cli.command {
        Command::Run => run_daemon(config, db).await,
        Command::IngestOnce => {
            let scheduler = scheduler(&config, &db, VodProgressBroadcaster::default())?;
            let report = scheduler.run_once().await?;
            println!(
                "discovered {} broadcast(s), enqueued {:?}",
                report.discovered, report.enqueued
            );
            Ok(())
        }
        Command::Reenqueue { vod_id } => {
            match progress_repo::reenqueue(&db, vod_id, Utc::now())? {
                Some(state) => println!("VOD {} re-enqueued as {}", vod_id, state),
                None => println!("VOD {} is not in the failed state", vod_id),
            }
            Ok(())
        }
        Command::Correlate { vod_id } => {
            let correlator = Correlator::new(db, ChatNotifier::default(), VodProgressBroadcaster::default());
            let report = correlator.correlate(vod_id).await?;
            println!(
                "correlated {} message(s) ({} clamped, {} unparseable), upload gate {}",
                report.updated,
                report.clamped,
                report.unparseable,
                if report.gate_opened { "opened" } else { "unchanged" }
            );
            Ok(())
        }
        Command::Status { vod_id } => {
            let view = progress_repo::view(&db, vod_id)?.ok_or(format!("unknown VOD {}", vod_id))?;
            println!("{}", serde_json::to_string_pretty(&view)?);
            Ok(())
        }
        Command::AuthUrl => {
            let client = HttpOAuthClient::from_config(&config.oauth)?;
            let state = uuid::Uuid::new_v4().to_string();
            println!("{}", client.authorize_url(&state)?);
            Ok(())
        }
        Command::AuthExchange { code } => {
            let client = Arc::new(HttpOAuthClient::from_config(&config.oauth)?);
            let grant = client.exchange_code(&code).await?;
            let tokens = token_manager(&config, &db, client);
            let stored = tokens.store_grant(grant, Utc::now()).await?;
            if stored.refresh_token.is_empty() {
                log::warn!("Provider returned no refresh token; uploads will fail once the access token expires");
            }
            println!(
                "stored token for {} (expires {})",
                tokens.provider(),
                stored.expiry
            );
            Ok(())
        }
    }
}

fn scheduler(
    config: &Config,
    db: &Database,
    progress: VodProgressBroadcaster,
) -> Result<IngestScheduler, BoxError> {
    let source = HelixSource::from_config(&config.source)?;
    Ok(IngestScheduler::new(
        db.clone(),
        Arc::new(source),
        &config.source.channel,
        config.source.poll_interval(),
        progress,
    ))
}

fn token_manager(config: &Config, db: &Database, client: Arc<HttpOAuthClient>) -> TokenManager {
    TokenManager::new(
        Arc::new(SqliteTokenStore::new(db.clone())),
        client,
        &config.upload.provider,
        config.upload.refresh_margin(),
    )
}

async fn run_daemon(config: Config, db: Database) -> Result<(), BoxError> {
    let shutdown = CancellationToken::new();
    let progress = VodProgressBroadcaster::default();
    let notifier = ChatNotifier::default();
    let correlator = Correlator::new(db.clone(), notifier.clone(), progress.clone());
    let backoff = BackoffPolicy::from_config(&config.backoff);

    let scheduler = scheduler(&config, &db, progress.clone())?;
    let download = DownloadWorker::new(
        db.clone(),
        Arc::new(HttpMediaFetcher::new()?),
        correlator.clone(),
        progress.clone(),
        backoff.clone(),
        WorkerOptions::from_config(&config.workers),
        DownloadSettings::from_config(&config.download),
    );
    let oauth = Arc::new(HttpOAuthClient::from_config(&config.oauth)?);
    let upload = UploadWorker::new(
        db.clone(),
        Arc::new(ResumableUploader::from_config(&config.upload)?),
        Arc::new(token_manager(&config, &db, oauth)),
        correlator,
        progress.clone(),
        backoff,
        WorkerOptions::from_config(&config.workers),
        UploadSettings::from_config(&config.upload),
    );

    let state = Arc::new(AppState {
        db: db.clone(),
        replay: ReplayService::new(db, notifier, ReplaySettings::from_config(&config.replay)),
        progress,
        keep_alive: config.replay.keep_alive(),
        shutdown: shutdown.clone(),
    });
    let listener = tokio::net::TcpListener::bind(&config.replay.bind).await?;

    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => log::info!("Interrupt received, shutting down"),
            Err(e) => log::error!("Failed to listen for interrupt: {}", e),
        }
        signal.cancel();
    });

    let tasks = vec![
        tokio::spawn({
            let shutdown = shutdown.clone();
            async move { scheduler.run(shutdown).await }
        }),
        tokio::spawn({
            let shutdown = shutdown.clone();
            async move { download.run(shutdown).await }
        }),
        tokio::spawn({
            let shutdown = shutdown.clone();
            async move { upload.run(shutdown).await }
        }),
    ];

    let served = server::serve(listener, state).await;
    // The server only returns early on error; stop the workers either way.
    shutdown.cancel();
    for task in tasks {
        if let Err(e) = task.await {
            log::error!("Worker task panicked: {}", e);
        }
    }
    served?;
    log::info!("Shutdown complete");
    Ok(())
}
