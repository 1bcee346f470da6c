pub mod auth;
pub mod backoff;
pub mod broadcast;
pub mod config;
pub mod correlate;
pub mod db;
pub mod download;
pub mod error;
pub mod logging;
pub mod replay;
pub mod secrets;
pub mod server;
pub mod source;
pub mod upload;
pub mod worker;

pub use auth::{AuthError, HttpOAuthClient, SqliteTokenStore, TokenManager, TokenStore};
pub use backoff::BackoffPolicy;
pub use broadcast::{ChatNotifier, ProgressPhase, VodProgressBroadcaster, VodProgressEvent};
pub use config::{load_config, Config};
pub use correlate::{CorrelationReport, Correlator};
pub use db::{Database, DatabaseError};
pub use download::{DownloadSettings, DownloadWorker, FetchError, HttpMediaFetcher};
pub use error::{ConfigError, FailureKind, Result, VodsyncError};
pub use logging::init_logging;
pub use replay::{Cursor, ReplayEvent, ReplayService, ReplaySettings, StreamError};
pub use secrets::{resolve_secret, SecretError};
pub use server::AppState;
pub use source::{HelixSource, IngestScheduler};
pub use upload::{PublishError, ResumableUploader, UploadSettings, UploadWorker};
pub use worker::{StageOutcome, WorkerOptions};
