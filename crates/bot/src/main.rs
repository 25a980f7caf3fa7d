mod config;
mod logging;
mod matrix;

use core::time::Duration;
use std::{fs, path::PathBuf, sync::Arc};

use anyhow::{Context as _, Result};
use clap::Parser;
use duty_core::{Session, SharedConfig, SystemClock, Transport as _};
use matrix_sdk::Client;
use tracing::info;

use crate::{
    config::{ConfigSource, ConfigWatcher, Overrides, locate_config, spawn_reloader},
    logging::init_tracing,
    matrix::{MatrixTransport, restore_session},
};

#[derive(Parser, Debug)]
#[command(
    name = "matrix-duty-bot",
    version,
    about = "Mentions whoever is on duty today when a keyword is posted"
)]
struct Args {
    /// YAML config with keywords, the weekly duty roster and the access token.
    /// Watched for changes while running. Defaults to
    /// `~/.duty-bot/config.yaml`, then `./config.yaml`.
    #[arg(long, env = "DUTY_BOT_CONFIG")]
    config: Option<PathBuf>,

    /// Homeserver base URL, e.g. `https://matrix-client.matrix.org`.
    #[arg(long, env = "MATRIX_HOMESERVER")]
    homeserver: String,

    /// Full user ID the access token belongs to
    #[arg(long, env = "MATRIX_USER_ID")]
    user_id: String,

    /// Device ID the access token was issued for
    #[arg(long, env = "MATRIX_DEVICE_ID")]
    device_id: String,

    /// Access token; overrides `access_token` from the config file
    #[arg(long, env = "MATRIX_ACCESS_TOKEN", hide_env_values = true)]
    access_token: Option<String>,

    /// Directory for persistent state (encryption keys, sync cache)
    #[arg(long, env = "MATRIX_STORE", default_value = "./bot-store")]
    store: PathBuf,

    /// Trigger keywords; overrides `keywords` from the config file
    #[arg(long = "keyword", env = "DUTY_KEYWORDS", value_delimiter = ',')]
    keywords: Vec<String>,

    /// Fallback group id mentioned when nobody on the roster resolves
    #[arg(long, env = "DUTY_GROUP_ID")]
    group_id: Option<String>,

    /// Display name of the fallback group
    #[arg(long, env = "DUTY_GROUP_NAME")]
    group_name: Option<String>,

    /// Reply inside the triggering thread (`true`/`false`)
    #[arg(long, env = "DUTY_THREADS")]
    threads: Option<bool>,

    /// Consecutive transport errors tolerated before giving up
    #[arg(long, env = "DUTY_ERROR_RETRY_THRESHOLD")]
    error_retry_threshold: Option<u32>,

    /// Disable auto-joining rooms when invited
    #[arg(long)]
    no_autojoin: bool,

    /// Sync timeout in milliseconds
    #[arg(long, env = "MATRIX_SYNC_TIMEOUT_MS", default_value_t = 30000)]
    sync_timeout_ms: u64,
}

impl Args {
    fn overrides(&self) -> Overrides {
        Overrides {
            access_token: self.access_token.clone(),
            keywords: self.keywords.clone(),
            group_id: self.group_id.clone(),
            group_name: self.group_name.clone(),
            reply_in_thread: self.threads,
            error_retry_threshold: self.error_retry_threshold,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env first so RUST_LOG and clap env vars are visible.
    let _ = dotenvy::dotenv();
    init_tracing()?;
    let args = Args::parse();

    let config_path = locate_config(args.config.clone(), dirs_next::home_dir().as_deref());
    info!(path = %config_path.display(), "Using config file");
    let source = ConfigSource::new(config_path, args.overrides());
    let loaded = source.load().context("loading configuration")?;
    info!(config = ?loaded.snapshot, "Configuration loaded");
    let credential = loaded.snapshot.credential.clone();
    let shared = SharedConfig::new(loaded.snapshot);

    let (_watcher, changes) = ConfigWatcher::start(source.path())?;
    let mut reload_failures =
        spawn_reloader(source, shared.clone(), loaded.reload_policy, changes);

    fs::create_dir_all(&args.store)
        .with_context(|| format!("creating store directory at {}", args.store.display()))?;

    // Build client with SQLite store to persist E2EE state
    let client = Client::builder()
        .homeserver_url(&args.homeserver)
        .sqlite_store(&args.store, None)
        .build()
        .await
        .context("building matrix client")?;
    restore_session(&client, &args.user_id, &args.device_id, credential).await?;

    let transport = Arc::new(MatrixTransport::new(
        client,
        Duration::from_millis(args.sync_timeout_ms),
        !args.no_autojoin,
    ));
    let session = Session::new(Arc::clone(&transport), shared, Arc::new(SystemClock));

    tokio::select! {
        result = session.run() => result.context("duty session ended"),
        Ok(error) = &mut reload_failures => {
            transport.disconnect().await;
            Err(error.context("configuration reload failed, terminate"))
        }
    }
}
