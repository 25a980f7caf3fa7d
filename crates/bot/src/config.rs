use core::time::Duration;
use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context as _, Result, anyhow};
use duty_core::{ConfigError, ConfigSnapshot, Keywords, Roster, SharedConfig};
use notify_debouncer_full::{
    DebounceEventResult, Debouncer, RecommendedCache, new_debouncer,
    notify::{EventKind, RecommendedWatcher, RecursiveMode},
};
use serde::Deserialize;
use time::UtcOffset;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

pub const CONFIG_FILE_NAME: &str = "config.yaml";
const HOME_CONFIG_DIR: &str = ".duty-bot";

/// Pick the config file when `--config` is not given: `~/.duty-bot/config.yaml`
/// if it exists, else `./config.yaml`.
pub fn locate_config(explicit: Option<PathBuf>, home: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path;
    }
    home.map(|home| home.join(HOME_CONFIG_DIR).join(CONFIG_FILE_NAME))
        .filter(|path| path.is_file())
        .unwrap_or_else(|| Path::new(".").join(CONFIG_FILE_NAME))
}

/// What to do when the config file changes into something unusable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReloadPolicy {
    /// Keep serving the last snapshot that loaded cleanly.
    #[default]
    Keep,
    /// Disconnect and exit.
    Terminate,
}

/// On-disk YAML shape.
///
/// ```yaml
/// access_token: "syt_..."
/// keywords: [standup, duty]
/// duties:            # Sunday first, exactly 7 entries
///   - []
///   - [alice]
///   - [bob, carol]
///   - [alice]
///   - [bob]
///   - [carol]
///   - []
/// fallback_group:
///   id: "#oncall:example.org"
///   name: oncall
/// reply_in_thread: true
/// error_retry_threshold: 500
/// utc_offset_hours: 3
/// on_reload_error: keep
/// ```
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    keywords: Vec<String>,
    #[serde(default, alias = "roster")]
    duties: Roster,
    #[serde(default)]
    fallback_group: Option<FallbackGroupConfig>,
    #[serde(default)]
    reply_in_thread: Option<bool>,
    #[serde(default)]
    error_retry_threshold: Option<u32>,
    #[serde(default)]
    utc_offset_hours: Option<i8>,
    #[serde(default)]
    on_reload_error: ReloadPolicy,
}

#[derive(Debug, Default, Deserialize)]
struct FallbackGroupConfig {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

/// Values given on the command line or environment. They win over the file
/// and are re-applied on every reload.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub access_token: Option<String>,
    pub keywords: Vec<String>,
    pub group_id: Option<String>,
    pub group_name: Option<String>,
    pub reply_in_thread: Option<bool>,
    pub error_retry_threshold: Option<u32>,
}

#[derive(Debug)]
pub struct LoadedConfig {
    pub snapshot: ConfigSnapshot,
    pub reload_policy: ReloadPolicy,
}

#[derive(Debug, Clone)]
pub struct ConfigSource {
    path: PathBuf,
    overrides: Overrides,
}

impl ConfigSource {
    pub const fn new(path: PathBuf, overrides: Overrides) -> Self {
        Self { path, overrides }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read, merge and validate the configuration.
    pub fn load(&self) -> Result<LoadedConfig> {
        if !self.path.exists() {
            return Err(anyhow!(
                "config file not found at {}. Create one or set --config",
                self.path.display()
            ));
        }
        let yaml = fs::read_to_string(&self.path)
            .with_context(|| format!("reading config file at {}", self.path.display()))?;
        let file: FileConfig = serde_yaml::from_str(&yaml).context("parsing YAML config")?;
        self.merge(file)
    }

    fn merge(&self, file: FileConfig) -> Result<LoadedConfig> {
        let overrides = &self.overrides;
        let credential = overrides
            .access_token
            .clone()
            .filter(|t| !t.trim().is_empty())
            .or(file.access_token)
            .unwrap_or_default();
        let keywords = if overrides.keywords.is_empty() {
            Keywords::new(&file.keywords)
        } else {
            Keywords::new(&overrides.keywords)
        };
        let group = file.fallback_group.unwrap_or_default();

        let mut snapshot = ConfigSnapshot::new(credential, keywords);
        snapshot.roster = file.duties;
        snapshot.fallback_group_id = overrides.group_id.clone().or(group.id);
        snapshot.fallback_group_name = overrides.group_name.clone().or(group.name);
        if let Some(threads) = overrides.reply_in_thread.or(file.reply_in_thread) {
            snapshot.reply_in_thread = threads;
        }
        if let Some(threshold) = overrides
            .error_retry_threshold
            .or(file.error_retry_threshold)
        {
            snapshot.error_retry_threshold = threshold;
        }
        if let Some(hours) = file.utc_offset_hours {
            snapshot.utc_offset =
                UtcOffset::from_hms(hours, 0, 0).map_err(|_| ConfigError::UtcOffset(hours))?;
        }
        snapshot.validate()?;

        Ok(LoadedConfig {
            snapshot,
            reload_policy: file.on_reload_error,
        })
    }
}

/// Re-read the file and swap the snapshot in.
///
/// Returns the policy to apply to the next failure. Under
/// [`ReloadPolicy::Keep`] a bad file is logged and the served snapshot stays
/// untouched.
pub fn reload(
    source: &ConfigSource,
    shared: &SharedConfig,
    policy: ReloadPolicy,
) -> Result<ReloadPolicy> {
    match source.load() {
        Ok(loaded) => {
            info!(config = ?loaded.snapshot, "Config file was changed");
            shared.replace(loaded.snapshot);
            Ok(loaded.reload_policy)
        }
        Err(e) if policy == ReloadPolicy::Keep => {
            warn!(error = %format!("{e:#}"), "Config reload failed, keeping previous version");
            Ok(policy)
        }
        Err(e) => Err(e),
    }
}

/// Apply every change notification until the policy says stop. The returned
/// receiver resolves only with a fatal reload error.
pub fn spawn_reloader(
    source: ConfigSource,
    shared: SharedConfig,
    mut policy: ReloadPolicy,
    mut changes: mpsc::UnboundedReceiver<()>,
) -> oneshot::Receiver<anyhow::Error> {
    let (fatal_tx, fatal_rx) = oneshot::channel();
    tokio::spawn(async move {
        while changes.recv().await.is_some() {
            match reload(&source, &shared, policy) {
                Ok(next) => policy = next,
                Err(e) => {
                    let _ = fatal_tx.send(e);
                    return;
                }
            }
        }
    });
    fatal_rx
}

/// Watches the config file's directory and reports writes to the file.
pub struct ConfigWatcher {
    _debouncer: Debouncer<RecommendedWatcher, RecommendedCache>,
}

impl core::fmt::Debug for ConfigWatcher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ConfigWatcher").finish_non_exhaustive()
    }
}

impl ConfigWatcher {
    /// The watcher must stay alive for notifications to keep coming.
    pub fn start(path: &Path) -> Result<(Self, mpsc::UnboundedReceiver<()>)> {
        let file_name = path
            .file_name()
            .map(ToOwned::to_owned)
            .ok_or_else(|| anyhow!("config path {} has no file name", path.display()))?;
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();
        let (tx, rx) = mpsc::unbounded_channel();

        let mut debouncer = new_debouncer(
            Duration::from_millis(500),
            None,
            move |result: DebounceEventResult| match result {
                Ok(events) => {
                    let touched = events.iter().any(|event| {
                        matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
                            && event
                                .paths
                                .iter()
                                .any(|p| p.file_name() == Some(file_name.as_os_str()))
                    });
                    if touched {
                        let _ = tx.send(());
                    }
                }
                Err(errors) => {
                    for e in errors {
                        warn!(error = %e, "config watcher error");
                    }
                }
            },
        )
        .context("creating config watcher")?;
        debouncer
            .watch(&dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("watching {}", dir.display()))?;
        info!(dir = %dir.display(), "Watching config directory");

        Ok((
            Self {
                _debouncer: debouncer,
            },
            rx,
        ))
    }
}
