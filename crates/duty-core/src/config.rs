use core::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::Deserialize;
use time::UtcOffset;

use crate::error::ConfigError;

pub const DAYS_PER_WEEK: usize = 7;
pub const DEFAULT_ERROR_RETRY_THRESHOLD: u32 = 500;

/// Case-insensitive trigger words, stored trimmed and lower-cased.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Keywords(Vec<String>);

impl Keywords {
    /// Normalise raw keywords: blanks are dropped, duplicates keep their first position.
    pub fn new<I, S>(raw: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut words: Vec<String> = Vec::new();
        for word in raw {
            let word = word.as_ref().trim().to_lowercase();
            if !word.is_empty() && !words.contains(&word) {
                words.push(word);
            }
        }
        Self(words)
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

/// Weekly duty schedule: one list of usernames per weekday, Sunday first.
///
/// Either empty or exactly [`DAYS_PER_WEEK`] entries long.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "Vec<Vec<String>>")]
pub struct Roster(Vec<Vec<String>>);

impl Roster {
    /// # Errors
    ///
    /// Returns [`ConfigError::RosterLength`] unless `days` is empty or has one
    /// entry per weekday.
    pub fn new(days: Vec<Vec<String>>) -> Result<Self, ConfigError> {
        if days.is_empty() || days.len() == DAYS_PER_WEEK {
            Ok(Self(days))
        } else {
            Err(ConfigError::RosterLength(days.len()))
        }
    }

    /// Usernames on duty for `weekday`, if the roster covers it.
    #[must_use]
    pub fn day(&self, weekday: usize) -> Option<&[String]> {
        self.0.get(weekday).map(Vec::as_slice)
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl TryFrom<Vec<Vec<String>>> for Roster {
    type Error = ConfigError;

    fn try_from(days: Vec<Vec<String>>) -> Result<Self, Self::Error> {
        Self::new(days)
    }
}

/// Group mentioned when nobody from the roster can be resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackGroup {
    pub id: String,
    pub name: String,
}

/// Immutable view of the current settings. Replaced wholesale on reload.
#[derive(Clone)]
pub struct ConfigSnapshot {
    pub credential: String,
    pub keywords: Keywords,
    pub roster: Roster,
    pub fallback_group_id: Option<String>,
    pub fallback_group_name: Option<String>,
    pub reply_in_thread: bool,
    pub error_retry_threshold: u32,
    pub utc_offset: UtcOffset,
}

impl ConfigSnapshot {
    /// Snapshot with defaults for everything but the required values.
    #[must_use]
    pub fn new(credential: impl Into<String>, keywords: Keywords) -> Self {
        Self {
            credential: credential.into(),
            keywords,
            roster: Roster::default(),
            fallback_group_id: None,
            fallback_group_name: None,
            reply_in_thread: true,
            error_retry_threshold: DEFAULT_ERROR_RETRY_THRESHOLD,
            utc_offset: UtcOffset::UTC,
        }
    }

    /// Check the values the bot cannot start without.
    ///
    /// # Errors
    ///
    /// Fails on a blank credential, an empty keyword set or a zero threshold.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.credential.trim().is_empty() {
            return Err(ConfigError::MissingCredential);
        }
        if self.keywords.is_empty() {
            return Err(ConfigError::MissingKeywords);
        }
        if self.error_retry_threshold == 0 {
            return Err(ConfigError::ZeroErrorThreshold);
        }
        Ok(())
    }

    /// Fallback group, only when both id and name are set.
    #[must_use]
    pub fn fallback_group(&self) -> Option<FallbackGroup> {
        let id = self.fallback_group_id.as_deref().map(str::trim)?;
        let name = self.fallback_group_name.as_deref().map(str::trim)?;
        if id.is_empty() || name.is_empty() {
            return None;
        }
        Some(FallbackGroup {
            id: id.to_owned(),
            name: name.to_owned(),
        })
    }
}

impl fmt::Debug for ConfigSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigSnapshot")
            .field("credential", &"[redacted]")
            .field("keywords", &self.keywords)
            .field("roster", &self.roster)
            .field("fallback_group_id", &self.fallback_group_id)
            .field("fallback_group_name", &self.fallback_group_name)
            .field("reply_in_thread", &self.reply_in_thread)
            .field("error_retry_threshold", &self.error_retry_threshold)
            .field("utc_offset", &self.utc_offset)
            .finish()
    }
}

/// Atomically replaceable handle to the current [`ConfigSnapshot`].
///
/// One writer (the config reloader) swaps whole snapshots in; readers call
/// [`SharedConfig::load`] and keep the returned `Arc` for as long as they need
/// a consistent view.
#[derive(Clone)]
pub struct SharedConfig {
    inner: Arc<ArcSwap<ConfigSnapshot>>,
}

impl SharedConfig {
    #[must_use]
    pub fn new(snapshot: ConfigSnapshot) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(snapshot)),
        }
    }

    #[must_use]
    pub fn load(&self) -> Arc<ConfigSnapshot> {
        self.inner.load_full()
    }

    pub fn replace(&self, snapshot: ConfigSnapshot) {
        self.inner.store(Arc::new(snapshot));
    }
}

impl fmt::Debug for SharedConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SharedConfig").field(&self.load()).finish()
    }
}
