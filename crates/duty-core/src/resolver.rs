use core::{fmt, iter};

use time::OffsetDateTime;
use tracing::warn;

use crate::{
    config::{FallbackGroup, Roster},
    error::ResolveError,
    transport::DirectoryEntry,
};

/// Someone (or some group) to ping in the reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mention {
    User { id: String, username: String },
    Group { id: String, name: String },
}

/// Why a roster name did not resolve to a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupMiss {
    Unknown,
    /// Several users share the name and none of them is uniquely local.
    Ambiguous { candidates: usize },
}

impl fmt::Display for LookupMiss {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => f.write_str("unknown user"),
            Self::Ambiguous { candidates } => write!(f, "{candidates} users share this name"),
        }
    }
}

/// Username to platform id lookup, rebuilt for every eligible message.
#[derive(Debug, Clone, Default)]
pub struct UserDirectory {
    entries: Vec<DirectoryEntry>,
}

impl UserDirectory {
    pub fn from_entries(entries: impl IntoIterator<Item = DirectoryEntry>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
        }
    }

    /// Find the platform id for a roster name.
    ///
    /// A full platform id matches exactly. A short name matches by username;
    /// when several users share it the single local one wins.
    ///
    /// # Errors
    ///
    /// [`LookupMiss::Unknown`] when nobody matches, [`LookupMiss::Ambiguous`]
    /// when the short name cannot be pinned to one user.
    pub fn lookup(&self, name: &str) -> Result<&str, LookupMiss> {
        if let Some(entry) = self.entries.iter().find(|e| e.user_id == name) {
            return Ok(&entry.user_id);
        }

        let mut matches = self.entries.iter().filter(|e| e.username == name);
        let Some(first) = matches.next() else {
            return Err(LookupMiss::Unknown);
        };
        let rest: Vec<&DirectoryEntry> = matches.collect();
        if rest.is_empty() {
            return Ok(&first.user_id);
        }

        let mut local = iter::once(first)
            .chain(rest.iter().copied())
            .filter(|e| e.is_local);
        match (local.next(), local.next()) {
            (Some(entry), None) => Ok(&entry.user_id),
            _ => Err(LookupMiss::Ambiguous {
                candidates: rest.len() + 1,
            }),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Days since Sunday, the roster's first slot.
#[must_use]
pub fn weekday_index(at: OffsetDateTime) -> usize {
    usize::from(at.weekday().number_days_from_sunday())
}

/// Turn the roster entry for `weekday` into mentions, in roster order.
///
/// Names `directory` cannot pin to one user are logged and skipped. When nobody is
/// left the fallback group is used, if configured.
///
/// # Errors
///
/// [`ResolveError::NoDuty`] when there is neither a resolvable user nor a
/// fallback group.
pub fn resolve(
    roster: &Roster,
    weekday: usize,
    directory: &UserDirectory,
    fallback: Option<&FallbackGroup>,
) -> Result<Vec<Mention>, ResolveError> {
    let mut mentions = Vec::new();
    for username in roster.day(weekday).unwrap_or_default() {
        match directory.lookup(username) {
            Ok(id) => mentions.push(Mention::User {
                id: id.to_owned(),
                username: username.clone(),
            }),
            Err(miss) => warn!(
                username = %username,
                weekday,
                reason = %miss,
                "Failed to get user id by username"
            ),
        }
    }

    if mentions.is_empty()
        && let Some(group) = fallback
    {
        mentions.push(Mention::Group {
            id: group.id.clone(),
            name: group.name.clone(),
        });
    }

    if mentions.is_empty() {
        return Err(ResolveError::NoDuty { weekday });
    }
    Ok(mentions)
}
