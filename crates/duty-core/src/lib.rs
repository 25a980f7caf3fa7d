//! Duty rotation and live-session core for the duty bot.
//!
//! The crate knows nothing about a concrete chat platform. A [`Transport`]
//! implementation feeds [`InboundEvent`]s into a [`Session`], which classifies
//! messages, resolves today's duty roster and sends the rendered reply back
//! through the same transport.

pub mod classifier;
pub mod config;
pub mod error;
pub mod render;
pub mod resolver;
pub mod session;
pub mod transport;

pub use classifier::{Classification, Rejection, classify};
pub use config::{ConfigSnapshot, FallbackGroup, Keywords, Roster, SharedConfig};
pub use error::{ConfigError, ReplyError, ResolveError, SessionError};
pub use render::{OutboundReply, render};
pub use resolver::{LookupMiss, Mention, UserDirectory, resolve, weekday_index};
pub use session::{Clock, ErrorBudget, Session, SessionState, SystemClock};
pub use transport::{DirectoryEntry, InboundEvent, InboundMessage, Transport};

/// Cut `s` down to at most `max` characters.
#[must_use]
pub fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}
