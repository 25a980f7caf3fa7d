use core::fmt;

use crate::{config::Keywords, transport::InboundMessage};

/// Why a message does not get a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    TopicChange,
    EmptyText,
    NoKeyword,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::TopicChange => "topic change",
            Self::EmptyText => "empty text",
            Self::NoKeyword => "no matching keyword",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Accept,
    Reject(Rejection),
}

/// Decide whether `message` deserves a duty reply.
///
/// Checks run in order and stop at the first failure: topic changes, then
/// empty text, then a case-insensitive substring search for any keyword.
#[must_use]
pub fn classify(message: &InboundMessage, keywords: &Keywords) -> Classification {
    if message.is_topic_change {
        return Classification::Reject(Rejection::TopicChange);
    }
    let Some(text) = message.text.as_deref().filter(|t| !t.trim().is_empty()) else {
        return Classification::Reject(Rejection::EmptyText);
    };
    let text = text.to_lowercase();
    if keywords.iter().any(|keyword| text.contains(keyword)) {
        Classification::Accept
    } else {
        Classification::Reject(Rejection::NoKeyword)
    }
}
