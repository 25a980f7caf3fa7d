use crate::{resolver::Mention, transport::InboundMessage};

pub const MENTION_SEPARATOR: &str = ", ";

const PERMALINK_BASE: &str = "https://matrix.to/#/";

/// A reply ready to hand to [`crate::Transport::send`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundReply {
    /// Plain-text body.
    pub text: String,
    /// Formatted body with mention pills.
    pub html: String,
    pub channel_id: String,
    /// Thread root to post into; `None` posts to the channel itself.
    pub thread_anchor: Option<String>,
    /// Message that triggered the reply.
    pub reply_to: String,
    pub mentioned_user_ids: Vec<String>,
}

impl Mention {
    fn label(&self) -> String {
        match self {
            Self::User { username, .. } => format!("@{}", username.trim_start_matches('@')),
            Self::Group { name, .. } => format!("@{name}"),
        }
    }

    fn target(&self) -> &str {
        match self {
            Self::User { id, .. } | Self::Group { id, .. } => id.as_str(),
        }
    }

    fn pill(&self) -> String {
        format!(
            "<a href=\"{PERMALINK_BASE}{}\">{}</a>",
            escape_html(self.target()),
            escape_html(&self.label())
        )
    }
}

/// Build the reply for `origin` from resolved mentions.
///
/// With threading on, a message that already sits in a thread is answered in
/// that thread; any other message becomes the root of a new one.
#[must_use]
pub fn render(mentions: &[Mention], reply_in_thread: bool, origin: &InboundMessage) -> OutboundReply {
    let text = mentions
        .iter()
        .map(Mention::label)
        .collect::<Vec<_>>()
        .join(MENTION_SEPARATOR);
    let html = mentions
        .iter()
        .map(Mention::pill)
        .collect::<Vec<_>>()
        .join(MENTION_SEPARATOR);
    let mentioned_user_ids = mentions
        .iter()
        .filter_map(|mention| match mention {
            Mention::User { id, .. } => Some(id.clone()),
            Mention::Group { .. } => None,
        })
        .collect();
    let thread_anchor = reply_in_thread.then(|| {
        origin
            .thread_id
            .clone()
            .unwrap_or_else(|| origin.message_id.clone())
    });

    OutboundReply {
        text,
        html,
        channel_id: origin.channel_id.clone(),
        thread_anchor,
        reply_to: origin.message_id.clone(),
        mentioned_user_ids,
    }
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}
