use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::render::OutboundReply;

/// Everything a transport can report to the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    /// The connection is (again) up and delivering events.
    ConnectionEstablished,
    /// The platform rejected the credential. Retrying cannot help.
    AuthenticationFailed,
    /// A transient transport problem; the transport keeps reconnecting.
    TransportError { detail: String },
    Message(InboundMessage),
}

impl InboundEvent {
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::ConnectionEstablished => "connection_established",
            Self::AuthenticationFailed => "authentication_failed",
            Self::TransportError { .. } => "transport_error",
            Self::Message(_) => "message",
        }
    }
}

/// A chat message (or topic change) as seen by the bot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InboundMessage {
    /// Plain text body; `None` for media and other non-text content.
    pub text: Option<String>,
    pub channel_id: String,
    /// Platform identifier of this message.
    pub message_id: String,
    /// Identifier of the thread root when the message was posted in a thread.
    pub thread_id: Option<String>,
    pub is_topic_change: bool,
}

/// One user known to the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    /// Short name, not necessarily unique across servers.
    pub username: String,
    pub user_id: String,
    /// Registered on the same server as the bot.
    pub is_local: bool,
}

/// Chat platform client as seen by the session.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start the connection activity (connect, keepalive, reconnect) in the
    /// background and hand back the ordered event stream. Must not wait for
    /// the connection to be established.
    async fn connect(&self) -> Result<mpsc::Receiver<InboundEvent>>;

    /// Users currently visible in `channel_id`.
    async fn users(&self, channel_id: &str) -> Result<Vec<DirectoryEntry>>;

    async fn send(&self, reply: &OutboundReply) -> Result<()>;

    /// Stop the connection activity. Best effort.
    async fn disconnect(&self);
}
