use std::sync::Arc;

use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::{
    classifier::{Classification, classify},
    config::{ConfigSnapshot, SharedConfig},
    error::{ReplyError, SessionError},
    render::render,
    resolver::{UserDirectory, resolve, weekday_index},
    transport::{InboundEvent, InboundMessage, Transport},
    truncate,
};

/// Source of "now" for picking the roster day.
pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Connected,
    RecoverableError,
    Terminated,
}

/// Consecutive transport errors since the last healthy event.
#[derive(Debug, Default)]
pub struct ErrorBudget {
    consecutive: u32,
}

impl ErrorBudget {
    /// Count one more error; true once `threshold` is reached.
    pub const fn record_error(&mut self, threshold: u32) -> bool {
        self.consecutive = self.consecutive.saturating_add(1);
        self.consecutive >= threshold
    }

    pub const fn reset(&mut self) {
        self.consecutive = 0;
    }

    #[must_use]
    pub const fn consecutive(&self) -> u32 {
        self.consecutive
    }
}

/// Drives one transport connection from start to fatal termination.
pub struct Session<T: Transport + ?Sized> {
    transport: Arc<T>,
    config: SharedConfig,
    clock: Arc<dyn Clock>,
    state: SessionState,
    budget: ErrorBudget,
}

impl<T: Transport + ?Sized> core::fmt::Debug for Session<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state)
            .field("budget", &self.budget)
            .finish_non_exhaustive()
    }
}

impl<T: Transport + ?Sized> Session<T> {
    pub fn new(transport: Arc<T>, config: SharedConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            transport,
            config,
            clock,
            state: SessionState::Connecting,
            budget: ErrorBudget::default(),
        }
    }

    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Connect and consume events until the session has to give up.
    ///
    /// Returns `Ok(())` only when the transport closes its event stream.
    ///
    /// # Errors
    ///
    /// [`SessionError::AuthenticationFailed`] and
    /// [`SessionError::ErrorBudgetExhausted`] are returned after the transport
    /// has been disconnected; [`SessionError::Connect`] when the connection
    /// activity could not be started at all.
    pub async fn run(mut self) -> Result<(), SessionError> {
        info!("Send request for connection");
        let mut events = self
            .transport
            .connect()
            .await
            .map_err(SessionError::Connect)?;

        while let Some(event) = events.recv().await {
            debug!(kind = event.kind(), "Incoming event");
            if let Err(fatal) = self.handle_event(event).await {
                self.state = SessionState::Terminated;
                self.transport.disconnect().await;
                return Err(fatal);
            }
        }

        warn!(state = ?self.state, "Event stream closed by transport");
        Ok(())
    }

    async fn handle_event(&mut self, event: InboundEvent) -> Result<(), SessionError> {
        match event {
            InboundEvent::ConnectionEstablished => {
                info!("Connection established");
                self.state = SessionState::Connected;
                self.budget.reset();
            }
            InboundEvent::AuthenticationFailed => {
                warn!("Could not authenticate, invalid access token passed, terminate");
                return Err(SessionError::AuthenticationFailed);
            }
            InboundEvent::TransportError { detail } => {
                let threshold = self.config.load().error_retry_threshold;
                let exhausted = self.budget.record_error(threshold);
                warn!(
                    error = %detail,
                    consecutive = self.budget.consecutive(),
                    threshold,
                    "Incoming transport error"
                );
                if exhausted {
                    warn!(threshold, "Reached error reconnect limit, terminate");
                    return Err(SessionError::ErrorBudgetExhausted { threshold, detail });
                }
                self.state = SessionState::RecoverableError;
            }
            InboundEvent::Message(message) => {
                self.budget.reset();
                self.state = SessionState::Connected;
                self.on_message(&message).await;
            }
        }
        Ok(())
    }

    async fn on_message(&self, message: &InboundMessage) {
        let snapshot = self.config.load();
        if let Classification::Reject(reason) = classify(message, &snapshot.keywords) {
            debug!(channel = %message.channel_id, reason = %reason, "Ignoring message");
            return;
        }

        let body = message.text.as_deref().map(|t| truncate(t, 200));
        info!(channel = %message.channel_id, body = ?body, "Incoming message matched keywords");

        let now = self.clock.now().to_offset(snapshot.utc_offset);
        if let Err(e) = self.reply(&snapshot, message, weekday_index(now)).await {
            warn!(error = %e, channel = %message.channel_id, "Handle message event error");
        }
    }

    async fn reply(
        &self,
        snapshot: &ConfigSnapshot,
        message: &InboundMessage,
        weekday: usize,
    ) -> Result<(), ReplyError> {
        let directory = self.directory(&message.channel_id).await;
        let mentions = resolve(
            &snapshot.roster,
            weekday,
            &directory,
            snapshot.fallback_group().as_ref(),
        )?;
        let reply = render(&mentions, snapshot.reply_in_thread, message);
        info!(
            channel = %reply.channel_id,
            thread = ?reply.thread_anchor,
            text = %reply.text,
            "Outgoing message"
        );
        self.transport.send(&reply).await.map_err(ReplyError::Send)
    }

    async fn directory(&self, channel_id: &str) -> UserDirectory {
        match self.transport.users(channel_id).await {
            Ok(entries) => UserDirectory::from_entries(entries),
            Err(e) => {
                warn!(error = %e, channel = %channel_id, "Failed to get users list");
                UserDirectory::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_exhausts_at_threshold() {
        let mut budget = ErrorBudget::default();
        for _ in 0..2 {
            assert!(!budget.record_error(3));
        }
        assert!(budget.record_error(3));
        assert_eq!(budget.consecutive(), 3);
    }

    #[test]
    fn budget_reset_starts_over() {
        let mut budget = ErrorBudget::default();
        assert!(!budget.record_error(2));
        budget.reset();
        assert!(!budget.record_error(2));
        assert!(budget.record_error(2));
    }

    #[test]
    fn threshold_of_one_fails_on_first_error() {
        let mut budget = ErrorBudget::default();
        assert!(budget.record_error(1));
    }
}
