/// Invalid or incomplete configuration.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("access token is required")]
    MissingCredential,

    #[error("at least one keyword is required")]
    MissingKeywords,

    #[error("duty roster must list exactly 7 days (Sunday first), got {0}")]
    RosterLength(usize),

    #[error("error retry threshold must be at least 1")]
    ZeroErrorThreshold,

    #[error("utc offset {0}h is out of range")]
    UtcOffset(i8),
}

/// Duty resolution produced nothing worth sending.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("nobody resolvable is on duty for weekday {weekday} and no fallback group is configured")]
    NoDuty { weekday: usize },
}

/// Failure while building or sending a single reply. Never fatal for the session.
#[derive(Debug, thiserror::Error)]
pub enum ReplyError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("sending reply failed: {0:#}")]
    Send(anyhow::Error),
}

/// Reason a [`crate::Session`] stopped for good.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("could not start transport connection: {0:#}")]
    Connect(anyhow::Error),

    #[error("could not authenticate, invalid access token")]
    AuthenticationFailed,

    #[error("reached error reconnect limit {threshold}, last error: {detail}")]
    ErrorBudgetExhausted { threshold: u32, detail: String },
}
