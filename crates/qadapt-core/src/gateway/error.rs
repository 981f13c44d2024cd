use thiserror::Error;

/// Where the application shell should send the user after a failure.
///
/// The gateway never navigates itself; it only reports the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Redirect {
    /// Session is gone for good, log in again
    Login,
    /// Server unreachable; show the connection-lost screen with a manual retry
    ConnectionLost,
}

impl Redirect {
    pub fn path(&self) -> &'static str {
        match self {
            Redirect::Login => "/login",
            Redirect::ConnectionLost => "/session-error",
        }
    }
}

/// Why an outbound request could not be authorized.
///
/// `Clone` because a single refresh failure is delivered to every request
/// queued behind it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("No active session - please log in")]
    MissingSession,

    #[error("Session refresh rejected: {0}")]
    RefreshRejected(String),

    #[error("Server issued an access token that cannot be sent as a header")]
    InvalidToken,

    #[error("Unable to reach the server: {0}")]
    ConnectionLost(String),

    #[error("Refresh skipped after a connection failure - retry to reconnect")]
    RefreshSuppressed,

    #[error("Session ended by logout")]
    LoggedOut,

    #[error("Refresh abandoned before it completed")]
    Abandoned,
}

impl GatewayError {
    /// True when the stored session can no longer be used and was cleared
    pub fn ends_session(&self) -> bool {
        matches!(
            self,
            GatewayError::MissingSession
                | GatewayError::RefreshRejected(_)
                | GatewayError::InvalidToken
                | GatewayError::LoggedOut
        )
    }

    pub fn redirect(&self) -> Option<Redirect> {
        match self {
            GatewayError::ConnectionLost(_) => Some(Redirect::ConnectionLost),
            GatewayError::RefreshSuppressed | GatewayError::Abandoned => None,
            _ if self.ends_session() => Some(Redirect::Login),
            _ => None,
        }
    }
}
