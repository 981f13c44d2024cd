use std::collections::VecDeque;

use chrono::Duration;
use reqwest::header::{self, HeaderValue};
use reqwest::Request;
use tokio::sync::oneshot;

use super::GatewayError;
use crate::auth::Credential;

pub(crate) type Reply = oneshot::Sender<Result<Request, GatewayError>>;

/// A request parked until the in-flight refresh settles
pub(crate) struct PendingRequest {
    pub request: Request,
    pub reply: Reply,
}

/// Credential together with its ready-made `Authorization` header
#[derive(Clone)]
pub(crate) struct Installed {
    pub credential: Credential,
    pub header: HeaderValue,
}

impl Installed {
    pub fn new(credential: Credential) -> Result<Self, GatewayError> {
        let mut header =
            HeaderValue::from_str(&credential.bearer()).map_err(|_| GatewayError::InvalidToken)?;
        header.set_sensitive(true);
        Ok(Self { credential, header })
    }
}

/// Mutable gateway state. Only ever touched under the gateway's lock, and
/// the lock is never held across an `.await`.
#[derive(Default)]
pub(crate) struct Shared {
    pub installed: Option<Installed>,
    /// A leader is talking to the token endpoint
    pub refreshing: bool,
    /// Non-empty only while `refreshing`
    pub queue: VecDeque<PendingRequest>,
    /// Set by a connectivity failure; the next refresh attempt is skipped once
    pub skip_next_refresh: bool,
    /// Bumped by logout and login. A refresh started under an older epoch
    /// must not install or persist its result.
    pub epoch: u64,
}

impl Shared {
    /// Header for the installed credential if it is still usable
    pub fn valid_header(&self, margin: Duration) -> Option<&HeaderValue> {
        self.installed
            .as_ref()
            .filter(|installed| installed.credential.is_valid(margin))
            .map(|installed| &installed.header)
    }

    /// Release every queued request with the given header, oldest first
    pub fn resolve_all(&mut self, header: &HeaderValue) -> usize {
        let count = self.queue.len();
        for pending in self.queue.drain(..) {
            // A waiter that gave up has dropped its receiver; nothing to do
            let _ = pending.reply.send(Ok(stamp(pending.request, header)));
        }
        count
    }

    /// Fail every queued request with the same error, oldest first
    pub fn reject_all(&mut self, error: &GatewayError) -> usize {
        let count = self.queue.len();
        for pending in self.queue.drain(..) {
            let _ = pending.reply.send(Err(error.clone()));
        }
        count
    }
}

/// Attach the bearer header, leaving method, URL and body untouched
pub(crate) fn stamp(mut request: Request, header: &HeaderValue) -> Request {
    request
        .headers_mut()
        .insert(header::AUTHORIZATION, header.clone());
    request
}
