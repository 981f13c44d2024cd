use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use reqwest::header::HeaderValue;
use reqwest::{Client, Request};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::queue::{stamp, Installed, PendingRequest, Shared};
use super::GatewayError;
use crate::api::error::truncate_body;
use crate::auth::{Credential, SessionRecord, SessionStore, DEFAULT_EXPIRY_MARGIN_SECS};
use crate::models::{TokenResponse, UserProfile};

/// Upper bound on one refresh round-trip.
/// A stalled refresh holds up every queued request, so it has to give up.
const DEFAULT_REFRESH_TIMEOUT_SECS: u64 = 15;

#[derive(Debug, Clone)]
pub struct GatewayOptions {
    pub refresh_timeout: Duration,
    pub expiry_margin: chrono::Duration,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self {
            refresh_timeout: Duration::from_secs(DEFAULT_REFRESH_TIMEOUT_SECS),
            expiry_margin: chrono::Duration::seconds(DEFAULT_EXPIRY_MARGIN_SECS),
        }
    }
}

/// Externally visible session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayState {
    /// Credential present and unexpired
    Valid,
    /// Stored session exists but the credential is missing or expired
    Expired,
    /// A refresh is in flight
    Refreshing,
    /// No stored session
    LoggedOut,
}

/// Result of a successful call to the token endpoint
struct Refreshed {
    installed: Installed,
    refresh_token: String,
    record: SessionRecord,
}

enum Step {
    Ready(Request),
    Wait(oneshot::Receiver<Result<Request, GatewayError>>),
    Lead(Request, u64),
    Suppressed,
}

/// Authenticated request gateway.
///
/// Create one per application and share it behind an `Arc`. Every
/// authenticated request passes through [`Gateway::authorize`], which
/// stamps the bearer header and refreshes the credential when needed.
/// However many requests find the credential expired at once, only one
/// refresh call is made; the rest wait in a FIFO queue for its outcome.
pub struct Gateway {
    client: Client,
    token_url: String,
    store: Arc<dyn SessionStore>,
    options: GatewayOptions,
    shared: Mutex<Shared>,
}

impl Gateway {
    pub fn new(
        client: Client,
        base_url: &str,
        store: Arc<dyn SessionStore>,
        options: GatewayOptions,
    ) -> Self {
        Self {
            client,
            token_url: format!("{}/auth/token", base_url.trim_end_matches('/')),
            store,
            options,
            shared: Mutex::new(Shared::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        // Every critical section leaves Shared consistent, so a panic in
        // another thread doesn't invalidate it
        self.shared.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Stamp `request` with a valid bearer header, refreshing first if needed
    pub async fn authorize(&self, request: Request) -> Result<Request, GatewayError> {
        let step = {
            let mut shared = self.lock();
            if let Some(header) = shared.valid_header(self.options.expiry_margin) {
                Step::Ready(stamp(request, header))
            } else if shared.refreshing {
                let (reply, rx) = oneshot::channel();
                shared.queue.push_back(PendingRequest { request, reply });
                debug!(queued = shared.queue.len(), "Refresh in flight, queueing request");
                Step::Wait(rx)
            } else if shared.skip_next_refresh {
                shared.skip_next_refresh = false;
                Step::Suppressed
            } else {
                shared.refreshing = true;
                Step::Lead(request, shared.epoch)
            }
        };

        match step {
            Step::Ready(request) => Ok(request),
            Step::Wait(rx) => rx.await.unwrap_or(Err(GatewayError::Abandoned)),
            Step::Lead(request, epoch) => self.lead_refresh(request, epoch).await,
            Step::Suppressed => {
                debug!("Skipping refresh after connection failure");
                Err(GatewayError::RefreshSuppressed)
            }
        }
    }

    async fn lead_refresh(&self, request: Request, epoch: u64) -> Result<Request, GatewayError> {
        let mut guard = LeaderGuard {
            gateway: self,
            epoch,
            armed: true,
        };
        let outcome = self.refresh().await;
        guard.armed = false;

        let header = self.settle(outcome, epoch)?;
        Ok(stamp(request, &header))
    }

    /// Exchange the stored refresh token for a new credential
    async fn refresh(&self) -> Result<Refreshed, GatewayError> {
        let record = self.read_record();
        let Some((refresh_token, session_id)) = record.refresh_pair() else {
            info!("No stored session, treating as logged out");
            return Err(GatewayError::MissingSession);
        };

        info!("Refreshing access token");
        let exchange = self.exchange(refresh_token, session_id);
        let token = match tokio::time::timeout(self.options.refresh_timeout, exchange).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(GatewayError::ConnectionLost(format!(
                    "token refresh timed out after {}s",
                    self.options.refresh_timeout.as_secs_f32()
                )))
            }
        };

        let installed = Installed::new(Credential::new(token.access_token, token.expires_in))?;
        Ok(Refreshed {
            installed,
            refresh_token: token.refresh_token,
            record,
        })
    }

    async fn exchange(
        &self,
        refresh_token: &str,
        session_id: &str,
    ) -> Result<TokenResponse, GatewayError> {
        let response = self
            .client
            .post(&self.token_url)
            .form(&[("refresh_token", refresh_token), ("session_id", session_id)])
            .send()
            .await
            .map_err(|e| GatewayError::ConnectionLost(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| GatewayError::ConnectionLost(e.to_string()))?;

        if status.is_server_error() {
            return Err(GatewayError::ConnectionLost(format!(
                "token endpoint returned {}",
                status
            )));
        }
        if !status.is_success() {
            return Err(GatewayError::RefreshRejected(format!(
                "{}: {}",
                status,
                truncate_body(&body)
            )));
        }

        // The old refresh token is spent either way, so an unreadable
        // answer ends the session just like a rejection
        serde_json::from_str(&body).map_err(|e| {
            GatewayError::RefreshRejected(format!("invalid token response: {}", e))
        })
    }

    /// Apply the refresh outcome and release the queue
    fn settle(
        &self,
        outcome: Result<Refreshed, GatewayError>,
        epoch: u64,
    ) -> Result<HeaderValue, GatewayError> {
        let mut shared = self.lock();

        if shared.epoch != epoch {
            // Logout or a new login happened while we were refreshing
            return self.release_superseded(&mut shared);
        }

        match outcome {
            Ok(refreshed) => {
                let mut record = match self.read_record() {
                    record if record.is_active() => record,
                    _ => refreshed.record,
                };
                record.refresh_token = Some(refreshed.refresh_token);
                if let Err(e) = self.store.save(&record) {
                    warn!(error = %e, "Failed to persist rotated refresh token");
                }

                let header = refreshed.installed.header.clone();
                info!(
                    expires_in = refreshed.installed.credential.seconds_until_expiry(),
                    "Access token refreshed"
                );
                shared.installed = Some(refreshed.installed);
                let released = shared.resolve_all(&header);
                if released > 0 {
                    debug!(released, "Released queued requests");
                }
                shared.refreshing = false;
                Ok(header)
            }
            Err(error) => {
                shared.installed = None;
                if error.ends_session() {
                    warn!(error = %error, "Session ended, clearing stored session");
                    if let Err(e) = self.store.clear() {
                        warn!(error = %e, "Failed to clear stored session");
                    }
                } else {
                    warn!(error = %error, "Token refresh failed, keeping stored session");
                    shared.skip_next_refresh = true;
                }
                let rejected = shared.reject_all(&error);
                if rejected > 0 {
                    debug!(rejected, "Rejected queued requests");
                }
                shared.refreshing = false;
                Err(error)
            }
        }
    }

    /// Settle the queue of a refresh overtaken by logout or login: waiters
    /// get the newly installed credential, or `LoggedOut` if there is none
    fn release_superseded(&self, shared: &mut Shared) -> Result<HeaderValue, GatewayError> {
        let current = shared.valid_header(self.options.expiry_margin).cloned();
        let result = match current {
            Some(header) => {
                let released = shared.resolve_all(&header);
                debug!(released, "Refresh superseded by new login");
                Ok(header)
            }
            None => {
                let rejected = shared.reject_all(&GatewayError::LoggedOut);
                debug!(rejected, "Refresh superseded by logout");
                Err(GatewayError::LoggedOut)
            }
        };
        shared.refreshing = false;
        result
    }

    /// Install a freshly issued credential and session record (after login
    /// or signup). Supersedes any refresh still in flight.
    pub fn establish(&self, credential: Credential, record: SessionRecord) -> anyhow::Result<()> {
        let installed = Installed::new(credential)?;
        let mut shared = self.lock();
        shared.installed = Some(installed);
        shared.skip_next_refresh = false;
        shared.epoch += 1;
        self.store.save(&record)?;
        info!("Session established");
        Ok(())
    }

    /// Drop the credential and the stored session.
    ///
    /// A refresh still in flight is discarded when it returns and the
    /// requests queued behind it fail with `LoggedOut`.
    pub fn logout(&self) {
        let mut shared = self.lock();
        shared.installed = None;
        shared.skip_next_refresh = false;
        shared.epoch += 1;
        if let Err(e) = self.store.clear() {
            warn!(error = %e, "Failed to clear stored session");
        }
        info!("Logged out");
    }

    /// Manual retry from the connection-lost screen: allow refreshing again
    pub fn retry(&self) {
        self.lock().skip_next_refresh = false;
    }

    pub fn state(&self) -> GatewayState {
        let shared = self.lock();
        if shared.refreshing {
            GatewayState::Refreshing
        } else if shared.valid_header(self.options.expiry_margin).is_some() {
            GatewayState::Valid
        } else if self.read_record().is_active() {
            GatewayState::Expired
        } else {
            GatewayState::LoggedOut
        }
    }

    /// Seconds until the current credential expires, if one is installed
    pub fn credential_expires_in(&self) -> Option<i64> {
        self.lock()
            .installed
            .as_ref()
            .map(|installed| installed.credential.seconds_until_expiry())
    }

    /// Whether a refresh token and session id are stored
    pub fn has_session(&self) -> bool {
        self.read_record().is_active()
    }

    /// Last-known user profile from the stored session
    pub fn cached_user(&self) -> Option<UserProfile> {
        self.read_record().user
    }

    /// Replace the user snapshot. Ignored when logged out.
    pub fn update_user(&self, user: UserProfile) -> anyhow::Result<()> {
        let _shared = self.lock();
        let mut record = self.read_record();
        if !record.is_active() {
            debug!("Not logged in, dropping user snapshot");
            return Ok(());
        }
        record.user = Some(user);
        self.store.save(&record)
    }

    /// Read the stored record; anything unreadable counts as logged out
    fn read_record(&self) -> SessionRecord {
        match self.store.load() {
            Ok(record) => record.unwrap_or_default(),
            Err(e) => {
                warn!(error = %e, "Unreadable session record, treating as logged out");
                SessionRecord::default()
            }
        }
    }
}

/// Keeps a cancelled leader from leaving the gateway stuck in Refreshing
struct LeaderGuard<'a> {
    gateway: &'a Gateway,
    epoch: u64,
    armed: bool,
}

impl Drop for LeaderGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut shared = self.gateway.lock();
        if shared.epoch != self.epoch {
            let _ = self.gateway.release_superseded(&mut shared);
            return;
        }
        let rejected = shared.reject_all(&GatewayError::Abandoned);
        shared.refreshing = false;
        warn!(rejected, "Refresh cancelled before completion");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::MemorySessionStore;
    use crate::gateway::Redirect;
    use chrono::Utc;
    use futures::future::join_all;
    use reqwest::header::AUTHORIZATION;
    use wiremock::matchers::{any, body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn user() -> UserProfile {
        UserProfile {
            user_id: "5".to_string(),
            username: "frank".to_string(),
            full_name: Some("Frank".to_string()),
            email: None,
            avatar_url: None,
        }
    }

    fn stored_session() -> SessionRecord {
        SessionRecord::new("rt-0".to_string(), "sess-1".to_string(), Some(user()))
    }

    fn expired() -> Credential {
        Credential::issued_at("at-0", 60, Utc::now() - chrono::Duration::seconds(600))
    }

    fn token_body(access_token: &str, refresh_token: &str) -> serde_json::Value {
        serde_json::json!({
            "access_token": access_token,
            "expires_in": 900,
            "refresh_token": refresh_token
        })
    }

    fn options() -> GatewayOptions {
        GatewayOptions {
            refresh_timeout: Duration::from_secs(5),
            ..GatewayOptions::default()
        }
    }

    fn setup_with(
        server: &MockServer,
        record: Option<SessionRecord>,
        options: GatewayOptions,
    ) -> (Arc<MemorySessionStore>, Arc<Gateway>) {
        let store = Arc::new(match record {
            Some(record) => MemorySessionStore::with_record(record),
            None => MemorySessionStore::new(),
        });
        let gateway = Gateway::new(Client::new(), &server.uri(), store.clone(), options);
        (store, Arc::new(gateway))
    }

    fn get(server: &MockServer, route: &str) -> Request {
        Client::new()
            .get(format!("{}{}", server.uri(), route))
            .build()
            .unwrap()
    }

    fn bearer(request: &Request) -> Option<&str> {
        request
            .headers()
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
    }

    async fn refresh_calls(server: &MockServer) -> usize {
        server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .filter(|r| r.url.path() == "/auth/token")
            .count()
    }

    #[tokio::test]
    async fn valid_credential_passes_through_without_refresh() {
        let server = MockServer::start().await;
        Mock::given(any())
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;
        let (_store, gateway) = setup_with(&server, None, options());
        gateway
            .establish(Credential::new("at-live", 900), stored_session())
            .unwrap();

        let requests = (0..5).map(|i| gateway.authorize(get(&server, &format!("/api/scripts/{}", i))));
        let results = join_all(requests).await;

        for (i, result) in results.into_iter().enumerate() {
            let request = result.unwrap();
            assert_eq!(bearer(&request), Some("Bearer at-live"));
            assert_eq!(request.url().path(), format!("/api/scripts/{}", i));
        }
        assert_eq!(gateway.state(), GatewayState::Valid);
    }

    #[tokio::test]
    async fn concurrent_expiry_triggers_exactly_one_refresh() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/token"))
            .and(header("content-type", "application/x-www-form-urlencoded"))
            .and(body_string_contains("refresh_token=rt-0"))
            .and(body_string_contains("session_id=sess-1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(token_body("at-1", "rt-1"))
                    .set_delay(Duration::from_millis(100)),
            )
            .expect(1)
            .mount(&server)
            .await;
        let (store, gateway) = setup_with(&server, None, options());
        gateway.establish(expired(), stored_session()).unwrap();
        assert_eq!(gateway.state(), GatewayState::Expired);

        let requests = (0..5).map(|_| gateway.authorize(get(&server, "/api/tests")));
        let results = join_all(requests).await;

        for result in results {
            assert_eq!(bearer(&result.unwrap()), Some("Bearer at-1"));
        }
        assert_eq!(refresh_calls(&server).await, 1);
        assert_eq!(gateway.state(), GatewayState::Valid);

        let record = store.load().unwrap().unwrap();
        assert_eq!(record.refresh_token.as_deref(), Some("rt-1"));
        assert_eq!(record.session_id.as_deref(), Some("sess-1"));
        assert_eq!(record.user, Some(user()));
    }

    #[tokio::test]
    async fn queued_requests_resume_in_submission_order() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(token_body("at-1", "rt-1"))
                    .set_delay(Duration::from_millis(200)),
            )
            .expect(1)
            .mount(&server)
            .await;
        let (_store, gateway) = setup_with(&server, Some(stored_session()), options());

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..5 {
            let gateway = gateway.clone();
            let order = order.clone();
            let request = get(&server, &format!("/api/collections/{}", i));
            handles.push(tokio::spawn(async move {
                let result = gateway.authorize(request).await;
                order.lock().unwrap().push(i);
                result
            }));
        }

        for handle in handles {
            let request = handle.await.unwrap().unwrap();
            assert_eq!(bearer(&request), Some("Bearer at-1"));
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn rejected_refresh_fails_everyone_and_clears_session() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/token"))
            .respond_with(
                ResponseTemplate::new(401)
                    .set_body_json(serde_json::json!({"detail": {"message": "Invalid refresh token", "code": 1600}}))
                    .set_delay(Duration::from_millis(100)),
            )
            .expect(1)
            .mount(&server)
            .await;
        let (store, gateway) = setup_with(&server, None, options());
        gateway.establish(expired(), stored_session()).unwrap();

        let requests = (0..5).map(|_| gateway.authorize(get(&server, "/api/tests")));
        let results = join_all(requests).await;

        for result in results {
            let err = result.unwrap_err();
            assert!(matches!(err, GatewayError::RefreshRejected(ref msg) if msg.contains("401")));
            assert_eq!(err.redirect(), Some(Redirect::Login));
        }
        assert_eq!(store.load().unwrap(), None);
        assert_eq!(gateway.state(), GatewayState::LoggedOut);
        assert_eq!(gateway.cached_user(), None);
    }

    #[tokio::test]
    async fn unparseable_token_response_is_a_rejection() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/token"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
            .mount(&server)
            .await;
        let (store, gateway) = setup_with(&server, Some(stored_session()), options());

        let err = gateway.authorize(get(&server, "/api/tests")).await.unwrap_err();
        assert!(matches!(err, GatewayError::RefreshRejected(_)));
        assert_eq!(store.load().unwrap(), None);
    }

    #[tokio::test]
    async fn stalled_refresh_times_out_and_keeps_session() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(token_body("at-late", "rt-late"))
                    .set_delay(Duration::from_secs(3)),
            )
            .mount(&server)
            .await;
        let short_timeout = GatewayOptions {
            refresh_timeout: Duration::from_millis(150),
            ..GatewayOptions::default()
        };
        let (store, gateway) = setup_with(&server, Some(stored_session()), short_timeout);

        let requests = (0..5).map(|_| gateway.authorize(get(&server, "/api/tests")));
        let results = join_all(requests).await;

        for result in results {
            let err = result.unwrap_err();
            assert!(matches!(err, GatewayError::ConnectionLost(ref msg) if msg.contains("timed out")));
            assert_eq!(err.redirect(), Some(Redirect::ConnectionLost));
        }
        assert_eq!(refresh_calls(&server).await, 1);
        assert_eq!(store.load().unwrap(), Some(stored_session()));
        assert_eq!(gateway.state(), GatewayState::Expired);
    }

    #[tokio::test]
    async fn server_error_counts_as_connection_loss() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/token"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        let (store, gateway) = setup_with(&server, Some(stored_session()), options());

        let err = gateway.authorize(get(&server, "/api/tests")).await.unwrap_err();
        assert!(matches!(err, GatewayError::ConnectionLost(_)));
        assert_eq!(store.load().unwrap(), Some(stored_session()));
    }

    #[tokio::test]
    async fn unreachable_server_sets_one_shot_latch() {
        // Grab a free port and close it again so connections are refused
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let store = Arc::new(MemorySessionStore::with_record(stored_session()));
        let gateway = Gateway::new(
            Client::new(),
            &format!("http://{}", addr),
            store.clone(),
            options(),
        );
        let request = || Client::new().get(format!("http://{}/api/users/me", addr)).build().unwrap();

        let err = gateway.authorize(request()).await.unwrap_err();
        assert!(matches!(err, GatewayError::ConnectionLost(_)));
        assert_eq!(err.redirect(), Some(Redirect::ConnectionLost));
        assert_eq!(store.load().unwrap(), Some(stored_session()));

        // The connection-lost screen's own call is not bounced again
        let err = gateway.authorize(request()).await.unwrap_err();
        assert_eq!(err, GatewayError::RefreshSuppressed);
        assert_eq!(err.redirect(), None);

        // The latch is one-shot: the following call tries again
        let err = gateway.authorize(request()).await.unwrap_err();
        assert!(matches!(err, GatewayError::ConnectionLost(_)));
    }

    #[tokio::test]
    async fn retry_rearms_refresh_after_connection_loss() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/token"))
            .respond_with(ResponseTemplate::new(502))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/auth/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body("at-back", "rt-back")))
            .mount(&server)
            .await;
        let (store, gateway) = setup_with(&server, Some(stored_session()), options());

        let err = gateway.authorize(get(&server, "/api/tests")).await.unwrap_err();
        assert!(matches!(err, GatewayError::ConnectionLost(_)));

        gateway.retry();
        let request = gateway.authorize(get(&server, "/api/tests")).await.unwrap();
        assert_eq!(bearer(&request), Some("Bearer at-back"));
        assert_eq!(refresh_calls(&server).await, 2);
        assert_eq!(
            store.load().unwrap().unwrap().refresh_token.as_deref(),
            Some("rt-back")
        );
    }

    #[tokio::test]
    async fn missing_session_logs_out_without_network_call() {
        let server = MockServer::start().await;
        Mock::given(any())
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;
        let (_store, gateway) = setup_with(&server, None, options());
        assert_eq!(gateway.state(), GatewayState::LoggedOut);

        let err = gateway.authorize(get(&server, "/api/users/me")).await.unwrap_err();
        assert_eq!(err, GatewayError::MissingSession);
        assert_eq!(err.redirect(), Some(Redirect::Login));
        assert_eq!(gateway.state(), GatewayState::LoggedOut);
    }

    #[tokio::test]
    async fn partial_session_record_is_cleared() {
        let server = MockServer::start().await;
        Mock::given(any())
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;
        let partial = SessionRecord {
            refresh_token: Some("rt-0".to_string()),
            session_id: None,
            user: Some(user()),
        };
        let (store, gateway) = setup_with(&server, Some(partial), options());

        let err = gateway.authorize(get(&server, "/api/tests")).await.unwrap_err();
        assert_eq!(err, GatewayError::MissingSession);
        assert_eq!(store.load().unwrap(), None);
    }

    #[tokio::test]
    async fn corrupt_session_file_reads_as_logged_out() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(crate::auth::FileSessionStore::new(dir.path().to_path_buf()));
        std::fs::write(store.path(), "\u{0}garbage").unwrap();
        let gateway = Gateway::new(Client::new(), &server.uri(), store.clone(), options());

        assert_eq!(gateway.state(), GatewayState::LoggedOut);
        let err = gateway.authorize(get(&server, "/api/tests")).await.unwrap_err();
        assert_eq!(err, GatewayError::MissingSession);
        assert!(!store.path().exists());
    }

    #[tokio::test]
    async fn refresh_token_rotates_on_every_refresh() {
        let server = MockServer::start().await;
        // A zero lifetime forces the next call to refresh again
        Mock::given(method("POST"))
            .and(path("/auth/token"))
            .and(body_string_contains("refresh_token=rt-0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "at-1", "expires_in": 0, "refresh_token": "rt-1"
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/auth/token"))
            .and(body_string_contains("refresh_token=rt-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body("at-2", "rt-2")))
            .expect(1)
            .mount(&server)
            .await;
        // The spent token is refused from here on
        Mock::given(method("POST"))
            .and(path("/auth/token"))
            .and(body_string_contains("refresh_token=rt-0"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        let (store, gateway) = setup_with(&server, Some(stored_session()), options());

        let first = gateway.authorize(get(&server, "/api/tests")).await.unwrap();
        assert_eq!(bearer(&first), Some("Bearer at-1"));
        assert_eq!(
            store.load().unwrap().unwrap().refresh_token.as_deref(),
            Some("rt-1")
        );

        let second = gateway.authorize(get(&server, "/api/tests")).await.unwrap();
        assert_eq!(bearer(&second), Some("Bearer at-2"));
        assert_eq!(
            store.load().unwrap().unwrap().refresh_token.as_deref(),
            Some("rt-2")
        );
    }

    #[tokio::test]
    async fn logout_during_refresh_discards_result() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(token_body("at-1", "rt-1"))
                    .set_delay(Duration::from_millis(300)),
            )
            .mount(&server)
            .await;
        let (store, gateway) = setup_with(&server, Some(stored_session()), options());

        let (leader, waiter, _) = tokio::join!(
            gateway.authorize(get(&server, "/api/tests")),
            gateway.authorize(get(&server, "/api/scripts")),
            async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                gateway.logout();
            }
        );

        assert_eq!(leader.unwrap_err(), GatewayError::LoggedOut);
        assert_eq!(waiter.unwrap_err(), GatewayError::LoggedOut);
        assert_eq!(store.load().unwrap(), None);
        assert_eq!(gateway.state(), GatewayState::LoggedOut);
    }

    #[tokio::test]
    async fn login_during_refresh_supersedes_it() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(token_body("at-stale", "rt-stale"))
                    .set_delay(Duration::from_millis(300)),
            )
            .mount(&server)
            .await;
        let (store, gateway) = setup_with(&server, Some(stored_session()), options());
        let fresh = SessionRecord::new("rt-login".to_string(), "sess-2".to_string(), Some(user()));

        let (leader, waiter, _) = tokio::join!(
            gateway.authorize(get(&server, "/api/tests")),
            gateway.authorize(get(&server, "/api/scripts")),
            async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                gateway
                    .establish(Credential::new("at-login", 900), fresh.clone())
                    .unwrap();
            }
        );

        assert_eq!(bearer(&leader.unwrap()), Some("Bearer at-login"));
        assert_eq!(bearer(&waiter.unwrap()), Some("Bearer at-login"));
        assert_eq!(store.load().unwrap(), Some(fresh));
    }

    #[tokio::test]
    async fn dropped_leader_does_not_wedge_gateway() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(token_body("at-slow", "rt-slow"))
                    .set_delay(Duration::from_secs(3)),
            )
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/auth/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body("at-fast", "rt-fast")))
            .mount(&server)
            .await;
        let (_store, gateway) = setup_with(&server, Some(stored_session()), options());

        let (leader, waiter) = tokio::join!(
            tokio::time::timeout(
                Duration::from_millis(100),
                gateway.authorize(get(&server, "/api/tests"))
            ),
            gateway.authorize(get(&server, "/api/scripts")),
        );

        assert!(leader.is_err(), "leader should have been cancelled");
        assert_eq!(waiter.unwrap_err(), GatewayError::Abandoned);
        assert_ne!(gateway.state(), GatewayState::Refreshing);

        let request = gateway.authorize(get(&server, "/api/tests")).await.unwrap();
        assert_eq!(bearer(&request), Some("Bearer at-fast"));
    }

    #[tokio::test]
    async fn dropped_leader_after_login_releases_waiters() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(token_body("at-slow", "rt-slow"))
                    .set_delay(Duration::from_secs(3)),
            )
            .mount(&server)
            .await;
        let (store, gateway) = setup_with(&server, Some(stored_session()), options());
        let fresh = SessionRecord::new("rt-login".to_string(), "sess-2".to_string(), Some(user()));

        let (leader, waiter, _) = tokio::join!(
            tokio::time::timeout(
                Duration::from_millis(150),
                gateway.authorize(get(&server, "/api/tests"))
            ),
            gateway.authorize(get(&server, "/api/scripts")),
            async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                gateway
                    .establish(Credential::new("at-login", 900), fresh.clone())
                    .unwrap();
            }
        );

        assert!(leader.is_err(), "leader should have been cancelled");
        assert_eq!(bearer(&waiter.unwrap()), Some("Bearer at-login"));
        assert_eq!(gateway.state(), GatewayState::Valid);
        assert_eq!(store.load().unwrap(), Some(fresh));
    }

    #[tokio::test]
    async fn short_lived_token_is_reused_within_its_lifetime() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "at-short", "expires_in": 20, "refresh_token": "rt-1"
            })))
            .expect(1)
            .mount(&server)
            .await;
        let (_store, gateway) = setup_with(&server, Some(stored_session()), options());

        // Lifetime below the 30s default margin still serves several calls
        for _ in 0..3 {
            let request = gateway.authorize(get(&server, "/api/tests")).await.unwrap();
            assert_eq!(bearer(&request), Some("Bearer at-short"));
        }
        assert_eq!(refresh_calls(&server).await, 1);
    }

    #[tokio::test]
    async fn update_user_only_when_logged_in() {
        let server = MockServer::start().await;
        let (store, gateway) = setup_with(&server, None, options());

        gateway.update_user(user()).unwrap();
        assert_eq!(store.load().unwrap(), None);

        gateway
            .establish(
                Credential::new("at", 900),
                SessionRecord::new("rt".to_string(), "sess".to_string(), None),
            )
            .unwrap();
        gateway.update_user(user()).unwrap();
        assert_eq!(gateway.cached_user(), Some(user()));
        assert!(gateway.has_session());
        assert!(gateway.credential_expires_in().unwrap() > 0);
    }
}
