//! API client for communicating with the QAdapt REST API.
//!
//! This module provides the `ApiClient` struct for logging in, signing up,
//! logging out and making authenticated JSON requests. Authenticated
//! requests are routed through the shared [`Gateway`], which keeps the
//! bearer credential fresh.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::{header, Client, Method, Request, Response};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info, warn};

use crate::auth::{Credential, SessionRecord, SessionStore};
use crate::gateway::{Gateway, GatewayError, GatewayOptions};
use crate::models::{AuthResponse, UserProfile};

use super::ApiError;

// ============================================================================
// Constants
// ============================================================================

/// HTTP request timeout in seconds.
/// 30s allows for slow API responses while failing fast enough for good UX.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Maximum number of retries for rate-limited (429) requests.
/// 3 retries with exponential backoff usually succeeds without excessive delay.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

/// Profile endpoint used to revalidate the cached user snapshot
const CURRENT_USER_PATH: &str = "api/users/me";

/// API client for QAdapt.
/// Clone is cheap - reqwest::Client and the gateway are both shared.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    gateway: Arc<Gateway>,
    initial_backoff: Duration,
}

impl ApiClient {
    /// Create a client and the single gateway it routes requests through
    pub fn new(base_url: &str, store: Arc<dyn SessionStore>, options: GatewayOptions) -> Result<Self> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::ACCEPT,
            header::HeaderValue::from_static("application/json"),
        );
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .default_headers(headers)
            .build()
            .context("Failed to build HTTP client")?;

        let gateway = Arc::new(Gateway::new(client.clone(), base_url, store, options));
        Ok(Self::with_gateway(client, base_url, gateway))
    }

    /// Create a client around an existing gateway, sharing its session
    pub fn with_gateway(client: Client, base_url: &str, gateway: Arc<Gateway>) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            gateway,
            initial_backoff: Duration::from_millis(INITIAL_BACKOFF_MS),
        }
    }

    /// Override the rate-limit backoff (tests use a few milliseconds)
    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    // ===== Session =====

    /// Log in and establish a session
    pub async fn login(&self, username: &str, password: &str) -> Result<UserProfile> {
        self.authenticate("auth/login", &[("username", username), ("password", password)])
            .await
            .context("Login failed")
    }

    /// Create an account and establish a session
    pub async fn signup(&self, username: &str, email: &str, password: &str) -> Result<UserProfile> {
        self.authenticate(
            "auth/signup",
            &[("username", username), ("email", email), ("password", password)],
        )
        .await
        .context("Signup failed")
    }

    async fn authenticate(&self, path: &str, form: &[(&str, &str)]) -> Result<UserProfile> {
        let response = self
            .client
            .post(self.url(path))
            .form(form)
            .send()
            .await
            .context("Failed to send authentication request")?;

        let response = Self::check_response(response).await?;
        let auth: AuthResponse = response
            .json()
            .await
            .context("Failed to parse auth response")?;

        let user = auth.user.clone();
        self.gateway.establish(
            Credential::new(auth.access_token, auth.expires_in),
            SessionRecord::new(auth.refresh_token, auth.session_id, Some(auth.user)),
        )?;

        info!(username = %user.username, "Authenticated");
        Ok(user)
    }

    /// End the session on the server, then locally.
    /// Local state is cleared even when the server call fails.
    pub async fn logout(&self) -> Result<()> {
        let request = self.client.post(self.url("auth/logout")).build()?;
        match self.send(request).await {
            Ok(_) => debug!("Server-side session ended"),
            Err(e) => warn!(error = %e, "Server-side logout failed, clearing local session anyway"),
        }
        self.gateway.logout();
        Ok(())
    }

    /// Fetch the logged-in user's profile and refresh the cached snapshot.
    ///
    /// If the server refuses a freshly authorized request, the session was
    /// revoked server-side and the local session is cleared.
    pub async fn current_user(&self) -> Result<UserProfile> {
        let user: UserProfile = match self.get_json(CURRENT_USER_PATH).await {
            Ok(user) => user,
            Err(e) if e.downcast_ref::<ApiError>().is_some_and(ApiError::is_unauthorized) => {
                info!(error = %e, "Server no longer accepts this session");
                self.gateway.logout();
                return Err(GatewayError::LoggedOut).context("Session revoked by server");
            }
            Err(e) => return Err(e),
        };
        if let Err(e) = self.gateway.update_user(user.clone()) {
            warn!(error = %e, "Failed to cache user profile");
        }
        Ok(user)
    }

    // ===== Authenticated requests =====

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let request = self.client.get(self.url(path)).build()?;
        self.send_json(request).await
    }

    pub async fn post_json<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let request = self.client.post(self.url(path)).json(body).build()?;
        self.send_json(request).await
    }

    pub async fn put_json<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let request = self.client.put(self.url(path)).json(body).build()?;
        self.send_json(request).await
    }

    pub async fn delete(&self, path: &str) -> Result<()> {
        let request = self.client.request(Method::DELETE, self.url(path)).build()?;
        self.send(request).await?;
        Ok(())
    }

    async fn send_json<T: DeserializeOwned>(&self, request: Request) -> Result<T> {
        let url = request.url().to_string();
        let response = self.send(request).await?;
        let text = response
            .text()
            .await
            .with_context(|| format!("Failed to read response body from {}", url))?;

        // 204 and friends: let `Value`/`Option` targets see null
        let text = if text.trim().is_empty() { "null" } else { text.as_str() };
        serde_json::from_str(text).with_context(|| format!("Failed to parse JSON response from {}", url))
    }

    /// Authorize through the gateway and send, backing off on 429
    async fn send(&self, request: Request) -> Result<Response> {
        let mut retries = 0;
        let mut backoff = self.initial_backoff;

        loop {
            let attempt = request
                .try_clone()
                .ok_or_else(|| anyhow::anyhow!("Request body cannot be retried"))?;
            let attempt = self.gateway.authorize(attempt).await?;
            let url = attempt.url().to_string();

            let response = self
                .client
                .execute(attempt)
                .await
                .with_context(|| format!("Failed to send {} request to {}", request.method(), url))?;

            match Self::check_response_for_retry(response).await? {
                Some(response) => return Ok(response),
                None => {
                    // Rate limited
                    retries += 1;
                    if retries > MAX_RATE_LIMIT_RETRIES {
                        return Err(ApiError::RateLimited.into());
                    }
                    warn!(url = %url, retry = retries, backoff_ms = backoff.as_millis() as u64, "Rate limited, backing off");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2; // Exponential backoff
                }
            }
        }
    }

    /// Check if response is successful, returning an error with body if not.
    /// Returns Ok(Some(response)) for success, Ok(None) for rate limit (should retry),
    /// or Err for other errors.
    async fn check_response_for_retry(response: Response) -> Result<Option<Response>> {
        if response.status().is_success() {
            Ok(Some(response))
        } else if response.status().as_u16() == 429 {
            Ok(None)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body).into())
        }
    }

    /// Check if response is successful, returning an error with body if not.
    async fn check_response(response: Response) -> Result<Response> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body).into())
        }
    }
}
