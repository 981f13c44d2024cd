//! Application shell for the QAdapt CLI.
//!
//! Owns the configuration and the single `ApiClient`/gateway pair, runs one
//! command, and decides where to send the user when the gateway reports
//! that the session has ended or the server is unreachable.

use std::io::{self, Write};

use anyhow::Result;
use tracing::{debug, warn};

use qadapt_core::{ApiClient, Config, GatewayError, GatewayState, Redirect};

use crate::commands::{Command, USAGE};

/// Maximum length for username input.
const MAX_USERNAME_LENGTH: usize = 50;

/// Minimum password length accepted at signup
const MIN_PASSWORD_LENGTH: usize = 8;

pub struct App {
    config: Config,
    api: ApiClient,
}

impl App {
    pub fn new() -> Result<Self> {
        let mut config = Config::load().unwrap_or_else(|e| {
            warn!(error = %e, "Failed to load config, using defaults");
            Config::default()
        });
        config.apply_env();

        let store = config.session_store()?;
        let api = ApiClient::new(config.api_base_url(), store, config.gateway_options())?;
        debug!(base_url = %api.base_url(), store = ?config.session_store, "Client ready");

        Ok(Self { config, api })
    }

    pub async fn run(&mut self, command: Command) -> Result<()> {
        match command {
            Command::Login { username } => self.login(username).await,
            Command::Signup => self.signup().await,
            Command::Logout => self.logout().await,
            Command::Whoami => self.whoami().await,
            Command::Status => {
                self.status();
                Ok(())
            }
            Command::Retry => self.retry().await,
            Command::Get { path } => {
                let value: serde_json::Value = self.api.get_json(&path).await?;
                print_json(&value)
            }
            Command::Delete { path } => {
                self.api.delete(&path).await?;
                println!("Deleted {}", path);
                Ok(())
            }
            Command::Post { path, body } => {
                let value: serde_json::Value = self.api.post_json(&path, &body).await?;
                print_json(&value)
            }
            Command::Put { path, body } => {
                let value: serde_json::Value = self.api.put_json(&path, &body).await?;
                print_json(&value)
            }
            Command::Help => {
                println!("{}", USAGE);
                Ok(())
            }
        }
    }

    // =========================================================================
    // Session
    // =========================================================================

    async fn login(&mut self, username: Option<String>) -> Result<()> {
        let username = match username.or_else(|| self.config.last_username.clone()) {
            Some(name) => name,
            None => prompt_username()?,
        };
        validate_username(&username)?;
        let password = prompt_password("Password: ")?;

        println!("Authenticating...");
        let user = self.api.login(&username, &password).await?;
        self.remember_username(&username);

        println!("Logged in as {}", user.display_name());
        Ok(())
    }

    async fn signup(&mut self) -> Result<()> {
        let username = prompt_username()?;
        validate_username(&username)?;
        let email = prompt_line("Email: ")?;
        if !email.contains('@') {
            anyhow::bail!("Please enter a valid email address");
        }

        let password = prompt_password("Password: ")?;
        if password.chars().count() < MIN_PASSWORD_LENGTH {
            anyhow::bail!("Password must be at least {} characters", MIN_PASSWORD_LENGTH);
        }
        if prompt_password("Confirm password: ")? != password {
            anyhow::bail!("Passwords do not match");
        }

        let user = self.api.signup(&username, &email, &password).await?;
        self.remember_username(&username);

        println!("Account created. Logged in as {}", user.display_name());
        Ok(())
    }

    async fn logout(&self) -> Result<()> {
        self.api.logout().await?;
        println!("Logged out");
        Ok(())
    }

    async fn whoami(&self) -> Result<()> {
        // Show the snapshot right away, then revalidate against the server
        if let Some(cached) = self.api.gateway().cached_user() {
            println!("{} (cached)", cached.display_name());
        }

        // A revoked session is cleared by the client and reported as LoggedOut
        let user = self.api.current_user().await?;
        println!(
            "Logged in as {} <{}>",
            user.username,
            user.email.as_deref().unwrap_or("no email")
        );
        Ok(())
    }

    fn status(&self) {
        let gateway = self.api.gateway();
        println!("Server:  {}", self.api.base_url());
        println!("Store:   {:?}", self.config.session_store);
        println!("Session: {}", state_label(gateway.state()));
        if let Some(user) = gateway.cached_user() {
            println!("User:    {}", user.display_name());
        }
        if let Some(secs) = gateway.credential_expires_in() {
            println!("Token:   expires in {}s", secs);
        }
    }

    async fn retry(&self) -> Result<()> {
        self.api.gateway().retry();
        let user = self.api.current_user().await?;
        println!("Connection restored. Logged in as {}", user.display_name());
        Ok(())
    }

    fn remember_username(&mut self, username: &str) {
        self.config.last_username = Some(username.to_string());
        if let Err(e) = self.config.save() {
            warn!(error = %e, "Failed to save config");
        }
    }
}

/// What to tell the user after a failed command.
///
/// Gateway failures become navigation: back to login, or the
/// connection-lost screen with a manual retry.
pub fn failure_message(err: &anyhow::Error) -> String {
    let redirect = err
        .downcast_ref::<GatewayError>()
        .map(|gateway_err| (gateway_err, gateway_err.redirect()));

    match redirect {
        Some((_, Some(Redirect::Login))) => {
            "Your session has ended. Run `qadapt login` to sign in again.".to_string()
        }
        Some((_, Some(Redirect::ConnectionLost))) => "\
Unable to connect to the QAdapt server.
Check your internet connection, then run `qadapt retry`."
            .to_string(),
        Some((GatewayError::RefreshSuppressed, None)) => {
            "Still offline. Run `qadapt retry` once your connection is back.".to_string()
        }
        _ => format!("Error: {:#}", err),
    }
}

fn state_label(state: GatewayState) -> &'static str {
    match state {
        GatewayState::Valid => "active",
        GatewayState::Expired => "active (token will be refreshed on next request)",
        GatewayState::Refreshing => "refreshing",
        GatewayState::LoggedOut => "logged out",
    }
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    if !value.is_null() {
        println!("{}", serde_json::to_string_pretty(value)?);
    }
    Ok(())
}

/// Usernames must be non-empty, bounded, and free of control characters
fn validate_username(username: &str) -> Result<()> {
    if username.is_empty() {
        anyhow::bail!("Username required");
    }
    if username.chars().count() > MAX_USERNAME_LENGTH {
        anyhow::bail!("Username must be at most {} characters", MAX_USERNAME_LENGTH);
    }
    if username.chars().any(char::is_control) {
        anyhow::bail!("Username contains invalid characters");
    }
    Ok(())
}

fn prompt_line(label: &str) -> Result<String> {
    print!("{}", label);
    io::stdout().flush()?;

    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

fn prompt_username() -> Result<String> {
    prompt_line("Username: ")
}

fn prompt_password(label: &str) -> Result<String> {
    let password = rpassword::prompt_password(label)?;
    Ok(password)
}
