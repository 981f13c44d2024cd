use anyhow::{Context, Result};
use keyring::Entry;

use super::{SessionRecord, SessionStore};

const SERVICE_NAME: &str = "qadapt";

/// Default keychain account holding the session record
const DEFAULT_ACCOUNT: &str = "session";

/// Session record stored in the OS keychain.
///
/// The whole record lives in a single entry as JSON, so clearing it removes
/// the refresh token, session id and user snapshot in one operation.
pub struct KeyringSessionStore {
    account: String,
}

impl KeyringSessionStore {
    pub fn new() -> Self {
        Self::for_account(DEFAULT_ACCOUNT)
    }

    /// Separate keychain account, e.g. one per API environment
    pub fn for_account(account: impl Into<String>) -> Self {
        Self {
            account: account.into(),
        }
    }

    fn entry(&self) -> Result<Entry> {
        Entry::new(SERVICE_NAME, &self.account).context("Failed to create keyring entry")
    }
}

impl Default for KeyringSessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore for KeyringSessionStore {
    fn load(&self) -> Result<Option<SessionRecord>> {
        let contents = match self.entry()?.get_password() {
            Ok(contents) => contents,
            Err(keyring::Error::NoEntry) => return Ok(None),
            Err(e) => return Err(e).context("Failed to read session from keychain"),
        };
        let record = serde_json::from_str(&contents).context("Failed to parse keychain session")?;
        Ok(Some(record))
    }

    fn save(&self, record: &SessionRecord) -> Result<()> {
        let contents = serde_json::to_string(record)?;
        self.entry()?
            .set_password(&contents)
            .context("Failed to store session in keychain")
    }

    fn clear(&self) -> Result<()> {
        match self.entry()?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e).context("Failed to delete session from keychain"),
        }
    }
}
