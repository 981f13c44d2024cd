use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::models::UserProfile;

/// Session file name in cache directory
const SESSION_FILE: &str = "session.json";

/// Durable half of a login: what survives a restart.
///
/// The refresh token and session id together are the claim to an active
/// session. The user snapshot is only used for display.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub user: Option<UserProfile>,
}

impl SessionRecord {
    pub fn new(refresh_token: String, session_id: String, user: Option<UserProfile>) -> Self {
        Self {
            refresh_token: Some(refresh_token),
            session_id: Some(session_id),
            user,
        }
    }

    /// Refresh token and session id, if both are present and non-empty
    pub fn refresh_pair(&self) -> Option<(&str, &str)> {
        let refresh_token = self.refresh_token.as_deref().filter(|s| !s.is_empty())?;
        let session_id = self.session_id.as_deref().filter(|s| !s.is_empty())?;
        Some((refresh_token, session_id))
    }

    pub fn is_active(&self) -> bool {
        self.refresh_pair().is_some()
    }
}

/// Durable key-value storage for the session record.
///
/// `clear` must remove refresh token, session id and user snapshot together.
pub trait SessionStore: Send + Sync {
    /// Load the stored record. `Ok(None)` when nothing is stored.
    fn load(&self) -> Result<Option<SessionRecord>>;

    /// Replace the stored record
    fn save(&self, record: &SessionRecord) -> Result<()>;

    /// Remove the stored record
    fn clear(&self) -> Result<()>;
}

/// Session record persisted as JSON in the cache directory
pub struct FileSessionStore {
    cache_dir: PathBuf,
}

impl FileSessionStore {
    pub fn new(cache_dir: PathBuf) -> Self {
        Self { cache_dir }
    }

    pub fn path(&self) -> PathBuf {
        self.cache_dir.join(SESSION_FILE)
    }
}

impl SessionStore for FileSessionStore {
    fn load(&self) -> Result<Option<SessionRecord>> {
        let path = self.path();
        if !path.exists() {
            return Ok(None);
        }

        let contents = std::fs::read_to_string(&path).context("Failed to read session file")?;
        let record: SessionRecord =
            serde_json::from_str(&contents).context("Failed to parse session file")?;
        Ok(Some(record))
    }

    fn save(&self, record: &SessionRecord) -> Result<()> {
        std::fs::create_dir_all(&self.cache_dir).context("Failed to create cache directory")?;

        // Write to a sibling file and rename so a crash never leaves a
        // half-written record behind.
        let path = self.path();
        let tmp = path.with_extension("json.tmp");
        let contents = serde_json::to_string_pretty(record)?;
        std::fs::write(&tmp, contents).context("Failed to write session file")?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))?;
        }

        std::fs::rename(&tmp, &path).context("Failed to replace session file")?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let path = self.path();
        if path.exists() {
            std::fs::remove_file(path).context("Failed to remove session file")?;
        }
        Ok(())
    }
}

/// Session record kept only for the lifetime of the process
#[derive(Default)]
pub struct MemorySessionStore {
    record: Mutex<Option<SessionRecord>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_record(record: SessionRecord) -> Self {
        Self {
            record: Mutex::new(Some(record)),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<SessionRecord>> {
        // A poisoned lock still holds a coherent Option
        self.record.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl SessionStore for MemorySessionStore {
    fn load(&self) -> Result<Option<SessionRecord>> {
        Ok(self.lock().clone())
    }

    fn save(&self, record: &SessionRecord) -> Result<()> {
        *self.lock() = Some(record.clone());
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        *self.lock() = None;
        Ok(())
    }
}
