//! Authentication state for the QAdapt client.
//!
//! This module provides:
//! - `Credential`: the in-memory bearer token with its expiry
//! - `SessionRecord`: the durable refresh token, session id and user snapshot
//! - `SessionStore`: where the record lives (file, OS keychain, or memory)
//!
//! Only the session record survives a restart; the bearer credential is
//! always re-obtained from the refresh token.

pub mod credential;
pub mod keychain;
pub mod session;

pub use credential::{Credential, DEFAULT_EXPIRY_MARGIN_SECS};
pub use keychain::KeyringSessionStore;
pub use session::{FileSessionStore, MemorySessionStore, SessionRecord, SessionStore};
