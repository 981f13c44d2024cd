//! Data models shared between the API client and the session store.
//!
//! - `UserProfile`: the cached user snapshot shown before revalidation
//! - `AuthResponse`, `TokenResponse`: auth endpoint payloads
//! - `ErrorCode`, `ErrorResponse`: backend error bodies

pub mod auth;
pub mod user;

pub use auth::{AuthResponse, ErrorCode, ErrorResponse, TokenResponse};
pub use user::UserProfile;
