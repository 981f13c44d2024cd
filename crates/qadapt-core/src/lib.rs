//! Core library for the QAdapt dashboard client.
//!
//! This crate provides:
//! - `auth`: bearer credentials and the durable session record stores
//! - `gateway`: the authenticated request gateway that refreshes expiring
//!   credentials and queues concurrent requests while a refresh is in flight
//! - `api`: the REST client for login, signup, logout and authenticated calls
//! - `models`: user profile and auth wire types
//! - `config`: application configuration

pub mod api;
pub mod auth;
pub mod config;
pub mod gateway;
pub mod models;

pub use api::{ApiClient, ApiError};
pub use auth::{Credential, SessionRecord, SessionStore};
pub use config::Config;
pub use gateway::{Gateway, GatewayError, GatewayOptions, GatewayState, Redirect};
pub use models::UserProfile;
