//! REST API client module for the QAdapt backend.
//!
//! This module provides the `ApiClient` for logging in, signing up and
//! making authenticated calls against the QAdapt API.
//!
//! The API uses short-lived bearer tokens obtained from `auth/login` and
//! renewed through `auth/token`; renewal is handled by the gateway.

pub mod client;
pub mod error;

pub use client::ApiClient;
pub use error::ApiError;
