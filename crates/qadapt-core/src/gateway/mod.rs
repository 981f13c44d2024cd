//! Authenticated request gateway.
//!
//! Every authenticated call passes through [`Gateway::authorize`], which
//! attaches `Authorization: Bearer <token>` and renews the credential when it
//! has expired. Refresh tokens rotate on every use, so concurrent renewals
//! would invalidate each other: the first caller to find the credential
//! expired becomes the leader and performs the only refresh, while every
//! other caller is parked in a FIFO queue until the leader settles.
//!
//! State machine:
//! - `Valid`: requests pass straight through
//! - `Expired`: the next request starts a refresh
//! - `Refreshing`: one refresh outstanding, everyone else queues
//! - `LoggedOut`: no stored session until the next login or signup
//!
//! Failures are reported as [`GatewayError`]; the application decides where
//! to send the user via [`GatewayError::redirect`].

pub mod error;
mod queue;
pub mod refresh;

pub use error::{GatewayError, Redirect};
pub use refresh::{Gateway, GatewayOptions, GatewayState};
