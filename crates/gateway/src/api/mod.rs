//! REST and WebSocket handlers.
//!
//! Handlers receive the resolved [`Principal`] as a request extension
//! (inserted by the auth middleware) and return domain results; all HTTP
//! status mapping happens in [`crate::error`].
//!
//! [`Principal`]: tmhub_core::principal::Principal

pub mod addons;
pub mod entities;
pub mod threat_models;
pub mod webhooks;
pub mod ws;
