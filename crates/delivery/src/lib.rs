//! Outbound webhook delivery.
//!
//! A bounded pool of workers consumes [`DeliveryRequest`] jobs from a
//! shared queue. Each job is signed with the webhook's secret, checked
//! against the SSRF deny list before any network I/O, and retried on a
//! fixed backoff schedule. Terminal outcomes flow back to the dispatcher
//! over the outcome channel.
//!
//! [`DeliveryRequest`]: tmhub_core::delivery::DeliveryRequest

pub mod denylist;
pub mod sign;
pub mod worker;

pub use denylist::DenyList;
pub use worker::{DeliveryQueue, WorkerPool, WorkerSettings};
