//! Connection admission gate for a database firewall proxy.
//!
//! Decides, per inbound connection and before any SQL is read, whether the
//! source IP may proceed: a per-IP token bucket bounds the sustained rate and
//! a connection register caps concurrency globally and per IP.

pub mod admission;
pub mod config;
pub mod connection;
pub mod error;
pub mod listener;
pub mod metrics;
pub mod ratelimit;

pub use admission::{Admission, AdmissionController, AdmissionPermit, RejectReason};
pub use connection::ConnectionRegister;
pub use ratelimit::TokenBucketLimiter;
