//! Admission controller: the single entry point for connection admission.
//!
//! The rate limiter (when configured) is consulted first; only if it allows
//! the IP does the connection register get a chance to reserve a slot.

use crate::config::{ConnectionConfig, RateLimiterConfig};
use crate::connection::ConnectionRegister;
use crate::metrics::Metrics;
use crate::ratelimit::TokenBucketLimiter;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, warn};

/// Why an admission attempt was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// The global connection limit is reached.
    ConnectionLimit,
    /// The source IP is at its own connection limit.
    PerIpLimit,
    /// The source IP exceeded its request rate.
    RateLimited,
}

impl RejectReason {
    /// Returns the machine-readable reason code.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConnectionLimit => "connection_limit",
            Self::PerIpLimit => "per_ip_limit",
            Self::RateLimited => "rate_limited",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of an admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The connection may proceed; a slot has been reserved.
    Admitted,
    /// The connection must not proceed.
    Rejected(RejectReason),
}

impl Admission {
    /// Returns `true` if the connection was admitted.
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted)
    }

    /// Returns the rejection reason, if any.
    pub fn reason(&self) -> Option<RejectReason> {
        match self {
            Self::Admitted => None,
            Self::Rejected(reason) => Some(*reason),
        }
    }
}

impl From<Result<(), RejectReason>> for Admission {
    fn from(result: Result<(), RejectReason>) -> Self {
        match result {
            Ok(()) => Self::Admitted,
            Err(reason) => Self::Rejected(reason),
        }
    }
}

/// Applies rate and connection limits to inbound connections.
///
/// Holds no state of its own and is shared across accepting tasks via `Arc`.
///
/// # Example
///
/// ```
/// use dbfw_admission::admission::{AdmissionController, RejectReason};
/// use dbfw_admission::config::ConnectionConfig;
/// use std::net::{IpAddr, Ipv4Addr};
///
/// let config = ConnectionConfig::new(2).with_per_ip_limit(1);
/// let controller = AdmissionController::from_config(&config, None);
/// let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
///
/// assert!(controller.admit(ip).is_admitted());
/// assert_eq!(controller.admit(ip).reason(), Some(RejectReason::PerIpLimit));
///
/// controller.release(ip);
/// assert!(controller.admit(ip).is_admitted());
/// ```
#[derive(Debug, Clone)]
pub struct AdmissionController {
    register: Arc<ConnectionRegister>,
    rate_limiter: Option<Arc<TokenBucketLimiter>>,
}

impl AdmissionController {
    /// Creates a controller over an existing register and optional limiter.
    pub fn new(
        register: Arc<ConnectionRegister>,
        rate_limiter: Option<Arc<TokenBucketLimiter>>,
    ) -> Self {
        Self {
            register,
            rate_limiter,
        }
    }

    /// Builds the register and limiter from configuration.
    pub fn from_config(
        connection: &ConnectionConfig,
        rate_limiter: Option<&RateLimiterConfig>,
    ) -> Self {
        Self::new(
            Arc::new(ConnectionRegister::new(connection.clone())),
            rate_limiter.map(|config| Arc::new(TokenBucketLimiter::new(config.clone()))),
        )
    }

    /// Decides whether a connection from `ip` may proceed.
    ///
    /// On `Admitted` a connection slot is reserved and must be returned with
    /// [`release`](Self::release) when the connection closes.
    pub fn admit(&self, ip: IpAddr) -> Admission {
        let admission = Admission::from(self.check(ip));
        Metrics::record_admission(admission);

        // Rate-limited floods from one IP stay out of the warn log.
        match admission {
            Admission::Admitted => debug!(ip = %ip, "connection admitted"),
            Admission::Rejected(RejectReason::RateLimited) => {
                debug!(ip = %ip, reason = %RejectReason::RateLimited, "connection rejected")
            }
            Admission::Rejected(reason) => {
                warn!(ip = %ip, reason = %reason, "connection rejected")
            }
        }
        admission
    }

    /// Like [`admit`](Self::admit), but ties the reserved slot to a permit
    /// that releases it on drop.
    pub fn try_admit(&self, ip: IpAddr) -> Result<AdmissionPermit, RejectReason> {
        match self.admit(ip) {
            Admission::Admitted => Ok(AdmissionPermit {
                register: Arc::clone(&self.register),
                ip,
            }),
            Admission::Rejected(reason) => Err(reason),
        }
    }

    /// Returns a slot previously reserved by [`admit`](Self::admit).
    pub fn release(&self, ip: IpAddr) {
        self.register.release(ip);
    }

    /// Returns the connection register.
    pub fn register(&self) -> &Arc<ConnectionRegister> {
        &self.register
    }

    /// Returns the rate limiter, if rate limiting is enabled.
    pub fn rate_limiter(&self) -> Option<&Arc<TokenBucketLimiter>> {
        self.rate_limiter.as_ref()
    }

    fn check(&self, ip: IpAddr) -> Result<(), RejectReason> {
        if let Some(limiter) = &self.rate_limiter {
            if !limiter.allow(ip) {
                return Err(RejectReason::RateLimited);
            }
        }

        self.register.try_acquire(ip)
    }
}

/// An admitted connection's reserved slot, released when dropped.
#[derive(Debug)]
pub struct AdmissionPermit {
    register: Arc<ConnectionRegister>,
    ip: IpAddr,
}

impl AdmissionPermit {
    /// Returns the source IP this permit was issued for.
    pub fn ip(&self) -> IpAddr {
        self.ip
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.register.release(self.ip);
    }
}
