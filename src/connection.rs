//! Connection register: global and per-IP concurrency caps.
//!
//! The global total and every per-IP counter are one logical resource, so a
//! single mutex covers the whole check-then-increment. Entries are dropped
//! from the per-IP map once their count returns to zero.

use crate::admission::RejectReason;
use crate::config::ConnectionConfig;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct RegisterState {
    total: usize,
    by_ip: HashMap<IpAddr, usize>,
}

/// Tracks concurrently-open connections globally and per source IP.
#[derive(Debug)]
pub struct ConnectionRegister {
    state: Mutex<RegisterState>,
    /// Total connections accepted.
    total_accepted: AtomicUsize,
    /// Total connections rejected due to limits.
    total_rejected: AtomicUsize,
    config: ConnectionConfig,
}

impl ConnectionRegister {
    /// Creates a new register with the given limits.
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            state: Mutex::new(RegisterState::default()),
            total_accepted: AtomicUsize::new(0),
            total_rejected: AtomicUsize::new(0),
            config,
        }
    }

    /// Creates a register with default limits.
    pub fn with_defaults() -> Self {
        Self::new(ConnectionConfig::default())
    }

    /// Attempts to reserve a connection slot for `ip`.
    ///
    /// The global limit is checked before the per-IP limit, so a caller at
    /// both ceilings is always told `ConnectionLimit`. Nothing is mutated on
    /// rejection.
    pub fn try_acquire(&self, ip: IpAddr) -> Result<(), RejectReason> {
        let ip = ip.to_canonical();
        let mut state = self.state.lock();

        if state.total >= self.config.connection_limit {
            drop(state);
            self.total_rejected.fetch_add(1, Ordering::Relaxed);
            return Err(RejectReason::ConnectionLimit);
        }

        let current = state.by_ip.get(&ip).copied().unwrap_or(0);
        if current >= self.config.per_ip_connection_limit {
            drop(state);
            self.total_rejected.fetch_add(1, Ordering::Relaxed);
            return Err(RejectReason::PerIpLimit);
        }

        state.total += 1;
        state.by_ip.insert(ip, current + 1);
        let active = state.total;
        drop(state);

        self.total_accepted.fetch_add(1, Ordering::Relaxed);
        debug!(ip = %ip, active, "connection slot acquired");
        Ok(())
    }

    /// Releases a slot previously reserved for `ip`.
    ///
    /// Releasing an IP with no open connections is a caller bug; it is logged
    /// and otherwise ignored.
    pub fn release(&self, ip: IpAddr) {
        let ip = ip.to_canonical();
        let mut state = self.state.lock();

        // Entries are removed at zero, so a present count is always >= 1.
        let remaining = state.by_ip.get_mut(&ip).map(|count| {
            *count -= 1;
            *count
        });

        match remaining {
            None => {
                drop(state);
                warn!(ip = %ip, "release without matching acquire, ignoring");
                return;
            }
            Some(0) => {
                state.by_ip.remove(&ip);
            }
            Some(_) => {}
        }
        state.total = state.total.saturating_sub(1);
        let active = state.total;
        drop(state);

        debug!(ip = %ip, active, "connection slot released");
    }

    /// Returns the number of open connections across all IPs.
    pub fn active_connections(&self) -> usize {
        self.state.lock().total
    }

    /// Returns the number of open connections from `ip`.
    pub fn connections_for(&self, ip: IpAddr) -> usize {
        self.state
            .lock()
            .by_ip
            .get(&ip.to_canonical())
            .copied()
            .unwrap_or(0)
    }

    /// Returns the configured limits.
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Returns connection statistics.
    pub fn stats(&self) -> ConnectionStats {
        let (active, tracked_ips) = {
            let state = self.state.lock();
            (state.total, state.by_ip.len())
        };

        ConnectionStats {
            active,
            tracked_ips,
            total_accepted: self.total_accepted.load(Ordering::Relaxed),
            total_rejected: self.total_rejected.load(Ordering::Relaxed),
            connection_limit: self.config.connection_limit,
            per_ip_connection_limit: self.config.per_ip_connection_limit,
        }
    }
}

/// Statistics about connection usage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Current number of open connections.
    pub active: usize,
    /// Number of source IPs with at least one open connection.
    pub tracked_ips: usize,
    /// Total number of accepted connections.
    pub total_accepted: usize,
    /// Total number of rejected connections.
    pub total_rejected: usize,
    /// Configured global limit.
    pub connection_limit: usize,
    /// Configured per-IP limit.
    pub per_ip_connection_limit: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};
    use std::sync::{Arc, Barrier};
    use std::thread;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    #[test]
    fn test_per_ip_then_global() {
        let register = ConnectionRegister::new(ConnectionConfig::new(2).with_per_ip_limit(1));

        assert_eq!(register.try_acquire(ip(1)), Ok(()));
        assert_eq!(register.try_acquire(ip(1)), Err(RejectReason::PerIpLimit));
        assert_eq!(register.try_acquire(ip(2)), Ok(()));
        assert_eq!(register.try_acquire(ip(2)), Err(RejectReason::ConnectionLimit));
        assert_eq!(register.active_connections(), 2);
    }

    #[test]
    fn test_global_limit_takes_precedence() {
        let register = ConnectionRegister::new(ConnectionConfig::new(4).with_per_ip_limit(2));

        for last in [1, 1, 2, 2] {
            assert!(register.try_acquire(ip(last)).is_ok());
        }

        // ip(1) is at its own cap too, but the global ceiling wins.
        assert_eq!(register.try_acquire(ip(1)), Err(RejectReason::ConnectionLimit));
        assert_eq!(register.try_acquire(ip(3)), Err(RejectReason::ConnectionLimit));
    }

    #[test]
    fn test_zero_limits() {
        let register = ConnectionRegister::new(ConnectionConfig::new(0).with_per_ip_limit(5));
        assert_eq!(register.try_acquire(ip(1)), Err(RejectReason::ConnectionLimit));

        let register = ConnectionRegister::new(ConnectionConfig::new(5).with_per_ip_limit(0));
        assert_eq!(register.try_acquire(ip(1)), Err(RejectReason::PerIpLimit));
        assert_eq!(register.active_connections(), 0);
    }

    #[test]
    fn test_release_restores_capacity() {
        let register = ConnectionRegister::new(ConnectionConfig::new(1).with_per_ip_limit(1));

        assert!(register.try_acquire(ip(1)).is_ok());
        register.release(ip(1));
        assert_eq!(register.connections_for(ip(1)), 0);
        assert_eq!(register.active_connections(), 0);
        assert_eq!(register.stats().tracked_ips, 0);

        assert!(register.try_acquire(ip(1)).is_ok());
        assert_eq!(register.connections_for(ip(1)), 1);
    }

    #[test]
    fn test_double_release_clamped() {
        let register = ConnectionRegister::new(ConnectionConfig::new(2).with_per_ip_limit(2));

        assert!(register.try_acquire(ip(1)).is_ok());
        assert!(register.try_acquire(ip(2)).is_ok());
        register.release(ip(1));
        register.release(ip(1));
        register.release(ip(3));

        assert_eq!(register.active_connections(), 1);
        assert_eq!(register.connections_for(ip(1)), 0);
        assert_eq!(register.connections_for(ip(2)), 1);
    }

    #[test]
    fn test_ipv4_mapped_shares_counter() {
        let register = ConnectionRegister::new(ConnectionConfig::new(10).with_per_ip_limit(1));
        let mapped = IpAddr::V6(Ipv4Addr::new(10, 0, 0, 1).to_ipv6_mapped());

        assert!(register.try_acquire(ip(1)).is_ok());
        assert_eq!(register.try_acquire(mapped), Err(RejectReason::PerIpLimit));

        let v6 = IpAddr::V6(Ipv6Addr::LOCALHOST);
        assert!(register.try_acquire(v6).is_ok());
    }

    #[test]
    fn test_concurrent_acquire_never_overshoots() {
        let per_ip = 5;
        let register = Arc::new(ConnectionRegister::new(
            ConnectionConfig::new(10).with_per_ip_limit(per_ip),
        ));
        let threads = 100;
        let barrier = Arc::new(Barrier::new(threads));

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let register = Arc::clone(&register);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    let admitted = register.try_acquire(ip(1)).is_ok();
                    assert!(register.connections_for(ip(1)) <= per_ip);
                    admitted
                })
            })
            .collect();

        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();

        assert_eq!(admitted, per_ip);
        assert_eq!(register.connections_for(ip(1)), per_ip);
        assert_eq!(register.active_connections(), per_ip);
    }

    #[test]
    fn test_concurrent_global_limit_across_ips() {
        let register = Arc::new(ConnectionRegister::new(
            ConnectionConfig::new(7).with_per_ip_limit(3),
        ));
        let threads = 64;
        let barrier = Arc::new(Barrier::new(threads));

        let handles: Vec<_> = (0..threads)
            .map(|i| {
                let register = Arc::clone(&register);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    register.try_acquire(ip((i % 16) as u8)).is_ok()
                })
            })
            .collect();

        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();

        assert_eq!(admitted, 7);
        let stats = register.stats();
        assert_eq!(stats.active, 7);
        assert_eq!(stats.total_accepted, 7);
        assert_eq!(stats.total_rejected, threads - 7);
    }

    #[test]
    fn test_connection_stats() {
        let register = ConnectionRegister::new(ConnectionConfig::new(2).with_per_ip_limit(2));

        let _ = register.try_acquire(ip(1));
        let _ = register.try_acquire(ip(2));
        let _ = register.try_acquire(ip(3));

        let stats = register.stats();
        assert_eq!(stats.active, 2);
        assert_eq!(stats.tracked_ips, 2);
        assert_eq!(stats.total_accepted, 2);
        assert_eq!(stats.total_rejected, 1);
        assert_eq!(stats.connection_limit, 2);
        assert_eq!(stats.per_ip_connection_limit, 2);
    }
}
