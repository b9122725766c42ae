use dbfw_admission::config::{ConnectionConfig, RateLimiterConfig};
use dbfw_admission::listener::Listener;
use dbfw_admission::{Admission, AdmissionController, RejectReason};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::broadcast;

fn ip(last: u8) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
}

#[test]
fn test_global_limit_reported_over_per_ip_limit() {
    // N = 5, M = 2: ips 1 and 2 take two slots each, ip 3 takes the last.
    let config = ConnectionConfig::new(5).with_per_ip_limit(2);
    let controller = AdmissionController::from_config(&config, None);

    for last in [1, 1, 2, 2, 3] {
        assert!(controller.admit(ip(last)).is_admitted());
    }

    // ip 1 is at its own cap as well.
    assert_eq!(
        controller.admit(ip(1)),
        Admission::Rejected(RejectReason::ConnectionLimit)
    );
}

#[test]
fn test_acquire_release_acquire() {
    let config = ConnectionConfig::new(1).with_per_ip_limit(1);
    let controller = AdmissionController::from_config(&config, None);

    assert!(controller.admit(ip(1)).is_admitted());
    controller.release(ip(1));
    assert_eq!(controller.register().connections_for(ip(1)), 0);

    for _ in 0..10 {
        assert!(controller.admit(ip(1)).is_admitted());
        controller.release(ip(1));
    }
    assert_eq!(controller.register().active_connections(), 0);
}

#[test]
fn test_rate_limited_ips_are_isolated() {
    let config = ConnectionConfig::new(100).with_per_ip_limit(100);
    let controller =
        AdmissionController::from_config(&config, Some(&RateLimiterConfig::new(1, 1)));

    assert!(controller.admit(ip(1)).is_admitted());
    assert!(controller.admit(ip(2)).is_admitted());
    assert_eq!(controller.admit(ip(1)).reason(), Some(RejectReason::RateLimited));
    assert_eq!(controller.admit(ip(2)).reason(), Some(RejectReason::RateLimited));
}

#[test]
fn test_concurrent_admissions_with_rate_limit() {
    let config = ConnectionConfig::new(1000).with_per_ip_limit(1000);
    let controller = Arc::new(AdmissionController::from_config(
        &config,
        Some(&RateLimiterConfig::new(1, 3)),
    ));
    let threads = 50;
    let barrier = Arc::new(Barrier::new(threads));
    let admitted = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let controller = Arc::clone(&controller);
            let barrier = Arc::clone(&barrier);
            let admitted = Arc::clone(&admitted);
            thread::spawn(move || {
                barrier.wait();
                if controller.admit(ip(9)).is_admitted() {
                    admitted.fetch_add(1, Ordering::Relaxed);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(admitted.load(Ordering::Relaxed), 3);
    assert_eq!(controller.register().connections_for(ip(9)), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_listener_admits_and_releases() {
    let config = ConnectionConfig::new(10).with_per_ip_limit(1);
    let controller = Arc::new(AdmissionController::from_config(&config, None));
    let localhost = IpAddr::V4(Ipv4Addr::LOCALHOST);

    let listener = Listener::bind("127.0.0.1:0", Arc::clone(&controller))
        .await
        .unwrap();
    let addr = listener.local_addr();
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

    let server = tokio::spawn(async move { listener.serve(shutdown_rx).await });

    let first = TcpStream::connect(addr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(controller.register().connections_for(localhost), 1);

    // Same IP over its limit: closed without being admitted.
    let mut second = TcpStream::connect(addr).await.unwrap();
    let mut buf = [0u8; 16];
    let read = tokio::time::timeout(Duration::from_secs(2), second.read(&mut buf)).await;
    assert!(matches!(read, Ok(Ok(0)) | Ok(Err(_))));
    assert_eq!(controller.register().connections_for(localhost), 1);

    // Closing the admitted socket frees the slot.
    drop(first);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(controller.register().connections_for(localhost), 0);

    let mut third = TcpStream::connect(addr).await.unwrap();
    let read = tokio::time::timeout(Duration::from_millis(200), third.read(&mut buf)).await;
    assert!(read.is_err(), "admitted connection should stay open");

    shutdown_tx.send(()).unwrap();
    assert!(server.await.unwrap().is_ok());
}
