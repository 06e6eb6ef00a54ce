// Integration tests for the health monitor and restart dedup
//
// A recording runtime reports scripted health states; the tests check which
// services get restarted and that overlapping emissions for one label
// coalesce into a single restart.

mod common;

use common::RecordingRuntime;
use fblaster::health::{self, HealthMonitor};
use fblaster::runtime::HealthState;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_unhealthy_siblings_restart_once_each() {
    let runtime = Arc::new(RecordingRuntime::with_health(
        &[
            ("cat", HealthState::Unhealthy),
            ("dog", HealthState::Unhealthy),
            ("redis", HealthState::Healthy),
        ],
        // Slow restarts so repeated emissions overlap an in-flight restart
        Duration::from_secs(2),
    ));
    let root = CancellationToken::new();

    let (monitor, emissions) = HealthMonitor::new(
        runtime.clone(),
        Duration::from_millis(50),
        Duration::from_millis(150),
        root.clone(),
    );
    monitor.rebind(vec![
        "cat".to_string(),
        "dog".to_string(),
        "redis".to_string(),
    ]);
    let restart_loop = tokio::spawn(health::run_restart_loop(
        runtime.clone(),
        emissions,
        Duration::from_secs(1),
        root.clone(),
    ));

    // Well past the tolerance, with many ticks flagging both services
    tokio::time::sleep(Duration::from_secs(1)).await;

    let restarted = runtime.restarted();
    assert_eq!(
        restarted.iter().filter(|l| l.as_str() == "cat").count(),
        1,
        "cat restarted more than once: {restarted:?}"
    );
    assert_eq!(
        restarted.iter().filter(|l| l.as_str() == "dog").count(),
        1,
        "dog restarted more than once: {restarted:?}"
    );
    assert!(
        !restarted.iter().any(|l| l.as_str() == "redis"),
        "healthy service was restarted: {restarted:?}"
    );

    root.cancel();
    let _ = restart_loop.await;
}

#[tokio::test]
async fn test_recovered_service_is_not_restarted() {
    let runtime = Arc::new(RecordingRuntime::with_health(
        &[("cat", HealthState::Unhealthy)],
        Duration::ZERO,
    ));
    let root = CancellationToken::new();

    let (monitor, emissions) = HealthMonitor::new(
        runtime.clone(),
        Duration::from_millis(50),
        Duration::from_millis(500),
        root.clone(),
    );
    monitor.rebind(vec!["cat".to_string()]);
    let restart_loop = tokio::spawn(health::run_restart_loop(
        runtime.clone(),
        emissions,
        Duration::from_secs(1),
        root.clone(),
    ));

    // Recovers inside the tolerance window
    tokio::time::sleep(Duration::from_millis(200)).await;
    runtime
        .health
        .lock()
        .unwrap()
        .insert("cat".to_string(), HealthState::Healthy);
    tokio::time::sleep(Duration::from_millis(600)).await;

    assert!(
        runtime.restarted().is_empty(),
        "recovered service was restarted"
    );

    root.cancel();
    let _ = restart_loop.await;
}

#[tokio::test]
async fn test_gone_container_resets_instead_of_flagging() {
    let runtime = Arc::new(RecordingRuntime::with_health(
        &[("cat", HealthState::Gone)],
        Duration::ZERO,
    ));
    let root = CancellationToken::new();

    let (monitor, emissions) = HealthMonitor::new(
        runtime.clone(),
        Duration::from_millis(50),
        Duration::from_millis(150),
        root.clone(),
    );
    monitor.rebind(vec!["cat".to_string()]);
    let restart_loop = tokio::spawn(health::run_restart_loop(
        runtime.clone(),
        emissions,
        Duration::from_secs(1),
        root.clone(),
    ));

    // Stale ids reset the record; the service is never flagged unhealthy
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert!(runtime.restarted().is_empty());

    root.cancel();
    let _ = restart_loop.await;
}
