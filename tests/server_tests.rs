use std::sync::{Arc, Mutex};
use std::time::Duration;

use inspector_relay::server::{RelayConfig, RelayServer};
use inspector_relay::status::{ServerStatus, StatusBus};

fn recorder(server: &RelayServer) -> Arc<Mutex<Vec<ServerStatus>>> {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = log.clone();
    server
        .status()
        .subscribe(move |status| sink.lock().unwrap().push(status.clone()));
    log
}

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

async fn wait_for(log: &Arc<Mutex<Vec<ServerStatus>>>, pred: impl Fn(&[ServerStatus]) -> bool) {
    for _ in 0..250 {
        if pred(&log.lock().unwrap()) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached; statuses: {:?}", log.lock().unwrap());
}

fn ephemeral_config() -> RelayConfig {
    RelayConfig {
        port: 0,
        retry_delay: Duration::from_millis(100),
        ..RelayConfig::default()
    }
}

#[tokio::test]
async fn start_publishes_running_status_before_any_peer() {
    let server = RelayServer::new(ephemeral_config());
    let log = recorder(&server);

    server.start(None).await;

    let bound = server.bound_port().await.expect("bound port");
    let statuses = log.lock().unwrap().clone();
    assert_eq!(statuses.len(), 1);
    assert!(statuses[0].running);
    assert_eq!(statuses[0].port, Some(bound));
    assert_eq!(statuses[0].error, None);

    server.stop().await;
}

#[tokio::test]
async fn stop_is_idempotent_and_empties_the_registry() {
    let server = RelayServer::new(ephemeral_config());
    let log = recorder(&server);
    server.start(None).await;

    let (_id, _rx) = server.state().register_peer().await;
    assert_eq!(server.state().peer_count().await, 1);

    server.stop().await;
    assert_eq!(server.state().peer_count().await, 0);
    assert_eq!(server.bound_port().await, None);

    let after_first = log.lock().unwrap().clone();
    server.stop().await;
    let after_second = log.lock().unwrap().clone();
    assert_eq!(after_first, after_second);
    assert_eq!(after_second.last(), Some(&ServerStatus::stopped()));
}

#[tokio::test]
async fn set_port_rejects_out_of_range_values() {
    let server = RelayServer::new(ephemeral_config());
    let log = recorder(&server);
    server.start(None).await;
    let bound = server.bound_port().await.expect("bound port");
    let before = log.lock().unwrap().len();

    server.set_port(0).await;
    server.set_port(70_000).await;

    assert_eq!(log.lock().unwrap().len(), before);
    assert_eq!(server.bound_port().await, Some(bound));

    server.stop().await;
}

#[tokio::test]
async fn set_port_restarts_on_the_new_port() {
    let server = RelayServer::new(ephemeral_config());
    let log = recorder(&server);
    server.start(None).await;

    let new_port = free_port();
    server.set_port(u32::from(new_port)).await;

    wait_for(&log, |statuses| {
        statuses
            .iter()
            .any(|s| s.running && s.port == Some(new_port))
    })
    .await;
    assert_eq!(server.bound_port().await, Some(new_port));

    server.stop().await;
}

#[tokio::test]
async fn occupied_port_reports_error_then_falls_back_to_default() {
    // A foreign listener holds the target port for the whole test.
    let foreign = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let occupied = foreign.local_addr().unwrap().port();
    let fallback = free_port();

    let server = RelayServer::new(RelayConfig {
        port: occupied,
        fallback_port: fallback,
        retry_delay: Duration::from_millis(100),
        ..RelayConfig::default()
    });
    let log = recorder(&server);

    server.start(None).await;

    wait_for(&log, |statuses| {
        statuses.iter().any(|s| {
            !s.running && s.port == Some(occupied) && s.error.as_deref().is_some_and(|e| e.contains("in use"))
        })
    })
    .await;
    wait_for(&log, |statuses| {
        statuses
            .iter()
            .any(|s| s.running && s.port == Some(fallback))
    })
    .await;
    assert_eq!(server.bound_port().await, Some(fallback));

    server.stop().await;
}

#[tokio::test]
async fn restart_on_the_same_port_is_idempotent() {
    let server = RelayServer::new(ephemeral_config());
    server.start(None).await;
    let port = server.bound_port().await.expect("bound port");

    server.start(Some(port)).await;
    assert_eq!(server.bound_port().await, Some(port));

    server.stop().await;
}

#[tokio::test]
async fn pending_fallback_is_superseded_by_explicit_reconfiguration() {
    let foreign = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let occupied = foreign.local_addr().unwrap().port();
    // Allocate both ports while holding the sockets so they cannot collide.
    let holder_a = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let holder_b = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let stale_fallback = holder_a.local_addr().unwrap().port();
    let explicit = holder_b.local_addr().unwrap().port();
    drop(holder_a);
    drop(holder_b);

    let server = RelayServer::new(RelayConfig {
        port: occupied,
        fallback_port: stale_fallback,
        retry_delay: Duration::from_millis(150),
        ..RelayConfig::default()
    });
    let log = recorder(&server);

    server.start(None).await;
    wait_for(&log, |statuses| statuses.iter().any(|s| s.error.is_some())).await;

    // Reconfigure before the delayed retry fires; the stale timer must not
    // steal the listener back to the fallback port.
    server.set_port(u32::from(explicit)).await;
    wait_for(&log, |statuses| {
        statuses.iter().any(|s| s.running && s.port == Some(explicit))
    })
    .await;

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(server.bound_port().await, Some(explicit));
    assert!(!log
        .lock()
        .unwrap()
        .iter()
        .any(|s| s.running && s.port == Some(stale_fallback)));

    server.stop().await;
}

#[tokio::test]
async fn superseded_fallback_bind_is_discarded() {
    let foreign = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let occupied = foreign.local_addr().unwrap().port();
    // The fallback port stays occupied until after the reconfiguration, so
    // the delayed retry can be mid-bind when it is superseded.
    let fallback_holder = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let fallback = fallback_holder.local_addr().unwrap().port();

    let server = RelayServer::new(RelayConfig {
        port: occupied,
        fallback_port: fallback,
        retry_delay: Duration::from_millis(100),
        ..RelayConfig::default()
    });
    let log = recorder(&server);

    server.start(None).await;
    wait_for(&log, |statuses| statuses.iter().any(|s| s.error.is_some())).await;

    // Let the retry fire and start contending for the still-held fallback
    // port, then reconfigure while that attempt is in flight.
    tokio::time::sleep(Duration::from_millis(150)).await;
    let explicit = free_port();
    server.set_port(u32::from(explicit)).await;
    wait_for(&log, |statuses| {
        statuses.iter().any(|s| s.running && s.port == Some(explicit))
    })
    .await;

    // Release the fallback port; if the in-flight retry now binds it, that
    // listener must be discarded rather than installed over the current one.
    drop(fallback_holder);
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert_eq!(server.bound_port().await, Some(explicit));
    assert!(!log
        .lock()
        .unwrap()
        .iter()
        .any(|s| s.running && s.port == Some(fallback)));

    // The explicit listener is still the live one.
    let health = tokio::task::spawn_blocking(move || {
        ureq::get(&format!("http://127.0.0.1:{explicit}/health"))
            .call()
            .expect("health request")
            .status()
    })
    .await
    .expect("health task");
    assert_eq!(health, 200);

    server.stop().await;
}

#[tokio::test]
async fn stop_during_pending_fallback_publishes_stopped() {
    let foreign = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let occupied = foreign.local_addr().unwrap().port();

    let server = RelayServer::new(RelayConfig {
        port: occupied,
        fallback_port: free_port(),
        retry_delay: Duration::from_millis(200),
        ..RelayConfig::default()
    });
    let log = recorder(&server);

    server.start(None).await;
    wait_for(&log, |statuses| statuses.iter().any(|s| s.error.is_some())).await;

    // Stopping cancels the pending retry; the last observed status must be
    // stopped, not the stale bind error.
    server.stop().await;
    assert_eq!(log.lock().unwrap().last(), Some(&ServerStatus::stopped()));

    tokio::time::sleep(Duration::from_millis(500)).await;
    let statuses = log.lock().unwrap().clone();
    assert!(!statuses.iter().any(|s| s.running));
    assert_eq!(statuses.last(), Some(&ServerStatus::stopped()));

    // A second stop with nothing running and nothing pending stays silent.
    server.stop().await;
    assert_eq!(log.lock().unwrap().len(), statuses.len());
}

#[test]
fn observers_may_mutate_the_bus_during_publish() {
    let bus = StatusBus::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let handle_cell = Arc::new(Mutex::new(None));

    let first = {
        let bus_handle = bus.clone();
        let handle_cell = handle_cell.clone();
        let seen = seen.clone();
        bus.subscribe(move |_s: &ServerStatus| {
            seen.lock().unwrap().push("first");
            if let Some(id) = handle_cell.lock().unwrap().take() {
                bus_handle.unsubscribe(id);
            }
        })
    };
    *handle_cell.lock().unwrap() = Some(first);

    let _second = {
        let bus_handle = bus.clone();
        let seen = seen.clone();
        bus.subscribe(move |_s: &ServerStatus| {
            seen.lock().unwrap().push("second");
            bus_handle.subscribe(|_s: &ServerStatus| {});
        })
    };

    // Both callbacks reach back into the bus; delivery must complete without
    // deadlocking, and the self-removal takes effect for the next publish.
    bus.publish(&ServerStatus::running(9));
    assert_eq!(seen.lock().unwrap().as_slice(), &["first", "second"]);
    assert_eq!(bus.observer_count(), 2);

    bus.publish(&ServerStatus::stopped());
    assert_eq!(
        seen.lock().unwrap().as_slice(),
        &["first", "second", "second"]
    );
    assert_eq!(bus.observer_count(), 3);
}

#[test]
fn status_bus_observers_are_ordered_and_individually_removable() {
    let bus = StatusBus::new();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let first = {
        let seen = seen.clone();
        bus.subscribe(move |s: &ServerStatus| seen.lock().unwrap().push(("first", s.running)))
    };
    let _second = {
        let seen = seen.clone();
        bus.subscribe(move |s: &ServerStatus| seen.lock().unwrap().push(("second", s.running)))
    };

    bus.publish(&ServerStatus::running(1));
    assert_eq!(
        seen.lock().unwrap().as_slice(),
        &[("first", true), ("second", true)]
    );

    bus.unsubscribe(first);
    bus.publish(&ServerStatus::stopped());
    assert_eq!(bus.observer_count(), 1);
    assert_eq!(
        seen.lock().unwrap().last(),
        Some(&("second", false))
    );
}
