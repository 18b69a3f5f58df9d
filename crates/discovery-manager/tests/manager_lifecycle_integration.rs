use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use discovery_manager::mock::{MockBehavior, MockWorker, QuitBehavior};
use discovery_manager::{
    DiscoveryManager, DiscoveryState, DriverSettings, Event, EventStream, ManagerError, Operation,
    PluggableDiscovery, Port,
};
use tokio::sync::mpsc::error::TryRecvError;

fn port(address: &str) -> Port {
    Port::new(address, "serial")
}

fn register(manager: &DiscoveryManager, id: &str, behavior: MockBehavior) -> Result<MockWorker> {
    let worker = MockWorker::new(behavior);
    let settings = DriverSettings::default().with_quit_grace_period(Duration::from_millis(200));
    manager.add(PluggableDiscovery::with_settings(
        id,
        Arc::new(worker.clone()),
        settings,
    ))?;
    Ok(worker)
}

fn state(manager: &DiscoveryManager, id: &str) -> Result<DiscoveryState> {
    Ok(manager.get(id).context("discovery not registered")?.state())
}

async fn next_event(events: &EventStream) -> Result<Event> {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .context("timed out waiting for event")?
        .context("event stream closed")
}

#[tokio::test]
async fn test_ids_reflect_added_discoveries() -> Result<()> {
    let manager = DiscoveryManager::new();
    for id in ["serial", "mdns", "teensy"] {
        register(&manager, id, MockBehavior::default())?;
    }
    assert_eq!(manager.ids(), vec!["mdns", "serial", "teensy"]);

    let duplicate = register(&manager, "mdns", MockBehavior::default());
    assert!(duplicate.is_err());
    assert_eq!(manager.ids(), vec!["mdns", "serial", "teensy"]);
    Ok(())
}

#[tokio::test]
async fn test_run_all_reports_spawn_failure_once() -> Result<()> {
    let manager = DiscoveryManager::new();
    register(&manager, "good-1", MockBehavior::default())?;
    register(&manager, "broken", MockBehavior::default().failing_launch())?;
    register(&manager, "good-2", MockBehavior::default())?;

    let errors = manager.run_all().await;
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].id(), "broken");
    assert!(errors[0]
        .discovery_error()
        .is_some_and(|e| e.is_process_start()));
    assert!(errors[0].to_string().starts_with("running discovery broken"));

    assert_eq!(state(&manager, "good-1")?, DiscoveryState::Idling);
    assert_eq!(state(&manager, "good-2")?, DiscoveryState::Idling);
    assert_eq!(state(&manager, "broken")?, DiscoveryState::Dead);

    // Alive workers are skipped, the broken one is retried
    let errors = manager.run_all().await;
    assert_eq!(errors.len(), 1);

    manager.quit_all().await;
    Ok(())
}

#[tokio::test]
async fn test_start_sync_all_reuses_stream() -> Result<()> {
    let manager = DiscoveryManager::new();
    register(&manager, "serial", MockBehavior::default())?;
    register(&manager, "mdns", MockBehavior::default())?;
    assert!(manager.run_all().await.is_empty());

    let (first, errors) = manager.start_sync_all().await;
    assert!(errors.is_empty());
    let (second, errors) = manager.start_sync_all().await;
    assert!(errors.is_empty());
    assert!(first.same_stream(&second));

    assert!(manager.quit_all().await.is_empty());
    let (third, _) = manager.start_sync_all().await;
    assert!(!third.same_stream(&first));
    Ok(())
}

#[tokio::test]
async fn test_start_sync_all_survives_announcements_before_ack() -> Result<()> {
    let manager = DiscoveryManager::new();
    let ports: Vec<Port> = (0..8).map(|n| port(&format!("COM{}", n))).collect();
    register(
        &manager,
        "eager",
        MockBehavior::default()
            .with_sync_ports(ports.clone())
            .announcing_before_ack(),
    )?;
    register(&manager, "quiet", MockBehavior::default())?;
    assert!(manager.run_all().await.is_empty());

    let (events, errors) = tokio::time::timeout(Duration::from_secs(3), manager.start_sync_all())
        .await
        .context("start_sync_all did not return")?;
    assert!(errors.is_empty());
    assert_eq!(manager.list_sync().len(), 8);

    for expected in ports {
        assert_eq!(next_event(&events).await?, Event::add(expected));
    }

    assert!(manager.quit_all().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_start_sync_failure_is_attributed() -> Result<()> {
    let manager = DiscoveryManager::new();
    register(&manager, "serial", MockBehavior::default())?;
    register(&manager, "flaky", MockBehavior::default().failing_start_sync())?;
    manager.run_all().await;

    let (_events, errors) = manager.start_sync_all().await;
    assert_eq!(errors.len(), 1);
    assert!(matches!(
        &errors[0],
        ManagerError::Discovery { id, operation: Operation::StartSync, .. } if id == "flaky"
    ));
    assert_eq!(state(&manager, "serial")?, DiscoveryState::Syncing);
    assert_eq!(state(&manager, "flaky")?, DiscoveryState::Idling);

    manager.quit_all().await;
    Ok(())
}

#[tokio::test]
async fn test_events_keep_per_worker_order() -> Result<()> {
    let manager = DiscoveryManager::new();
    let serial = register(&manager, "serial", MockBehavior::default())?;
    let network = register(&manager, "network", MockBehavior::default())?;
    manager.run_all().await;
    let (events, errors) = manager.start_sync_all().await;
    assert!(errors.is_empty());

    const COUNT: usize = 20;
    for i in 0..COUNT {
        serial.emit(Event::add(port(&format!("/dev/ttyUSB{}", i))));
        network.emit(Event::add(Port::new(format!("10.0.0.{}", i), "network")));
    }

    let mut serial_seen = Vec::new();
    let mut network_seen = Vec::new();
    for _ in 0..COUNT * 2 {
        let event = next_event(&events).await?;
        match event.port.protocol.as_str() {
            "serial" => serial_seen.push(event.port.address),
            _ => network_seen.push(event.port.address),
        }
    }

    let expected: Vec<String> = (0..COUNT).map(|i| format!("/dev/ttyUSB{}", i)).collect();
    assert_eq!(serial_seen, expected);
    let expected: Vec<String> = (0..COUNT).map(|i| format!("10.0.0.{}", i)).collect();
    assert_eq!(network_seen, expected);

    manager.quit_all().await;
    Ok(())
}

#[tokio::test]
async fn test_quit_all_closes_merged_stream() -> Result<()> {
    let manager = DiscoveryManager::new();
    let worker = register(&manager, "serial", MockBehavior::default())?;
    manager.run_all().await;
    let (events, _) = manager.start_sync_all().await;

    worker.emit(Event::add(port("COM4")));
    assert_eq!(next_event(&events).await?, Event::add(port("COM4")));

    assert!(manager.quit_all().await.is_empty());
    let closed = tokio::time::timeout(Duration::from_secs(5), events.recv()).await?;
    assert_eq!(closed, None);
    assert_eq!(state(&manager, "serial")?, DiscoveryState::Dead);
    Ok(())
}

#[tokio::test]
async fn test_refused_quit_keeps_merged_stream_open() -> Result<()> {
    let manager = DiscoveryManager::new();
    register(&manager, "serial", MockBehavior::default())?;
    register(&manager, "stubborn", MockBehavior::default().with_quit(QuitBehavior::Refuse))?;
    manager.run_all().await;
    let (events, _) = manager.start_sync_all().await;

    let errors = manager.quit_all().await;
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].id(), "stubborn");
    assert_eq!(state(&manager, "serial")?, DiscoveryState::Dead);
    assert_eq!(state(&manager, "stubborn")?, DiscoveryState::Dead);

    // Still open: reads see an empty channel rather than closure
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(events.try_recv(), Err(TryRecvError::Empty));
    let (again, _) = manager.start_sync_all().await;
    assert!(again.same_stream(&events));
    Ok(())
}

#[tokio::test]
async fn test_list_merges_running_workers() -> Result<()> {
    let manager = DiscoveryManager::new();
    register(
        &manager,
        "a",
        MockBehavior::default().with_ports(vec![port("/dev/ttyACM0"), port("/dev/ttyACM1")]),
    )?;
    register(
        &manager,
        "b",
        MockBehavior::default().with_ports(vec![port("/dev/ttyS9")]),
    )?;
    register(&manager, "c", MockBehavior::default().failing_list("device busy"))?;
    assert!(manager.run_all().await.is_empty());

    for id in ["a", "c"] {
        manager.get(id).context("missing discovery")?.start().await?;
    }
    assert_eq!(state(&manager, "b")?, DiscoveryState::Idling);

    let (ports, errors) = manager.list().await;
    assert_eq!(ports, vec![port("/dev/ttyACM0"), port("/dev/ttyACM1")]);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].id(), "c");
    assert!(errors[0].to_string().contains("device busy"));

    manager.quit_all().await;
    Ok(())
}

#[tokio::test]
async fn test_list_sync_concatenates_syncing_workers() -> Result<()> {
    let manager = DiscoveryManager::new();
    register(
        &manager,
        "serial",
        MockBehavior::default().with_sync_ports(vec![port("COM1"), port("COM2")]),
    )?;
    register(
        &manager,
        "network",
        MockBehavior::default().with_sync_ports(vec![Port::new("192.168.1.7", "network")]),
    )?;
    assert!(manager.list_sync().is_empty());

    manager.run_all().await;
    assert!(manager.list_sync().is_empty());
    let (events, errors) = manager.start_sync_all().await;
    assert!(errors.is_empty());
    for _ in 0..3 {
        next_event(&events).await?;
    }

    let addresses: BTreeSet<String> = manager
        .list_sync()
        .into_iter()
        .map(|port| port.address)
        .collect();
    let expected: BTreeSet<String> = ["COM1", "COM2", "192.168.1.7"]
        .into_iter()
        .map(String::from)
        .collect();
    assert_eq!(addresses, expected);

    assert!(manager.stop_all().await.is_empty());
    assert!(manager.list_sync().is_empty());
    manager.quit_all().await;
    Ok(())
}

#[tokio::test]
async fn test_add_then_remove_round_trip() -> Result<()> {
    let manager = DiscoveryManager::new();
    let worker = register(&manager, "serial", MockBehavior::default())?;
    manager.run_all().await;
    let (events, _) = manager.start_sync_all().await;

    worker.emit(Event::add(port("/dev/ttyACM0")));
    next_event(&events).await?;
    assert_eq!(manager.list_sync(), vec![port("/dev/ttyACM0")]);

    worker.emit(Event::remove(port("/dev/ttyACM0")));
    next_event(&events).await?;
    assert!(manager.list_sync().is_empty());

    manager.quit_all().await;
    Ok(())
}

#[tokio::test]
async fn test_clear_always_empties_registry() -> Result<()> {
    let manager = DiscoveryManager::new();
    register(&manager, "serial", MockBehavior::default())?;
    register(&manager, "stubborn", MockBehavior::default().with_quit(QuitBehavior::Refuse))?;
    register(&manager, "hung", MockBehavior::default().with_quit(QuitBehavior::Hang))?;
    manager.run_all().await;
    let (events, _) = manager.start_sync_all().await;

    manager.clear().await;
    assert!(manager.is_empty());
    assert!(manager.ids().is_empty());

    let closed = tokio::time::timeout(Duration::from_secs(5), events.recv()).await?;
    assert_eq!(closed, None);
    let (fresh, errors) = manager.start_sync_all().await;
    assert!(errors.is_empty());
    assert!(!fresh.same_stream(&events));
    Ok(())
}

#[tokio::test]
async fn test_bulk_operations_skip_wrong_states() -> Result<()> {
    let manager = DiscoveryManager::new();
    register(&manager, "serial", MockBehavior::default())?;
    register(&manager, "mdns", MockBehavior::default())?;

    // Nothing is alive yet
    assert!(manager.start_all().await.is_empty());
    assert!(manager.stop_all().await.is_empty());
    assert_eq!(state(&manager, "serial")?, DiscoveryState::Dead);

    manager.run_all().await;
    manager.get("mdns").context("missing discovery")?.start().await?;
    assert!(manager.start_all().await.is_empty());
    assert_eq!(state(&manager, "serial")?, DiscoveryState::Running);

    // Running workers are not put in sync mode
    let (_events, errors) = manager.start_sync_all().await;
    assert!(errors.is_empty());
    assert_eq!(state(&manager, "mdns")?, DiscoveryState::Running);

    assert!(manager.stop_all().await.is_empty());
    assert_eq!(state(&manager, "serial")?, DiscoveryState::Idling);
    assert_eq!(state(&manager, "mdns")?, DiscoveryState::Idling);

    manager.quit_all().await;
    Ok(())
}
