// Integration tests for per-network health checking

mod common;

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use common::{fast_settings, membership, wait_until, ScriptedDriver};
use overlay_agent::node::LocalNode;
use overlay_agent::overlay::{NetworkCommand, NetworkPhase, SessionBoard, SessionManager};

const WAIT: Duration = Duration::from_secs(5);

fn manager(driver: Arc<ScriptedDriver>, board: SessionBoard) -> SessionManager {
    SessionManager::new(
        driver,
        board,
        fast_settings().overlay,
        LocalNode::new(Uuid::new_v4(), Some("test-host".into())),
        CancellationToken::new(),
    )
}

#[tokio::test]
async fn test_probes_run_while_joined() -> Result<()> {
    let driver = ScriptedDriver::new();
    let board = SessionBoard::new();
    let handle = manager(driver.clone(), board.clone()).spawn_network("alpha", None);
    handle
        .send(NetworkCommand::Join(membership("alpha", "a", "tcp://10.0.0.1:11010")))
        .await;

    assert!(wait_until(WAIT, || driver.probes() >= 3).await);
    assert_eq!(board.phase("alpha"), Some(NetworkPhase::Joined));
    assert_eq!(driver.establishes(), 1);

    handle.retire().await?;
    assert!(board.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_threshold_failures_degrade_and_rejoin_once() -> Result<()> {
    let driver = ScriptedDriver::new();
    let board = SessionBoard::new();
    let handle = manager(driver.clone(), board.clone()).spawn_network("alpha", None);
    handle
        .send(NetworkCommand::Join(membership("alpha", "a", "tcp://10.0.0.1:11010")))
        .await;
    assert!(wait_until(WAIT, || board.phase("alpha") == Some(NetworkPhase::Joined)).await);
    let address = board.get("alpha").unwrap().session.unwrap().virtual_ipv4;

    // Rejoins fail while peers are unreachable, so the session stays degraded.
    driver.set_fail_probes(true);
    driver.set_unreachable(true);
    let probes_before = driver.probes();

    assert!(wait_until(WAIT, || board.phase("alpha") == Some(NetworkPhase::Degraded)).await);
    assert!(wait_until(WAIT, || driver.establishes() == 2).await);
    let probes_at_first_rejoin = driver.probes();
    assert!(probes_at_first_rejoin - probes_before >= 3);

    // The next rejoin needs another full run of failed probes.
    assert!(wait_until(WAIT, || driver.establishes() == 3).await);
    assert!(driver.probes() - probes_at_first_rejoin >= 3);

    let status = board.get("alpha").unwrap();
    assert_eq!(status.phase, NetworkPhase::Degraded);
    assert!(status.last_error.is_some());
    assert!(status.session.is_some());

    // Peers come back: the next rejoin restores the same address.
    driver.set_unreachable(false);
    driver.set_fail_probes(false);
    assert!(wait_until(WAIT, || board.phase("alpha") == Some(NetworkPhase::Joined)).await);
    assert_eq!(board.get("alpha").unwrap().session.unwrap().virtual_ipv4, address);

    handle.retire().await?;
    assert_eq!(driver.live_links(), 0);
    Ok(())
}

#[tokio::test]
async fn test_isolated_failure_does_not_degrade() -> Result<()> {
    let driver = ScriptedDriver::new();
    let board = SessionBoard::new();
    let handle = manager(driver.clone(), board.clone()).spawn_network("alpha", None);
    handle
        .send(NetworkCommand::Join(membership("alpha", "a", "tcp://10.0.0.1:11010")))
        .await;
    assert!(wait_until(WAIT, || board.phase("alpha") == Some(NetworkPhase::Joined)).await);

    let start = driver.probes();
    driver.set_fail_probes(true);
    assert!(wait_until(WAIT, || driver.probes() >= start + 1).await);
    driver.set_fail_probes(false);
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(board.phase("alpha"), Some(NetworkPhase::Joined));
    assert_eq!(driver.establishes(), 1);

    handle.retire().await?;
    Ok(())
}
