//! Global kill switch: two runners for distinct users both stop within the
//! bounded reaction time, and starting a strategy while the switch is
//! active is refused.

use std::sync::Arc;
use std::time::{Duration, Instant};

use adk_killswitch::{KillSwitchStore, MemoryKillSwitch};
use adk_runtime::{RestartPolicy, StartSpec, Supervisor};
use adk_strategy::ConfigMap;
use adk_testkit::{buy_order, context, limits, test_registry};

fn spec(subscription_id: &str, user_id: &str) -> StartSpec {
    StartSpec {
        subscription_id: subscription_id.to_string(),
        user_id: user_id.to_string(),
        strategy_name: "emit_on_tick".to_string(),
        strategy_config: ConfigMap::new(),
        context: context(subscription_id, user_id, 100_000),
        limits: limits(),
        symbols: vec!["NSE:SBIN".to_string()],
        dry_run: true,
        restore_state: None,
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn global_kill_switch_stops_every_runner_and_blocks_starts() {
    let store: Arc<MemoryKillSwitch> = Arc::new(MemoryKillSwitch::new());
    let registry = test_registry(buy_order("SBIN", 5), 1);
    let (supervisor, _orders) = Supervisor::new(
        registry,
        Arc::clone(&store) as Arc<dyn KillSwitchStore>,
        RestartPolicy::default(),
        64,
    );
    supervisor.start().await.unwrap();

    assert!(supervisor.start_strategy(spec("sub-1", "user-1")).await.unwrap());
    assert!(supervisor.start_strategy(spec("sub-2", "user-2")).await.unwrap());
    assert_eq!(supervisor.active_runner_count(), 2);

    store.activate_global("market halt", "admin").await.unwrap();

    // Both runners must stop within the bounded reaction window (<= 1 s
    // target; allow scheduling slack).
    let deadline = Instant::now() + Duration::from_secs(5);
    while supervisor.active_runner_count() > 0 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert_eq!(supervisor.active_runner_count(), 0, "runners survived the halt");

    // Starting while the switch is active is refused.
    assert!(!supervisor.start_strategy(spec("sub-3", "user-3")).await.unwrap());

    // After deactivation starts succeed again.
    store.deactivate_global("admin").await.unwrap();
    assert!(supervisor.start_strategy(spec("sub-3", "user-3")).await.unwrap());
    supervisor.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn user_kill_switch_stops_only_that_users_runners() {
    let store: Arc<MemoryKillSwitch> = Arc::new(MemoryKillSwitch::new());
    let registry = test_registry(buy_order("SBIN", 5), 1);
    let (supervisor, _orders) = Supervisor::new(
        registry,
        Arc::clone(&store) as Arc<dyn KillSwitchStore>,
        RestartPolicy::default(),
        64,
    );
    supervisor.start().await.unwrap();

    supervisor.start_strategy(spec("sub-1", "user-1")).await.unwrap();
    supervisor.start_strategy(spec("sub-2", "user-2")).await.unwrap();

    store
        .activate_for_user("user-1", "manual stop", "admin")
        .await
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let status_1 = supervisor.status("sub-1").map(|s| s.is_alive).unwrap_or(false);
        if !status_1 || Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    assert!(!supervisor.status("sub-1").map(|s| s.is_alive).unwrap_or(false));
    assert!(supervisor.status("sub-2").map(|s| s.is_alive).unwrap_or(false));
    supervisor.shutdown().await;
}
