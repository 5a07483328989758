//! Drawdown breach: the next entry is RISK_BLOCKED with `max_drawdown`, the
//! runner emits a KILL_SWITCH_TRIGGER, the supervisor upgrades it to a
//! subscription-scoped activation, stops the runner, and subsequent starts
//! are blocked without consulting the risk manager.

use std::sync::Arc;
use std::time::{Duration, Instant};

use adk_killswitch::{KillSwitchStore, MemoryKillSwitch};
use adk_runtime::{RestartPolicy, StartSpec, Supervisor};
use adk_schemas::MICROS_SCALE;
use adk_strategy::ConfigMap;
use adk_testkit::{buy_order, context, limits, test_registry, tick};

#[tokio::test(flavor = "multi_thread")]
async fn drawdown_breach_escalates_to_strategy_kill_switch() {
    let store: Arc<MemoryKillSwitch> = Arc::new(MemoryKillSwitch::new());
    let registry = test_registry(buy_order("SBIN", 5), 1);
    let (supervisor, _orders) = Supervisor::new(
        registry,
        Arc::clone(&store) as Arc<dyn KillSwitchStore>,
        RestartPolicy::default(),
        64,
    );
    supervisor.start().await.unwrap();

    // max_drawdown 10% of 1,00,000 capital; -10,001 breaches it.
    let mut ctx = context("sub-dd", "user-dd", 100_000);
    ctx.total_pnl_micros = -10_001 * MICROS_SCALE;

    let spec = StartSpec {
        subscription_id: "sub-dd".to_string(),
        user_id: "user-dd".to_string(),
        strategy_name: "emit_on_tick".to_string(),
        strategy_config: ConfigMap::new(),
        context: ctx,
        limits: limits(),
        symbols: vec!["NSE:SBIN".to_string()],
        dry_run: true,
        restore_state: None,
    };
    assert!(supervisor.start_strategy(spec.clone()).await.unwrap());

    // Deliver the tick that provokes the blocked entry.
    supervisor.distribute_market_data(&tick("SBIN", "NSE", 100.0, 0));

    // The supervisor reacts by activating the strategy scope and stopping
    // the runner.
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if store
            .is_strategy_active("sub-dd", "user-dd")
            .await
            .unwrap()
            && supervisor.active_runner_count() == 0
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert!(store.is_strategy_active("sub-dd", "user-dd").await.unwrap());
    assert_eq!(supervisor.active_runner_count(), 0);

    // The user and global scopes stay untouched.
    assert!(!store.is_user_active("user-dd").await.unwrap());
    assert!(!store.is_global_active().await.unwrap());

    // Restart attempts are blocked by the switch alone.
    assert!(!supervisor.start_strategy(spec).await.unwrap());
    supervisor.shutdown().await;
}
