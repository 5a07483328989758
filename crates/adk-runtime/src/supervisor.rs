//! The supervisor owns every runner.
//!
//! Background tasks once started:
//! - health monitor (~5 s): restarts crashed runners with bounded
//!   exponential backoff (1, 2, 4, 8, 16 s; give up after 5 failures in a
//!   rolling 10 minute window) and keeps the kill-switch cache fresh
//! - result drainer (~10 ms): routes runner results — orders to the
//!   execution engine, kill-switch triggers to the store plus a stop of the
//!   affected runner, faults to the log
//! - kill-switch listener: applies events to the cache and cascades stops
//!
//! Ordering: commands and ticks to a single runner are FIFO; nothing is
//! promised across runners.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use adk_killswitch::{KillSwitchCache, KillSwitchEvent, KillSwitchStore};
use adk_schemas::{feed_key, MarketTick, RiskLimits, StrategyContext};
use adk_strategy::{ConfigMap, StateMap, StrategyRegistry};
use anyhow::{anyhow, Context, Result};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::runner::{RunnerHandle, RunnerSpawn};
use crate::types::{OrderEnvelope, RunnerCommand, RunnerResult, RunnerStatus};

/// Default graceful stop timeout.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Start spec and policy
// ---------------------------------------------------------------------------

/// Everything needed to start (or restart) one subscription.
#[derive(Clone)]
pub struct StartSpec {
    pub subscription_id: String,
    pub user_id: String,
    pub strategy_name: String,
    pub strategy_config: ConfigMap,
    pub context: StrategyContext,
    pub limits: RiskLimits,
    /// Feed keys (`"NSE:SBIN"`) or bare symbols this subscription consumes.
    pub symbols: Vec<String>,
    pub dry_run: bool,
    /// Serialized strategy state to restore, e.g. after a crash.
    pub restore_state: Option<StateMap>,
}

/// Bounded restart backoff for crashed runners.
#[derive(Clone, Debug)]
pub struct RestartPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub max_failures: usize,
    pub failure_window: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(16),
            max_failures: 5,
            failure_window: Duration::from_secs(600),
        }
    }
}

impl RestartPolicy {
    /// 1, 2, 4, 8 seconds, capped at `max_backoff`.
    fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(8)).unwrap_or(u32::MAX);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Per-subscription status snapshot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SupervisorStatus {
    pub subscription_id: String,
    pub is_running: bool,
    pub is_paused: bool,
    pub is_alive: bool,
    pub failed: bool,
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

struct RunnerMeta {
    spec: StartSpec,
    should_be_running: bool,
    last_state: Option<StateMap>,
    failed: bool,
}

#[derive(Default)]
struct RestartTracker {
    failures: Vec<Instant>,
    attempt: u32,
    next_attempt_at: Option<Instant>,
}

/// The supervisor. Shared behind an `Arc`; all maps behind plain mutexes
/// that are never held across awaits.
pub struct Supervisor {
    registry: Arc<StrategyRegistry>,
    kill_switch: Arc<dyn KillSwitchStore>,
    cache: Arc<KillSwitchCache>,
    policy: RestartPolicy,
    feed_buffer: usize,
    order_tx: mpsc::Sender<OrderEnvelope>,

    runners: Mutex<HashMap<String, RunnerHandle>>,
    symbol_index: Mutex<HashMap<String, HashSet<String>>>,
    meta: Mutex<HashMap<String, RunnerMeta>>,
    restarts: Mutex<HashMap<String, RestartTracker>>,
    running: AtomicBool,
}

impl Supervisor {
    /// Build a supervisor. The returned receiver carries allowed orders for
    /// the execution engine.
    pub fn new(
        registry: Arc<StrategyRegistry>,
        kill_switch: Arc<dyn KillSwitchStore>,
        policy: RestartPolicy,
        feed_buffer: usize,
    ) -> (Arc<Self>, mpsc::Receiver<OrderEnvelope>) {
        let (order_tx, order_rx) = mpsc::channel(1_024);
        let supervisor = Arc::new(Self {
            registry,
            kill_switch,
            cache: Arc::new(KillSwitchCache::new()),
            policy,
            feed_buffer,
            order_tx,
            runners: Mutex::new(HashMap::new()),
            symbol_index: Mutex::new(HashMap::new()),
            meta: Mutex::new(HashMap::new()),
            restarts: Mutex::new(HashMap::new()),
            running: AtomicBool::new(false),
        });
        (supervisor, order_rx)
    }

    pub fn kill_switch_cache(&self) -> Arc<KillSwitchCache> {
        Arc::clone(&self.cache)
    }

    /// Start the background tasks.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let events = self
            .kill_switch
            .subscribe_events()
            .await
            .context("kill-switch subscription failed")?;

        let health = Arc::clone(self);
        tokio::spawn(async move { health.health_loop().await });

        let drainer = Arc::clone(self);
        tokio::spawn(async move { drainer.result_loop().await });

        let listener = Arc::clone(self);
        tokio::spawn(async move { listener.kill_switch_loop(events).await });

        info!("supervisor started");
        Ok(())
    }

    /// Stop every runner and the background tasks.
    pub async fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        for subscription_id in self.subscription_ids() {
            self.stop_strategy(&subscription_id, DEFAULT_STOP_TIMEOUT)
                .await;
        }
        info!("supervisor shut down");
    }

    fn subscription_ids(&self) -> Vec<String> {
        self.runners
            .lock()
            .expect("runners map poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// (subscription, user) pairs of active runners, for cache refresh.
    pub fn active_pairs(&self) -> Vec<(String, String)> {
        self.meta
            .lock()
            .expect("meta map poisoned")
            .iter()
            .map(|(sub, meta)| (sub.clone(), meta.spec.user_id.clone()))
            .collect()
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    /// Start a strategy for a subscription. Refuses when the subscription is
    /// already running or any kill-switch scope covering it is active.
    pub async fn start_strategy(&self, spec: StartSpec) -> Result<bool> {
        {
            let runners = self.runners.lock().expect("runners map poisoned");
            if runners.contains_key(&spec.subscription_id) {
                return Ok(false);
            }
        }
        if self
            .kill_switch
            .is_strategy_active(&spec.subscription_id, &spec.user_id)
            .await?
        {
            warn!(
                subscription_id = %spec.subscription_id,
                "refusing start: kill switch active"
            );
            return Ok(false);
        }

        self.spawn_runner(&spec)?;

        let mut meta = self.meta.lock().expect("meta map poisoned");
        meta.insert(
            spec.subscription_id.clone(),
            RunnerMeta {
                spec,
                should_be_running: true,
                last_state: None,
                failed: false,
            },
        );
        Ok(true)
    }

    fn spawn_runner(&self, spec: &StartSpec) -> Result<()> {
        let mut strategy = self
            .registry
            .instantiate_configured(&spec.strategy_name, &spec.strategy_config)
            .map_err(|err| anyhow!("strategy load failed: {err}"))?;
        if let Some(state) = &spec.restore_state {
            strategy.set_state(state);
        }

        let handle = RunnerHandle::spawn(RunnerSpawn {
            subscription_id: spec.subscription_id.clone(),
            user_id: spec.user_id.clone(),
            strategy,
            context: spec.context.clone(),
            limits: spec.limits.clone(),
            kill_switch_cache: Arc::clone(&self.cache),
            feed_buffer: self.feed_buffer,
        });

        {
            let mut index = self.symbol_index.lock().expect("symbol index poisoned");
            for symbol in &spec.symbols {
                index
                    .entry(symbol.clone())
                    .or_default()
                    .insert(spec.subscription_id.clone());
            }
        }
        self.runners
            .lock()
            .expect("runners map poisoned")
            .insert(spec.subscription_id.clone(), handle);
        Ok(())
    }

    /// Stop a strategy: STOP command, bounded wait, unregister. After a
    /// successful return the subscription is in neither the runner map nor
    /// any symbol-index set.
    pub async fn stop_strategy(&self, subscription_id: &str, timeout: Duration) -> bool {
        let handle = {
            let mut runners = self.runners.lock().expect("runners map poisoned");
            runners.remove(subscription_id)
        };
        {
            let mut index = self.symbol_index.lock().expect("symbol index poisoned");
            index.retain(|_, subs| {
                subs.remove(subscription_id);
                !subs.is_empty()
            });
        }
        {
            let mut meta = self.meta.lock().expect("meta map poisoned");
            if let Some(entry) = meta.get_mut(subscription_id) {
                entry.should_be_running = false;
            }
        }

        let Some(mut handle) = handle else {
            return false;
        };
        tokio::task::spawn_blocking(move || handle.stop(timeout))
            .await
            .unwrap_or(false)
    }

    pub fn pause_strategy(&self, subscription_id: &str) -> bool {
        let runners = self.runners.lock().expect("runners map poisoned");
        runners
            .get(subscription_id)
            .map(|h| h.send_command(RunnerCommand::Pause))
            .unwrap_or(false)
    }

    pub fn resume_strategy(&self, subscription_id: &str) -> bool {
        let runners = self.runners.lock().expect("runners map poisoned");
        runners
            .get(subscription_id)
            .map(|h| h.send_command(RunnerCommand::Resume))
            .unwrap_or(false)
    }

    pub fn update_context(&self, subscription_id: &str, context: StrategyContext) -> bool {
        let runners = self.runners.lock().expect("runners map poisoned");
        runners
            .get(subscription_id)
            .map(|h| h.send_command(RunnerCommand::UpdateContext(Box::new(context))))
            .unwrap_or(false)
    }

    /// Fan a tick out to its subscribers. O(1) index lookup; the per-runner
    /// buffer drops oldest on overflow so the feed never blocks.
    pub fn distribute_market_data(&self, tick: &MarketTick) {
        let subscribers: Vec<String> = {
            let index = self.symbol_index.lock().expect("symbol index poisoned");
            let mut subs: HashSet<String> = index
                .get(&feed_key(&tick.exchange, &tick.symbol))
                .cloned()
                .unwrap_or_default();
            if let Some(bare) = index.get(&tick.symbol) {
                subs.extend(bare.iter().cloned());
            }
            subs.into_iter().collect()
        };
        if subscribers.is_empty() {
            return;
        }

        let runners = self.runners.lock().expect("runners map poisoned");
        for subscription_id in subscribers {
            if let Some(handle) = runners.get(&subscription_id) {
                if !handle.is_paused() {
                    handle.send_market_data(tick.clone());
                }
            }
        }
    }

    pub fn status(&self, subscription_id: &str) -> Option<SupervisorStatus> {
        let runners = self.runners.lock().expect("runners map poisoned");
        let meta = self.meta.lock().expect("meta map poisoned");
        let entry = meta.get(subscription_id)?;
        let handle = runners.get(subscription_id);
        Some(SupervisorStatus {
            subscription_id: subscription_id.to_string(),
            is_running: entry.should_be_running,
            is_paused: handle.map(|h| h.is_paused()).unwrap_or(false),
            is_alive: handle.map(|h| h.is_alive()).unwrap_or(false),
            failed: entry.failed,
        })
    }

    pub fn all_status(&self) -> Vec<SupervisorStatus> {
        let ids: Vec<String> = self
            .meta
            .lock()
            .expect("meta map poisoned")
            .keys()
            .cloned()
            .collect();
        ids.iter().filter_map(|id| self.status(id)).collect()
    }

    pub fn active_runner_count(&self) -> usize {
        self.runners.lock().expect("runners map poisoned").len()
    }

    /// Simulate an isolation-unit crash for restart-policy scenarios.
    #[cfg(feature = "testkit")]
    pub fn sever_runner_for_test(&self, subscription_id: &str) -> bool {
        let mut runners = self.runners.lock().expect("runners map poisoned");
        match runners.get_mut(subscription_id) {
            Some(handle) => {
                handle.sever_for_test();
                true
            }
            None => false,
        }
    }

    // -----------------------------------------------------------------------
    // Background loops
    // -----------------------------------------------------------------------

    async fn result_loop(self: Arc<Self>) {
        while self.running.load(Ordering::SeqCst) {
            let results: Vec<RunnerResult> = {
                let runners = self.runners.lock().expect("runners map poisoned");
                let mut drained = Vec::new();
                for handle in runners.values() {
                    while let Some(result) = handle.try_recv_result() {
                        drained.push(result);
                        if drained.len() >= 256 {
                            break;
                        }
                    }
                }
                drained
            };

            for result in results {
                self.route_result(result).await;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn route_result(&self, result: RunnerResult) {
        match result {
            RunnerResult::Order {
                subscription_id,
                order,
                market_price_micros,
            } => {
                let envelope = {
                    let meta = self.meta.lock().expect("meta map poisoned");
                    meta.get(&subscription_id).map(|entry| OrderEnvelope {
                        subscription_id: subscription_id.clone(),
                        user_id: entry.spec.user_id.clone(),
                        strategy_name: entry.spec.strategy_name.clone(),
                        order,
                        market_price_micros,
                        dry_run: entry.spec.dry_run,
                    })
                };
                if let Some(envelope) = envelope {
                    if self.order_tx.send(envelope).await.is_err() {
                        error!("order channel closed; execution engine gone");
                    }
                }
            }
            RunnerResult::KillSwitchTrigger {
                subscription_id,
                reason,
                limit_type,
            } => {
                warn!(%subscription_id, %limit_type, "risk denial escalated to kill switch");
                if let Err(err) = self
                    .kill_switch
                    .activate_for_strategy(&subscription_id, &reason, "system")
                    .await
                {
                    error!(%err, "kill-switch activation failed");
                }
                self.stop_strategy(&subscription_id, DEFAULT_STOP_TIMEOUT)
                    .await;
            }
            RunnerResult::RiskBlocked {
                subscription_id,
                reason,
                limit_type,
                symbol,
            } => {
                debug!(%subscription_id, %symbol, %limit_type, %reason, "order risk-blocked");
            }
            RunnerResult::Error {
                subscription_id,
                error,
                ..
            } => {
                error!(%subscription_id, %error, "strategy fault");
            }
            RunnerResult::Status {
                subscription_id,
                status,
                state,
            } => {
                if status == RunnerStatus::Stopped {
                    let mut meta = self.meta.lock().expect("meta map poisoned");
                    if let Some(entry) = meta.get_mut(&subscription_id) {
                        if let Some(state) = state {
                            entry.last_state = Some(state);
                        }
                        // A runner that stopped on its own (repeat faults,
                        // graceful stop) must not be restarted.
                        entry.should_be_running = false;
                    }
                }
                debug!(%subscription_id, ?status, "runner status");
            }
        }
    }

    async fn health_loop(self: Arc<Self>) {
        while self.running.load(Ordering::SeqCst) {
            if self.cache.is_stale() {
                let pairs = self.active_pairs();
                if let Err(err) = self.cache.refresh(self.kill_switch.as_ref(), &pairs).await {
                    warn!(%err, "kill-switch cache refresh failed");
                }
            }

            let dead: Vec<String> = {
                let runners = self.runners.lock().expect("runners map poisoned");
                let meta = self.meta.lock().expect("meta map poisoned");
                meta.iter()
                    .filter(|(sub, entry)| {
                        entry.should_be_running
                            && !entry.failed
                            && runners.get(*sub).map(|h| !h.is_alive()).unwrap_or(true)
                    })
                    .map(|(sub, _)| sub.clone())
                    .collect()
            };
            for subscription_id in dead {
                self.attempt_restart(&subscription_id).await;
            }

            tokio::time::sleep(Duration::from_secs(5)).await;
        }
    }

    async fn attempt_restart(&self, subscription_id: &str) {
        let now = Instant::now();
        let action = {
            let mut restarts = self.restarts.lock().expect("restart map poisoned");
            let tracker = restarts.entry(subscription_id.to_string()).or_default();
            tracker
                .failures
                .retain(|t| now.duration_since(*t) < self.policy.failure_window);

            if let Some(at) = tracker.next_attempt_at {
                if now < at {
                    return; // backoff still in effect
                }
                tracker.next_attempt_at = None;
                RestartAction::Respawn
            } else if tracker.failures.len() >= self.policy.max_failures {
                RestartAction::GiveUp
            } else {
                tracker.failures.push(now);
                let delay = self.policy.backoff_for_attempt(tracker.attempt);
                tracker.attempt += 1;
                tracker.next_attempt_at = Some(now + delay);
                warn!(
                    %subscription_id,
                    failures = tracker.failures.len(),
                    ?delay,
                    "runner crashed, scheduling restart"
                );
                RestartAction::Wait
            }
        };

        match action {
            RestartAction::Wait => {}
            RestartAction::GiveUp => {
                error!(
                    %subscription_id,
                    "restart budget exhausted, marking subscription failed"
                );
                {
                    let mut meta = self.meta.lock().expect("meta map poisoned");
                    if let Some(entry) = meta.get_mut(subscription_id) {
                        entry.failed = true;
                        entry.should_be_running = false;
                    }
                }
                self.stop_strategy(subscription_id, Duration::from_secs(1))
                    .await;
                // Notification hook: downstream alerting tails this target.
                warn!(target: "notifications", %subscription_id, "subscription marked failed");
            }
            RestartAction::Respawn => {
                let spec = {
                    let meta = self.meta.lock().expect("meta map poisoned");
                    meta.get(subscription_id).map(|entry| {
                        let mut spec = entry.spec.clone();
                        spec.restore_state = entry.last_state.clone();
                        spec
                    })
                };
                let Some(spec) = spec else { return };

                // Drop the dead handle before respawning.
                self.runners
                    .lock()
                    .expect("runners map poisoned")
                    .remove(subscription_id);

                match self.spawn_runner(&spec) {
                    Ok(()) => info!(%subscription_id, "runner restarted"),
                    Err(err) => error!(%subscription_id, %err, "runner restart failed"),
                }
            }
        }
    }

    async fn kill_switch_loop(self: Arc<Self>, mut events: mpsc::Receiver<KillSwitchEvent>) {
        while let Some(event) = events.recv().await {
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            self.cache.apply_event(&event);

            match event {
                KillSwitchEvent::GlobalStop { reason, .. } => {
                    warn!(%reason, "global kill switch: stopping all runners");
                    for subscription_id in self.subscription_ids() {
                        self.stop_strategy(&subscription_id, DEFAULT_STOP_TIMEOUT)
                            .await;
                    }
                }
                KillSwitchEvent::UserStop { user_id, reason } => {
                    warn!(%user_id, %reason, "user kill switch: stopping user's runners");
                    let matching: Vec<String> = {
                        let runners = self.runners.lock().expect("runners map poisoned");
                        runners
                            .iter()
                            .filter(|(_, h)| h.user_id == user_id)
                            .map(|(sub, _)| sub.clone())
                            .collect()
                    };
                    for subscription_id in matching {
                        self.stop_strategy(&subscription_id, DEFAULT_STOP_TIMEOUT)
                            .await;
                    }
                }
                KillSwitchEvent::StrategyStop {
                    subscription_id, ..
                } => {
                    self.stop_strategy(&subscription_id, DEFAULT_STOP_TIMEOUT)
                        .await;
                }
                KillSwitchEvent::GlobalResume { .. } | KillSwitchEvent::UserResume { .. } => {}
            }
        }
    }
}

enum RestartAction {
    Wait,
    Respawn,
    GiveUp,
}
