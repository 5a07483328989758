//! The strategy runner: one isolated execution unit per subscription.
//!
//! The runner owns exactly one strategy instance on a dedicated OS thread.
//! Transport in and out is message queues only: commands (FIFO), market
//! ticks (bounded ring, drop-oldest), results (FIFO). Every strategy call is
//! wrapped in `catch_unwind` so a panicking strategy surfaces an ERROR
//! result instead of taking the thread down; after
//! [`MAX_CONSECUTIVE_FAULTS`] consecutive faults the runner stops itself.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use adk_killswitch::KillSwitchCache;
use adk_risk::{check_order, KillSwitchSnapshot, RiskDecision};
use adk_schemas::{trading_day_ist, MarketTick, RiskLimits, StrategyContext};
use adk_strategy::Strategy;
use crossbeam::queue::ArrayQueue;
use tracing::{info, warn};

use crate::types::{RunnerCommand, RunnerResult, RunnerStatus};

/// Consecutive strategy faults before the runner stops itself.
pub const MAX_CONSECUTIVE_FAULTS: u32 = 10;

/// Sleep while paused.
const PAUSE_IDLE: Duration = Duration::from_millis(100);
/// Sleep when the tick queue is empty.
const TICK_IDLE: Duration = Duration::from_millis(10);

/// Everything a runner needs at spawn time.
pub struct RunnerSpawn {
    pub subscription_id: String,
    pub user_id: String,
    pub strategy: Box<dyn Strategy>,
    pub context: StrategyContext,
    pub limits: RiskLimits,
    pub kill_switch_cache: Arc<KillSwitchCache>,
    /// Tick buffer capacity; the feed never blocks, the oldest tick is
    /// dropped when full.
    pub feed_buffer: usize,
}

/// Supervisor-side handle to a running strategy.
pub struct RunnerHandle {
    pub subscription_id: String,
    pub user_id: String,
    command_tx: Sender<RunnerCommand>,
    result_rx: Receiver<RunnerResult>,
    tick_queue: Arc<ArrayQueue<MarketTick>>,
    paused: Arc<AtomicBool>,
    join: Option<std::thread::JoinHandle<()>>,
    /// Ticks dropped due to backpressure, for observability.
    dropped_ticks: AtomicU64,
}

impl RunnerHandle {
    /// Spawn the runner thread.
    pub fn spawn(spawn: RunnerSpawn) -> Self {
        let (command_tx, command_rx) = std::sync::mpsc::channel();
        let (result_tx, result_rx) = std::sync::mpsc::channel();
        let tick_queue = Arc::new(ArrayQueue::new(spawn.feed_buffer.max(1)));
        let paused = Arc::new(AtomicBool::new(false));

        let subscription_id = spawn.subscription_id.clone();
        let user_id = spawn.user_id.clone();
        let thread_queue = Arc::clone(&tick_queue);
        let thread_paused = Arc::clone(&paused);

        let join = std::thread::Builder::new()
            .name(format!("runner-{subscription_id}"))
            .spawn(move || {
                runner_main(spawn, thread_queue, command_rx, result_tx, thread_paused)
            })
            .expect("spawning a runner thread cannot fail");

        Self {
            subscription_id,
            user_id,
            command_tx,
            result_rx,
            tick_queue,
            paused,
            join: Some(join),
            dropped_ticks: AtomicU64::new(0),
        }
    }

    /// True while the isolation unit is alive.
    pub fn is_alive(&self) -> bool {
        self.join.as_ref().map(|j| !j.is_finished()).unwrap_or(false)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Send a command; false when the runner thread is gone.
    pub fn send_command(&self, command: RunnerCommand) -> bool {
        match &command {
            RunnerCommand::Pause => self.paused.store(true, Ordering::SeqCst),
            RunnerCommand::Resume => self.paused.store(false, Ordering::SeqCst),
            _ => {}
        }
        self.command_tx.send(command).is_ok()
    }

    /// Push a tick; on a full buffer the oldest tick is dropped so the feed
    /// never blocks.
    pub fn send_market_data(&self, tick: MarketTick) {
        if self.tick_queue.force_push(tick).is_some() {
            // force_push returned the displaced element: buffer was full.
            let dropped = self.dropped_ticks.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(
                subscription_id = %self.subscription_id,
                dropped,
                "tick buffer full, dropped oldest"
            );
        }
    }

    /// Total ticks dropped on the full buffer since spawn.
    pub fn dropped_tick_count(&self) -> u64 {
        self.dropped_ticks.load(Ordering::Relaxed)
    }

    /// Non-blocking result drain.
    pub fn try_recv_result(&self) -> Option<RunnerResult> {
        match self.result_rx.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Simulate an isolation-unit crash: drop the command channel so the
    /// runner thread exits without a final STATUS. The health monitor then
    /// sees a dead unit that should be running.
    #[cfg(feature = "testkit")]
    pub fn sever_for_test(&mut self) {
        let (tx, _) = std::sync::mpsc::channel();
        self.command_tx = tx;
    }

    /// Graceful stop: send STOP and wait up to `timeout` for the thread to
    /// exit. A thread cannot be force-killed; on timeout the runner is
    /// abandoned (detached) and reported as not stopped.
    pub fn stop(&mut self, timeout: Duration) -> bool {
        let _ = self.send_command(RunnerCommand::Stop);
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.join.as_ref().map(|j| j.is_finished()).unwrap_or(true) {
                if let Some(join) = self.join.take() {
                    let _ = join.join();
                }
                return true;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        warn!(
            subscription_id = %self.subscription_id,
            "runner did not stop within {timeout:?}, abandoning thread"
        );
        self.join.take();
        false
    }
}

// ---------------------------------------------------------------------------
// Runner main loop
// ---------------------------------------------------------------------------

fn emit(result_tx: &Sender<RunnerResult>, result: RunnerResult) {
    // A closed channel means the supervisor dropped us; nothing to do.
    let _ = result_tx.send(result);
}

fn status(
    result_tx: &Sender<RunnerResult>,
    subscription_id: &str,
    status: RunnerStatus,
    state: Option<adk_strategy::StateMap>,
) {
    emit(
        result_tx,
        RunnerResult::Status {
            subscription_id: subscription_id.to_string(),
            status,
            state,
        },
    );
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn runner_main(
    spawn: RunnerSpawn,
    tick_queue: Arc<ArrayQueue<MarketTick>>,
    command_rx: Receiver<RunnerCommand>,
    result_tx: Sender<RunnerResult>,
    paused_flag: Arc<AtomicBool>,
) {
    let RunnerSpawn {
        subscription_id,
        user_id,
        mut strategy,
        mut context,
        limits,
        kill_switch_cache,
        ..
    } = spawn;

    // Start the strategy; a failing on_start kills the runner cleanly.
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| strategy.on_start())) {
        emit(
            &result_tx,
            RunnerResult::Error {
                subscription_id: subscription_id.clone(),
                error: format!("on_start panicked: {}", panic_message(payload)),
                backtrace: std::backtrace::Backtrace::force_capture().to_string(),
            },
        );
        status(&result_tx, &subscription_id, RunnerStatus::Stopped, None);
        return;
    }
    status(&result_tx, &subscription_id, RunnerStatus::Started, None);
    info!(%subscription_id, "runner started");

    let mut paused = false;
    let mut today_trade_count: u32 = 0;
    let mut trade_day: Option<chrono::NaiveDate> = None;
    let mut consecutive_faults: u32 = 0;

    loop {
        // 1. Drain pending commands, non-blocking, in send order.
        loop {
            match command_rx.try_recv() {
                Ok(RunnerCommand::Stop) => {
                    let _ = panic::catch_unwind(AssertUnwindSafe(|| strategy.on_stop()));
                    let state = panic::catch_unwind(AssertUnwindSafe(|| strategy.get_state())).ok();
                    status(&result_tx, &subscription_id, RunnerStatus::Stopped, state);
                    info!(%subscription_id, "runner stopped");
                    return;
                }
                Ok(RunnerCommand::Pause) => {
                    let _ = panic::catch_unwind(AssertUnwindSafe(|| strategy.on_pause()));
                    paused = true;
                    paused_flag.store(true, Ordering::SeqCst);
                    status(&result_tx, &subscription_id, RunnerStatus::Paused, None);
                }
                Ok(RunnerCommand::Resume) => {
                    let _ = panic::catch_unwind(AssertUnwindSafe(|| strategy.on_resume()));
                    paused = false;
                    paused_flag.store(false, Ordering::SeqCst);
                    status(&result_tx, &subscription_id, RunnerStatus::Resumed, None);
                }
                Ok(RunnerCommand::UpdateContext(new_context)) => {
                    context = *new_context;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    // Supervisor is gone; shut down quietly.
                    let _ = panic::catch_unwind(AssertUnwindSafe(|| strategy.on_stop()));
                    return;
                }
            }
        }

        // 2. Idle while paused.
        if paused {
            std::thread::sleep(PAUSE_IDLE);
            continue;
        }

        // 3. Wait for the next tick.
        let Some(tick) = tick_queue.pop() else {
            std::thread::sleep(TICK_IDLE);
            continue;
        };

        // Daily trade counter rolls over on the IST trading day.
        let day = trading_day_ist(tick.ts);
        if trade_day != Some(day) {
            trade_day = Some(day);
            today_trade_count = 0;
        }

        // The runtime owns position marks; refresh before the strategy sees
        // the tick.
        let mut marks = std::collections::BTreeMap::new();
        marks.insert(tick.symbol.clone(), tick.ltp_micros);
        context.refresh_unrealized(&marks);

        // 4. Invoke the strategy.
        let outcome =
            panic::catch_unwind(AssertUnwindSafe(|| strategy.on_market_data(&context, &tick)));

        let order = match outcome {
            Ok(order) => {
                consecutive_faults = 0;
                order
            }
            Err(payload) => {
                consecutive_faults += 1;
                emit(
                    &result_tx,
                    RunnerResult::Error {
                        subscription_id: subscription_id.clone(),
                        error: format!("on_market_data panicked: {}", panic_message(payload)),
                        backtrace: std::backtrace::Backtrace::force_capture().to_string(),
                    },
                );
                if consecutive_faults >= MAX_CONSECUTIVE_FAULTS {
                    warn!(
                        %subscription_id,
                        faults = consecutive_faults,
                        "repeat-fault threshold reached, stopping runner"
                    );
                    let _ = panic::catch_unwind(AssertUnwindSafe(|| strategy.on_stop()));
                    let state =
                        panic::catch_unwind(AssertUnwindSafe(|| strategy.get_state())).ok();
                    status(&result_tx, &subscription_id, RunnerStatus::Stopped, state);
                    return;
                }
                continue;
            }
        };

        let Some(order) = order else { continue };

        // 5. Gate through the risk manager.
        let snapshot = kill_switch_cache
            .blocked_reason(&subscription_id, &user_id)
            .map(KillSwitchSnapshot::active);
        let decision: RiskDecision = check_order(
            &order,
            &context,
            &limits,
            today_trade_count,
            snapshot.as_ref(),
        );

        if decision.allowed {
            today_trade_count += 1;
            emit(
                &result_tx,
                RunnerResult::Order {
                    subscription_id: subscription_id.clone(),
                    order,
                    market_price_micros: tick.ltp_micros,
                },
            );
        } else {
            let limit_type = decision
                .limit_type
                .map(|lt| lt.as_str().to_string())
                .unwrap_or_default();
            emit(
                &result_tx,
                RunnerResult::RiskBlocked {
                    subscription_id: subscription_id.clone(),
                    reason: decision.reason.clone(),
                    limit_type: limit_type.clone(),
                    symbol: order.symbol.clone(),
                },
            );
            if decision.escalates_kill_switch() {
                emit(
                    &result_tx,
                    RunnerResult::KillSwitchTrigger {
                        subscription_id: subscription_id.clone(),
                        reason: decision.reason,
                        limit_type,
                    },
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adk_schemas::{micros_from_f64, OrderRequest, Signal, MICROS_SCALE};
    use adk_strategy::{ConfigMap, StateMap, StrategyDescriptor};
    use chrono::{TimeZone, Utc};

    /// Scripted strategy: emits one prepared order per tick, or panics.
    struct Scripted {
        orders: Vec<Option<OrderRequest>>,
        panic_every_tick: bool,
        cursor: usize,
    }

    impl Scripted {
        fn emitting(orders: Vec<Option<OrderRequest>>) -> Self {
            Self {
                orders,
                panic_every_tick: false,
                cursor: 0,
            }
        }

        fn panicking() -> Self {
            Self {
                orders: vec![],
                panic_every_tick: true,
                cursor: 0,
            }
        }
    }

    impl Strategy for Scripted {
        fn descriptor(&self) -> StrategyDescriptor {
            StrategyDescriptor {
                name: "scripted",
                display_name: "Scripted",
                version: "1.0.0",
                description: "test seed",
                min_capital_micros: 0,
                supported_symbols: &[],
                interval: adk_schemas::Interval::Min5,
            }
        }

        fn on_market_data(
            &mut self,
            _ctx: &StrategyContext,
            _tick: &MarketTick,
        ) -> Option<OrderRequest> {
            if self.panic_every_tick {
                panic!("scripted failure");
            }
            let order = self.orders.get(self.cursor).cloned().flatten();
            self.cursor += 1;
            order
        }

        fn apply_config(&mut self, _config: &ConfigMap) {}
        fn get_state(&self) -> StateMap {
            let mut state = StateMap::new();
            state.insert("cursor".to_string(), serde_json::json!(self.cursor));
            state
        }
        fn set_state(&mut self, _state: &StateMap) {}
    }

    fn tick(seq: i64) -> MarketTick {
        let price = micros_from_f64(100.0);
        MarketTick {
            symbol: "SBIN".to_string(),
            exchange: "NSE".to_string(),
            ts: Utc.timestamp_opt(1_700_000_000 + seq, 0).unwrap(),
            ltp_micros: price,
            open_micros: price,
            high_micros: price,
            low_micros: price,
            close_micros: price,
            volume: 100,
            bid_micros: price,
            ask_micros: price,
            bid_qty: 10,
            ask_qty: 10,
        }
    }

    fn buy_with_stop() -> OrderRequest {
        OrderRequest::market("SBIN", "NSE", Signal::Buy, 5)
            .with_stop_loss(micros_from_f64(98.0))
    }

    fn spawn_runner(strategy: Box<dyn Strategy>, context: StrategyContext) -> RunnerHandle {
        RunnerHandle::spawn(RunnerSpawn {
            subscription_id: "sub-1".to_string(),
            user_id: "user-1".to_string(),
            strategy,
            context,
            limits: RiskLimits::new(1_000, 0, 200, 5),
            kill_switch_cache: Arc::new(KillSwitchCache::new()),
            feed_buffer: 16,
        })
    }

    fn context() -> StrategyContext {
        StrategyContext::new(
            "scripted",
            "user-1",
            "sub-1",
            100_000 * MICROS_SCALE,
            &RiskLimits::new(1_000, 0, 200, 5),
            true,
        )
    }

    fn drain_until<F>(handle: &RunnerHandle, deadline: Duration, mut pred: F) -> Vec<RunnerResult>
    where
        F: FnMut(&RunnerResult) -> bool,
    {
        let until = Instant::now() + deadline;
        let mut seen = Vec::new();
        while Instant::now() < until {
            if let Some(result) = handle.try_recv_result() {
                let done = pred(&result);
                seen.push(result);
                if done {
                    return seen;
                }
            } else {
                std::thread::sleep(Duration::from_millis(5));
            }
        }
        seen
    }

    #[test]
    fn allowed_order_is_emitted_with_market_price() {
        let strategy = Scripted::emitting(vec![Some(buy_with_stop())]);
        let mut handle = spawn_runner(Box::new(strategy), context());

        handle.send_market_data(tick(0));
        let results = drain_until(&handle, Duration::from_secs(2), |r| {
            matches!(r, RunnerResult::Order { .. })
        });
        let order = results
            .iter()
            .find_map(|r| match r {
                RunnerResult::Order {
                    order,
                    market_price_micros,
                    ..
                } => Some((order.clone(), *market_price_micros)),
                _ => None,
            })
            .expect("order result");
        assert_eq!(order.0.signal, Signal::Buy);
        assert_eq!(order.1, micros_from_f64(100.0));

        assert!(handle.stop(Duration::from_secs(2)));
    }

    #[test]
    fn entry_without_stop_loss_is_risk_blocked() {
        let bare = OrderRequest::market("SBIN", "NSE", Signal::Buy, 5);
        let strategy = Scripted::emitting(vec![Some(bare)]);
        let mut handle = spawn_runner(Box::new(strategy), context());

        handle.send_market_data(tick(0));
        let results = drain_until(&handle, Duration::from_secs(2), |r| {
            matches!(r, RunnerResult::RiskBlocked { .. })
        });
        let blocked = results
            .iter()
            .find_map(|r| match r {
                RunnerResult::RiskBlocked { limit_type, .. } => Some(limit_type.clone()),
                _ => None,
            })
            .expect("risk blocked result");
        assert_eq!(blocked, "stop_loss_required");
        // A stop-loss denial never escalates to a kill switch.
        assert!(!results
            .iter()
            .any(|r| matches!(r, RunnerResult::KillSwitchTrigger { .. })));

        assert!(handle.stop(Duration::from_secs(2)));
    }

    #[test]
    fn drawdown_denial_escalates_to_kill_switch_trigger() {
        let strategy = Scripted::emitting(vec![Some(buy_with_stop())]);
        let mut ctx = context();
        // max_drawdown 10% of 1,00,000; total pnl -10,001 trips it.
        ctx.total_pnl_micros = -10_001 * MICROS_SCALE;
        let mut handle = spawn_runner(Box::new(strategy), ctx);

        handle.send_market_data(tick(0));
        let results = drain_until(&handle, Duration::from_secs(2), |r| {
            matches!(r, RunnerResult::KillSwitchTrigger { .. })
        });
        let trigger = results
            .iter()
            .find_map(|r| match r {
                RunnerResult::KillSwitchTrigger { limit_type, .. } => Some(limit_type.clone()),
                _ => None,
            })
            .expect("kill switch trigger");
        assert_eq!(trigger, "max_drawdown");

        assert!(handle.stop(Duration::from_secs(2)));
    }

    #[test]
    fn strategy_panic_surfaces_error_and_runner_survives() {
        let mut handle = spawn_runner(Box::new(Scripted::panicking()), context());

        handle.send_market_data(tick(0));
        let results = drain_until(&handle, Duration::from_secs(2), |r| {
            matches!(r, RunnerResult::Error { .. })
        });
        assert!(results
            .iter()
            .any(|r| matches!(r, RunnerResult::Error { .. })));
        assert!(handle.is_alive(), "runner must survive a strategy fault");

        assert!(handle.stop(Duration::from_secs(2)));
    }

    #[test]
    fn repeated_faults_stop_the_runner() {
        let mut handle = spawn_runner(Box::new(Scripted::panicking()), context());

        for i in 0..(MAX_CONSECUTIVE_FAULTS as i64 + 2) {
            handle.send_market_data(tick(i));
        }
        let results = drain_until(&handle, Duration::from_secs(5), |r| {
            matches!(
                r,
                RunnerResult::Status {
                    status: RunnerStatus::Stopped,
                    ..
                }
            )
        });
        assert!(results.iter().any(|r| matches!(
            r,
            RunnerResult::Status {
                status: RunnerStatus::Stopped,
                ..
            }
        )));

        // The thread exits on its own after the fault threshold.
        let deadline = Instant::now() + Duration::from_secs(2);
        while handle.is_alive() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(!handle.is_alive());
    }

    #[test]
    fn stop_flushes_final_state() {
        let strategy = Scripted::emitting(vec![None, None]);
        let mut handle = spawn_runner(Box::new(strategy), context());
        handle.send_market_data(tick(0));

        std::thread::sleep(Duration::from_millis(50));
        assert!(handle.send_command(RunnerCommand::Stop));
        let results = drain_until(&handle, Duration::from_secs(2), |r| {
            matches!(
                r,
                RunnerResult::Status {
                    status: RunnerStatus::Stopped,
                    ..
                }
            )
        });
        let state = results
            .iter()
            .find_map(|r| match r {
                RunnerResult::Status {
                    status: RunnerStatus::Stopped,
                    state,
                    ..
                } => state.clone(),
                _ => None,
            })
            .expect("stopped status with state");
        assert!(state.contains_key("cursor"));
    }

    #[test]
    fn pause_suppresses_ticks_until_resume() {
        let strategy = Scripted::emitting(vec![Some(buy_with_stop())]);
        let mut handle = spawn_runner(Box::new(strategy), context());

        assert!(handle.send_command(RunnerCommand::Pause));
        drain_until(&handle, Duration::from_secs(2), |r| {
            matches!(
                r,
                RunnerResult::Status {
                    status: RunnerStatus::Paused,
                    ..
                }
            )
        });

        handle.send_market_data(tick(0));
        std::thread::sleep(Duration::from_millis(150));
        // Paused: the tick sits in the queue, no order comes out.
        assert!(handle.try_recv_result().is_none());
        assert!(handle.is_paused());

        assert!(handle.send_command(RunnerCommand::Resume));
        let results = drain_until(&handle, Duration::from_secs(2), |r| {
            matches!(r, RunnerResult::Order { .. })
        });
        assert!(results
            .iter()
            .any(|r| matches!(r, RunnerResult::Order { .. })));

        assert!(handle.stop(Duration::from_secs(2)));
    }

    #[test]
    fn kill_switch_snapshot_blocks_orders() {
        let cache = Arc::new(KillSwitchCache::new());
        cache.apply_event(&adk_killswitch::KillSwitchEvent::GlobalStop {
            reason: "market halt".to_string(),
            activated_by: "admin".to_string(),
        });

        let strategy = Scripted::emitting(vec![Some(buy_with_stop())]);
        let mut handle = RunnerHandle::spawn(RunnerSpawn {
            subscription_id: "sub-1".to_string(),
            user_id: "user-1".to_string(),
            strategy: Box::new(strategy),
            context: context(),
            limits: RiskLimits::new(1_000, 0, 200, 5),
            kill_switch_cache: cache,
            feed_buffer: 16,
        });

        handle.send_market_data(tick(0));
        let results = drain_until(&handle, Duration::from_secs(2), |r| {
            matches!(r, RunnerResult::RiskBlocked { .. })
        });
        let blocked = results
            .iter()
            .find_map(|r| match r {
                RunnerResult::RiskBlocked { limit_type, .. } => Some(limit_type.clone()),
                _ => None,
            })
            .expect("risk blocked result");
        assert_eq!(blocked, "kill_switch");

        assert!(handle.stop(Duration::from_secs(2)));
    }
}
