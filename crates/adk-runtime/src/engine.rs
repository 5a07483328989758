//! The execution engine: the narrow facade the rest of the platform calls.
//!
//! Owns the broker handle, the supervisor, and the kill-switch client.
//! Routes every allowed order through the audit trail:
//! `generated` -> `dry_run` stop, or `submitted` -> `placed` | `failed`.
//! Market data flows in through one broker subscription whose callback
//! converts quotes to ticks and fans them out via the supervisor.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use adk_audit::{OrderAuditLog, OrderLogEventType, OrderLogRecord};
use adk_broker::{Broker, BrokerRegistry, DiscoveryReport, PlaceOrderRequest, Side};
use adk_killswitch::KillSwitchStore;
use adk_schemas::Signal;
use adk_strategy::StrategyRegistry;
use anyhow::{anyhow, Context, Result};
use sqlx::PgPool;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::supervisor::{RestartPolicy, StartSpec, Supervisor, SupervisorStatus};
use crate::types::OrderEnvelope;

/// Engine construction knobs.
#[derive(Clone, Debug)]
pub struct ExecutionEngineConfig {
    /// Registry name of the bound broker, for audit records.
    pub broker_name: String,
    /// Platform-wide dry-run override: orders are audited, never sent.
    pub dry_run: bool,
    pub audit_log_path: PathBuf,
    pub feed_buffer: usize,
    pub stop_timeout: Duration,
}

impl Default for ExecutionEngineConfig {
    fn default() -> Self {
        Self {
            broker_name: "paper".to_string(),
            dry_run: false,
            audit_log_path: PathBuf::from("audit/orders.jsonl"),
            feed_buffer: 1_024,
            stop_timeout: Duration::from_secs(10),
        }
    }
}

impl From<&adk_config::EngineConfig> for ExecutionEngineConfig {
    fn from(cfg: &adk_config::EngineConfig) -> Self {
        Self {
            broker_name: cfg.broker.clone(),
            dry_run: cfg.dry_run,
            feed_buffer: cfg.feed_buffer,
            stop_timeout: Duration::from_secs(cfg.stop_timeout_secs),
            ..Self::default()
        }
    }
}

/// Introspection snapshot.
#[derive(Clone, Debug)]
pub struct EngineStatus {
    pub broker: String,
    pub broker_connected: bool,
    pub dry_run: bool,
    pub runners: Vec<SupervisorStatus>,
}

/// The execution engine facade.
pub struct ExecutionEngine {
    broker: Arc<dyn Broker>,
    kill_switch: Arc<dyn KillSwitchStore>,
    supervisor: Arc<Supervisor>,
    audit: tokio::sync::Mutex<OrderAuditLog>,
    db: Option<PgPool>,
    config: ExecutionEngineConfig,
    order_rx: Mutex<Option<mpsc::Receiver<OrderEnvelope>>>,
    subscribed: Mutex<HashSet<String>>,
}

impl ExecutionEngine {
    pub fn new(
        broker: Arc<dyn Broker>,
        kill_switch: Arc<dyn KillSwitchStore>,
        strategies: Arc<StrategyRegistry>,
        config: ExecutionEngineConfig,
        db: Option<PgPool>,
    ) -> Result<Arc<Self>> {
        let (supervisor, order_rx) = Supervisor::new(
            strategies,
            Arc::clone(&kill_switch),
            RestartPolicy::default(),
            config.feed_buffer,
        );
        let audit = OrderAuditLog::new(&config.audit_log_path, true)
            .context("order audit log init failed")?;

        Ok(Arc::new(Self {
            broker,
            kill_switch,
            supervisor,
            audit: tokio::sync::Mutex::new(audit),
            db,
            config,
            order_rx: Mutex::new(Some(order_rx)),
            subscribed: Mutex::new(HashSet::new()),
        }))
    }

    /// Start the supervisor tasks and the order-routing task.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.supervisor.start().await?;

        let Some(mut order_rx) = self
            .order_rx
            .lock()
            .expect("order receiver slot poisoned")
            .take()
        else {
            return Ok(()); // already started
        };

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(envelope) = order_rx.recv().await {
                engine.route_order(envelope).await;
            }
        });

        info!(broker = %self.config.broker_name, "execution engine started");
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.supervisor.shutdown().await;
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    // -----------------------------------------------------------------------
    // Strategy lifecycle
    // -----------------------------------------------------------------------

    pub async fn start_strategy(&self, mut spec: StartSpec) -> Result<bool> {
        spec.dry_run = spec.dry_run || self.config.dry_run;
        let symbols = spec.symbols.clone();

        let started = self.supervisor.start_strategy(spec).await?;
        if started {
            self.subscribe_feed(&symbols).await?;
        }
        Ok(started)
    }

    pub async fn stop_strategy(&self, subscription_id: &str) -> bool {
        self.supervisor
            .stop_strategy(subscription_id, self.config.stop_timeout)
            .await
    }

    pub fn pause_strategy(&self, subscription_id: &str) -> bool {
        self.supervisor.pause_strategy(subscription_id)
    }

    pub fn resume_strategy(&self, subscription_id: &str) -> bool {
        self.supervisor.resume_strategy(subscription_id)
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            broker: self.config.broker_name.clone(),
            broker_connected: self.broker.is_connected(),
            dry_run: self.config.dry_run,
            runners: self.supervisor.all_status(),
        }
    }

    // -----------------------------------------------------------------------
    // Kill switch administration
    // -----------------------------------------------------------------------

    pub async fn activate_global_kill_switch(&self, reason: &str, activated_by: &str) -> Result<()> {
        self.kill_switch.activate_global(reason, activated_by).await
    }

    pub async fn deactivate_global_kill_switch(&self, deactivated_by: &str) -> Result<()> {
        self.kill_switch.deactivate_global(deactivated_by).await
    }

    pub async fn activate_user_kill_switch(&self, user_id: &str, reason: &str) -> Result<()> {
        self.kill_switch
            .activate_for_user(user_id, reason, "admin")
            .await
    }

    pub async fn deactivate_user_kill_switch(&self, user_id: &str) -> Result<()> {
        self.kill_switch.deactivate_for_user(user_id).await
    }

    pub async fn activate_strategy_kill_switch(
        &self,
        subscription_id: &str,
        reason: &str,
    ) -> Result<()> {
        self.kill_switch
            .activate_for_strategy(subscription_id, reason, "admin")
            .await
    }

    pub async fn deactivate_strategy_kill_switch(&self, subscription_id: &str) -> Result<()> {
        self.kill_switch.deactivate_for_strategy(subscription_id).await
    }

    // -----------------------------------------------------------------------
    // Broker plumbing
    // -----------------------------------------------------------------------

    /// Hot reload of broker plugins is refused while any runner is active:
    /// a crash-restart cycle must not race a changed implementation.
    pub fn reload_brokers(&self, registry: &mut BrokerRegistry) -> Result<DiscoveryReport> {
        if self.supervisor.active_runner_count() > 0 {
            return Err(anyhow!(
                "broker reload refused: {} runner(s) active",
                self.supervisor.active_runner_count()
            ));
        }
        Ok(registry.reload())
    }

    async fn subscribe_feed(&self, symbols: &[String]) -> Result<()> {
        let fresh: Vec<String> = {
            let mut subscribed = self.subscribed.lock().expect("subscription set poisoned");
            symbols
                .iter()
                .filter(|s| subscribed.insert((*s).clone()))
                .cloned()
                .collect()
        };
        if fresh.is_empty() {
            return Ok(());
        }

        let supervisor = Arc::clone(&self.supervisor);
        let callback: adk_broker::TickCallback = Arc::new(move |quote| {
            supervisor.distribute_market_data(&quote.to_tick());
        });
        self.broker
            .subscribe_market_data(&fresh, callback)
            .await
            .map_err(|err| anyhow!("feed subscription failed: {err}"))
    }

    // -----------------------------------------------------------------------
    // Order routing
    // -----------------------------------------------------------------------

    async fn route_order(&self, envelope: OrderEnvelope) {
        // 1. Always audit generation first.
        self.persist_record(self.base_record(&envelope, OrderLogEventType::Generated))
            .await;

        // 2. Dry run: audited, never sent.
        if envelope.dry_run {
            let mut record = self.base_record(&envelope, OrderLogEventType::DryRun);
            record.success = Some(true);
            self.persist_record(record).await;
            info!(
                subscription_id = %envelope.subscription_id,
                symbol = %envelope.order.symbol,
                side = %envelope.order.signal.transaction_side(),
                quantity = envelope.order.quantity,
                "dry-run order simulated"
            );
            return;
        }

        // 3. Submit to the broker.
        let request = PlaceOrderRequest {
            symbol: envelope.order.symbol.clone(),
            exchange: envelope.order.exchange.clone(),
            side: match envelope.order.signal {
                Signal::Buy | Signal::ExitShort => Side::Buy,
                Signal::Sell | Signal::ExitLong => Side::Sell,
            },
            quantity: envelope.order.quantity,
            order_type: envelope.order.order_type,
            price_micros: envelope.order.price_micros,
            trigger_price_micros: envelope.order.stop_loss_micros,
            product_type: "INTRADAY".to_string(),
        };

        let mut submitted = self.base_record(&envelope, OrderLogEventType::Submitted);
        submitted.request = serde_json::json!({
            "symbol": request.symbol,
            "exchange": request.exchange,
            "side": request.side.as_str(),
            "quantity": request.quantity,
            "order_type": request.order_type.as_str(),
        });
        self.persist_record(submitted).await;

        match self.broker.place_order(request).await {
            Ok(broker_order) => {
                let mut record = self.base_record(&envelope, OrderLogEventType::Placed);
                record.success = Some(true);
                record.broker_order_id = broker_order.broker_order_id.clone();
                record.response =
                    serde_json::to_value(&broker_order).unwrap_or(serde_json::Value::Null);
                self.persist_record(record).await;
                info!(
                    subscription_id = %envelope.subscription_id,
                    broker_order_id = ?broker_order.broker_order_id,
                    "order placed"
                );
            }
            Err(err) => {
                // Broker errors are logged, audited, never propagated as a
                // panic. No automatic retry at this layer.
                let mut record = self.base_record(&envelope, OrderLogEventType::Failed);
                record.success = Some(false);
                record.error_message = Some(err.to_string());
                self.persist_record(record).await;
                error!(
                    subscription_id = %envelope.subscription_id,
                    %err,
                    "order placement failed"
                );
            }
        }
    }

    fn base_record(&self, envelope: &OrderEnvelope, event: OrderLogEventType) -> OrderLogRecord {
        let order = &envelope.order;
        let mut record = OrderLogRecord::new(
            Some(envelope.subscription_id.clone()),
            order.symbol.clone(),
            order.exchange.clone(),
            order.order_type.as_str(),
            order.signal.transaction_side(),
            order.quantity,
            event,
        );
        record.price_micros = order.price_micros;
        record.trigger_price_micros = order.stop_loss_micros;
        record.is_dry_run = envelope.dry_run;
        record.broker_name = Some(self.config.broker_name.clone());
        record.strategy_name = Some(envelope.strategy_name.clone());
        record.reason = (!order.reason.is_empty()).then(|| order.reason.clone());
        record.market_price_micros = Some(envelope.market_price_micros);
        record
    }

    async fn persist_record(&self, record: OrderLogRecord) {
        let written = {
            let mut audit = self.audit.lock().await;
            audit.append(record.clone())
        };
        let written = match written {
            Ok(written) => written,
            Err(err) => {
                error!(%err, "order audit append failed");
                record
            }
        };
        if let Some(pool) = &self.db {
            if let Err(err) = adk_db::insert_order_log(pool, &written).await {
                warn!(%err, "order log db insert failed");
            }
        }
    }
}
