//! adk-db
//!
//! Postgres persistence for the execution core: the order audit log, backtest
//! jobs and artifacts, and optimization jobs and samples. Queries are
//! runtime-checked; migrations are embedded from `./migrations`.
//!
//! Result/trade/equity rows for one backtest are written in a single
//! transaction: a failed job leaves no partial artifacts.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use adk_audit::{OrderLogEventType, OrderLogRecord};

pub const ENV_DB_URL: &str = "ADK_DATABASE_URL";

/// Connect to Postgres using ADK_DATABASE_URL.
pub async fn connect_from_env() -> Result<PgPool> {
    let url = std::env::var(ENV_DB_URL).with_context(|| format!("missing env var {ENV_DB_URL}"))?;
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .context("failed to connect to Postgres")?;
    Ok(pool)
}

/// Run embedded migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

/// Test helper: connect via ADK_DATABASE_URL and ensure migrations applied.
pub async fn testkit_db_pool() -> Result<PgPool> {
    let pool = connect_from_env().await?;
    migrate(&pool).await?;
    Ok(pool)
}

// ---------------------------------------------------------------------------
// Order log
// ---------------------------------------------------------------------------

/// Insert one order-log record. Append-only; records are never updated.
pub async fn insert_order_log(pool: &PgPool, record: &OrderLogRecord) -> Result<()> {
    sqlx::query(
        r#"
        insert into order_logs (
          record_id, subscription_id, symbol, exchange, order_type,
          transaction_side, quantity, price_micros, trigger_price_micros,
          event_type, is_dry_run, is_test_order, success, broker_order_id,
          broker_name, request, response, error_message, strategy_name,
          reason, market_price_micros, created_at
        ) values (
          $1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18,$19,$20,$21,$22
        )
        "#,
    )
    .bind(record.record_id)
    .bind(&record.subscription_id)
    .bind(&record.symbol)
    .bind(&record.exchange)
    .bind(&record.order_type)
    .bind(&record.transaction_side)
    .bind(record.quantity)
    .bind(record.price_micros)
    .bind(record.trigger_price_micros)
    .bind(record.event_type.as_str())
    .bind(record.is_dry_run)
    .bind(record.is_test_order)
    .bind(record.success)
    .bind(&record.broker_order_id)
    .bind(&record.broker_name)
    .bind(&record.request)
    .bind(&record.response)
    .bind(&record.error_message)
    .bind(&record.strategy_name)
    .bind(&record.reason)
    .bind(record.market_price_micros)
    .bind(record.created_at)
    .execute(pool)
    .await
    .context("insert_order_log failed")?;
    Ok(())
}

/// Event types for one subscription in insertion order, oldest first.
/// Used to audit life-cycle monotonicity.
pub async fn fetch_order_event_types(
    pool: &PgPool,
    subscription_id: &str,
) -> Result<Vec<OrderLogEventType>> {
    let rows = sqlx::query(
        r#"
        select event_type
        from order_logs
        where subscription_id = $1
        order by created_at asc, record_id asc
        "#,
    )
    .bind(subscription_id)
    .fetch_all(pool)
    .await
    .context("fetch_order_event_types failed")?;

    let mut events = Vec::with_capacity(rows.len());
    for row in rows {
        let raw: String = row.get("event_type");
        let parsed: OrderLogEventType = serde_json::from_value(Value::String(raw.clone()))
            .with_context(|| format!("unknown event_type '{raw}'"))?;
        events.push(parsed);
    }
    Ok(events)
}

// ---------------------------------------------------------------------------
// Backtest artifacts
// ---------------------------------------------------------------------------

/// A new backtest job row.
#[derive(Clone, Debug)]
pub struct NewBacktestJob {
    pub job_id: Uuid,
    pub user_id: String,
    pub strategy_name: String,
    pub symbol: String,
    pub exchange: String,
    pub bar_interval: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub initial_capital_micros: i64,
    pub strategy_config: Value,
}

/// Metrics row persisted once per completed job.
#[derive(Clone, Debug)]
pub struct BacktestResultRow {
    pub total_return_micros: i64,
    pub total_return_percent: f64,
    pub cagr: f64,
    pub sharpe_ratio: f64,
    pub sortino_ratio: f64,
    pub calmar_ratio: f64,
    pub max_drawdown: f64,
    pub avg_drawdown: f64,
    pub win_rate: f64,
    pub profit_factor: f64,
    pub total_trades: i32,
    pub winning_trades: i32,
    pub losing_trades: i32,
    pub avg_trade_duration_secs: i64,
    pub final_capital_micros: i64,
    pub max_capital_micros: i64,
}

#[derive(Clone, Debug)]
pub struct BacktestTradeRow {
    pub entry_price_micros: i64,
    pub exit_price_micros: Option<i64>,
    pub quantity: i64,
    pub entry_time: DateTime<Utc>,
    pub exit_time: Option<DateTime<Utc>>,
    pub pnl_micros: i64,
    pub pnl_percent: f64,
    pub is_open: bool,
}

#[derive(Clone, Debug)]
pub struct EquityPointRow {
    pub ts: DateTime<Utc>,
    pub equity_micros: i64,
    pub drawdown_percent: f64,
}

pub async fn insert_backtest_job(pool: &PgPool, job: &NewBacktestJob) -> Result<()> {
    sqlx::query(
        r#"
        insert into backtest_jobs (
          job_id, user_id, strategy_name, symbol, exchange, bar_interval,
          start_date, end_date, initial_capital_micros, strategy_config
        ) values ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10)
        "#,
    )
    .bind(job.job_id)
    .bind(&job.user_id)
    .bind(&job.strategy_name)
    .bind(&job.symbol)
    .bind(&job.exchange)
    .bind(&job.bar_interval)
    .bind(job.start_date)
    .bind(job.end_date)
    .bind(job.initial_capital_micros)
    .bind(&job.strategy_config)
    .execute(pool)
    .await
    .context("insert_backtest_job failed")?;
    Ok(())
}

/// Update job status/progress. `error_message` only lands with `failed`.
pub async fn update_backtest_job_status(
    pool: &PgPool,
    job_id: Uuid,
    status: &str,
    progress: i32,
    error_message: Option<&str>,
) -> Result<()> {
    sqlx::query(
        r#"
        update backtest_jobs
        set status = $2, progress = $3, error_message = $4, updated_at = now()
        where job_id = $1
        "#,
    )
    .bind(job_id)
    .bind(status)
    .bind(progress)
    .bind(error_message)
    .execute(pool)
    .await
    .context("update_backtest_job_status failed")?;
    Ok(())
}

/// Persist the full artifact set for a completed backtest in one transaction
/// and flip the job to `completed`.
pub async fn persist_backtest_artifacts(
    pool: &PgPool,
    job_id: Uuid,
    result: &BacktestResultRow,
    trades: &[BacktestTradeRow],
    equity: &[EquityPointRow],
) -> Result<()> {
    let mut tx = pool.begin().await.context("begin backtest tx")?;

    sqlx::query(
        r#"
        insert into backtest_results (
          job_id, total_return_micros, total_return_percent, cagr,
          sharpe_ratio, sortino_ratio, calmar_ratio, max_drawdown,
          avg_drawdown, win_rate, profit_factor, total_trades,
          winning_trades, losing_trades, avg_trade_duration_secs,
          final_capital_micros, max_capital_micros
        ) values ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17)
        "#,
    )
    .bind(job_id)
    .bind(result.total_return_micros)
    .bind(result.total_return_percent)
    .bind(result.cagr)
    .bind(result.sharpe_ratio)
    .bind(result.sortino_ratio)
    .bind(result.calmar_ratio)
    .bind(result.max_drawdown)
    .bind(result.avg_drawdown)
    .bind(result.win_rate)
    .bind(result.profit_factor)
    .bind(result.total_trades)
    .bind(result.winning_trades)
    .bind(result.losing_trades)
    .bind(result.avg_trade_duration_secs)
    .bind(result.final_capital_micros)
    .bind(result.max_capital_micros)
    .execute(&mut *tx)
    .await
    .context("insert backtest_results failed")?;

    for trade in trades {
        sqlx::query(
            r#"
            insert into backtest_trades (
              job_id, entry_price_micros, exit_price_micros, quantity,
              entry_time, exit_time, pnl_micros, pnl_percent, is_open
            ) values ($1,$2,$3,$4,$5,$6,$7,$8,$9)
            "#,
        )
        .bind(job_id)
        .bind(trade.entry_price_micros)
        .bind(trade.exit_price_micros)
        .bind(trade.quantity)
        .bind(trade.entry_time)
        .bind(trade.exit_time)
        .bind(trade.pnl_micros)
        .bind(trade.pnl_percent)
        .bind(trade.is_open)
        .execute(&mut *tx)
        .await
        .context("insert backtest_trades failed")?;
    }

    for point in equity {
        sqlx::query(
            r#"
            insert into backtest_equity_curve (job_id, ts, equity_micros, drawdown_percent)
            values ($1,$2,$3,$4)
            "#,
        )
        .bind(job_id)
        .bind(point.ts)
        .bind(point.equity_micros)
        .bind(point.drawdown_percent)
        .execute(&mut *tx)
        .await
        .context("insert backtest_equity_curve failed")?;
    }

    sqlx::query(
        r#"
        update backtest_jobs
        set status = 'completed', progress = 100, updated_at = now()
        where job_id = $1
        "#,
    )
    .bind(job_id)
    .execute(&mut *tx)
    .await
    .context("complete backtest_jobs failed")?;

    tx.commit().await.context("commit backtest tx")?;
    Ok(())
}

pub async fn count_equity_points(pool: &PgPool, job_id: Uuid) -> Result<i64> {
    let (n,): (i64,) =
        sqlx::query_as(r#"select count(*)::bigint from backtest_equity_curve where job_id = $1"#)
            .bind(job_id)
            .fetch_one(pool)
            .await
            .context("count_equity_points failed")?;
    Ok(n)
}

// ---------------------------------------------------------------------------
// Optimization artifacts
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct NewOptimizationJob {
    pub job_id: Uuid,
    pub user_id: String,
    pub strategy_name: String,
    pub symbol: String,
    pub exchange: String,
    pub bar_interval: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub initial_capital_micros: i64,
    pub num_samples: i32,
    pub parameter_ranges: Value,
    pub objective_metric: String,
}

#[derive(Clone, Debug)]
pub struct OptimizationSampleRow {
    pub parameters: Value,
    pub metrics: Value,
    pub objective_value: f64,
    pub trades_count: i32,
    pub error_message: Option<String>,
    pub is_best: bool,
}

pub async fn insert_optimization_job(pool: &PgPool, job: &NewOptimizationJob) -> Result<()> {
    sqlx::query(
        r#"
        insert into optimization_jobs (
          job_id, user_id, strategy_name, symbol, exchange, bar_interval,
          start_date, end_date, initial_capital_micros, num_samples,
          parameter_ranges, objective_metric
        ) values ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12)
        "#,
    )
    .bind(job.job_id)
    .bind(&job.user_id)
    .bind(&job.strategy_name)
    .bind(&job.symbol)
    .bind(&job.exchange)
    .bind(&job.bar_interval)
    .bind(job.start_date)
    .bind(job.end_date)
    .bind(job.initial_capital_micros)
    .bind(job.num_samples)
    .bind(&job.parameter_ranges)
    .bind(&job.objective_metric)
    .execute(pool)
    .await
    .context("insert_optimization_job failed")?;
    Ok(())
}

pub async fn update_optimization_progress(
    pool: &PgPool,
    job_id: Uuid,
    status: &str,
    completed_samples: i32,
    progress: i32,
    error_message: Option<&str>,
) -> Result<()> {
    sqlx::query(
        r#"
        update optimization_jobs
        set status = $2, completed_samples = $3, progress = $4,
            error_message = $5, updated_at = now()
        where job_id = $1
        "#,
    )
    .bind(job_id)
    .bind(status)
    .bind(completed_samples)
    .bind(progress)
    .bind(error_message)
    .execute(pool)
    .await
    .context("update_optimization_progress failed")?;
    Ok(())
}

/// Persist every sample row in one transaction and complete the job.
/// The unique partial index enforces at most one `is_best` per job.
pub async fn persist_optimization_samples(
    pool: &PgPool,
    job_id: Uuid,
    samples: &[OptimizationSampleRow],
) -> Result<()> {
    let mut tx = pool.begin().await.context("begin optimization tx")?;

    for sample in samples {
        sqlx::query(
            r#"
            insert into optimization_samples (
              job_id, parameters, metrics, objective_value, trades_count,
              error_message, is_best
            ) values ($1,$2,$3,$4,$5,$6,$7)
            "#,
        )
        .bind(job_id)
        .bind(&sample.parameters)
        .bind(&sample.metrics)
        .bind(sample.objective_value)
        .bind(sample.trades_count)
        .bind(&sample.error_message)
        .bind(sample.is_best)
        .execute(&mut *tx)
        .await
        .context("insert optimization_samples failed")?;
    }

    sqlx::query(
        r#"
        update optimization_jobs
        set status = 'completed', progress = 100,
            completed_samples = $2, updated_at = now()
        where job_id = $1
        "#,
    )
    .bind(job_id)
    .bind(samples.len() as i32)
    .execute(&mut *tx)
    .await
    .context("complete optimization_jobs failed")?;

    tx.commit().await.context("commit optimization tx")?;
    Ok(())
}
