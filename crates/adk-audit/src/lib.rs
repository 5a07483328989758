//! adk-audit
//!
//! Append-only order audit trail. Every order life-cycle event is one JSON
//! line; an optional sha256 hash chain makes tampering detectable. The
//! lifecycle validator enforces the only legal event sequences:
//!
//! ```text
//! generated -> dry_run
//! generated -> submitted -> placed -> (filled | rejected)
//! generated -> submitted -> failed
//! ```
//!
//! Postgres persistence of the same records lives in adk-db; this file log
//! is the tamper-evident local trail.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Order life-cycle event kinds, in wire spelling.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderLogEventType {
    Generated,
    DryRun,
    Submitted,
    Placed,
    Filled,
    Rejected,
    Failed,
}

impl OrderLogEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderLogEventType::Generated => "generated",
            OrderLogEventType::DryRun => "dry_run",
            OrderLogEventType::Submitted => "submitted",
            OrderLogEventType::Placed => "placed",
            OrderLogEventType::Filled => "filled",
            OrderLogEventType::Rejected => "rejected",
            OrderLogEventType::Failed => "failed",
        }
    }
}

impl std::fmt::Display for OrderLogEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One persisted order-log record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrderLogRecord {
    pub record_id: Uuid,
    /// Null for test orders placed outside a subscription.
    pub subscription_id: Option<String>,
    pub symbol: String,
    pub exchange: String,
    pub order_type: String,
    pub transaction_side: String,
    pub quantity: i64,
    pub price_micros: Option<i64>,
    pub trigger_price_micros: Option<i64>,
    pub event_type: OrderLogEventType,
    pub is_dry_run: bool,
    pub is_test_order: bool,
    pub success: Option<bool>,
    pub broker_order_id: Option<String>,
    pub broker_name: Option<String>,
    /// Opaque request/response blobs as the broker saw them.
    pub request: Value,
    pub response: Value,
    pub error_message: Option<String>,
    pub strategy_name: Option<String>,
    pub reason: Option<String>,
    pub market_price_micros: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub hash_prev: Option<String>,
    pub hash_self: Option<String>,
}

impl OrderLogRecord {
    /// Minimal record; the engine fills in life-cycle specifics per event.
    pub fn new(
        subscription_id: Option<String>,
        symbol: impl Into<String>,
        exchange: impl Into<String>,
        order_type: impl Into<String>,
        transaction_side: impl Into<String>,
        quantity: i64,
        event_type: OrderLogEventType,
    ) -> Self {
        Self {
            record_id: Uuid::nil(),
            subscription_id,
            symbol: symbol.into(),
            exchange: exchange.into(),
            order_type: order_type.into(),
            transaction_side: transaction_side.into(),
            quantity,
            price_micros: None,
            trigger_price_micros: None,
            event_type,
            is_dry_run: false,
            is_test_order: false,
            success: None,
            broker_order_id: None,
            broker_name: None,
            request: Value::Null,
            response: Value::Null,
            error_message: None,
            strategy_name: None,
            reason: None,
            market_price_micros: None,
            created_at: Utc::now(),
            hash_prev: None,
            hash_self: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Lifecycle validation
// ---------------------------------------------------------------------------

/// An illegal event transition within one order flow.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SequenceError {
    pub index: usize,
    pub from: Option<OrderLogEventType>,
    pub to: OrderLogEventType,
}

impl std::fmt::Display for SequenceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.from {
            Some(from) => write!(
                f,
                "illegal order-log transition {} -> {} at index {}",
                from, self.to, self.index
            ),
            None => write!(
                f,
                "order flow must start with 'generated', found {} at index {}",
                self.to, self.index
            ),
        }
    }
}

impl std::error::Error for SequenceError {}

/// Validate that `events` is a prefix of a legal order flow.
pub fn validate_event_sequence(events: &[OrderLogEventType]) -> Result<(), SequenceError> {
    use OrderLogEventType::*;

    let mut prev: Option<OrderLogEventType> = None;
    for (index, &event) in events.iter().enumerate() {
        let legal = match (prev, event) {
            (None, Generated) => true,
            (Some(Generated), DryRun | Submitted) => true,
            (Some(Submitted), Placed | Failed) => true,
            (Some(Placed), Filled | Rejected) => true,
            _ => false,
        };
        if !legal {
            return Err(SequenceError {
                index,
                from: prev,
                to: event,
            });
        }
        prev = Some(event);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// JSONL writer with hash chain
// ---------------------------------------------------------------------------

/// Append-only order audit writer. One record per JSON line; with the hash
/// chain enabled each record carries `hash_prev` + `hash_self`.
pub struct OrderAuditLog {
    path: PathBuf,
    hash_chain: bool,
    last_hash: Option<String>,
    /// Monotonic sequence used to derive deterministic record ids.
    seq: u64,
}

impl OrderAuditLog {
    /// Creates the writer and ensures parent dirs exist.
    pub fn new(path: impl AsRef<Path>, hash_chain: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create_dir_all {parent:?}"))?;
        }
        Ok(Self {
            path,
            hash_chain,
            last_hash: None,
            seq: 0,
        })
    }

    /// Restore chain state when resuming an existing log after restart.
    pub fn resume(&mut self, last_hash: Option<String>, seq: u64) {
        self.last_hash = last_hash;
        self.seq = seq;
    }

    pub fn last_hash(&self) -> Option<&str> {
        self.last_hash.as_deref()
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Append one record. The record id is derived deterministically from
    /// chain state + payload + sequence; no RNG.
    pub fn append(&mut self, mut record: OrderLogRecord) -> Result<OrderLogRecord> {
        record.record_id = derive_record_id(self.last_hash.as_deref(), &record, self.seq)?;
        self.seq += 1;

        if self.hash_chain {
            record.hash_prev = self.last_hash.clone();
            let hash = compute_record_hash(&record)?;
            record.hash_self = Some(hash.clone());
            self.last_hash = Some(hash);
        }

        let line = canonical_json_line(&record)?;
        append_line(&self.path, &line)?;
        Ok(record)
    }
}

fn derive_record_id(
    last_hash: Option<&str>,
    record: &OrderLogRecord,
    seq: u64,
) -> Result<Uuid> {
    let mut clone = record.clone();
    clone.record_id = Uuid::nil();
    clone.hash_prev = None;
    clone.hash_self = None;
    let payload = canonical_json_line(&clone)?;

    let mut material = Vec::new();
    material.extend_from_slice(last_hash.unwrap_or("genesis").as_bytes());
    material.extend_from_slice(&seq.to_be_bytes());
    material.extend_from_slice(payload.as_bytes());
    Ok(Uuid::new_v5(&Uuid::NAMESPACE_OID, &material))
}

fn append_line(path: &Path, line: &str) -> Result<()> {
    let mut f = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open audit log {path:?}"))?;
    f.write_all(line.as_bytes()).context("write audit line")?;
    f.write_all(b"\n").context("write newline")?;
    Ok(())
}

/// Canonicalize by sorting keys recursively and emitting compact JSON.
fn canonical_json_line<T: Serialize>(v: &T) -> Result<String> {
    let raw = serde_json::to_value(v).context("serialize audit record")?;
    let sorted = sort_keys(&raw);
    serde_json::to_string(&sorted).context("json stringify")
}

fn sort_keys(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            let mut new = serde_json::Map::new();
            for k in keys {
                new.insert(k.clone(), sort_keys(&map[&k]));
            }
            Value::Object(new)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_keys).collect()),
        _ => v.clone(),
    }
}

/// Hash is computed from canonical JSON of the record WITHOUT `hash_self`.
pub fn compute_record_hash(record: &OrderLogRecord) -> Result<String> {
    let mut clone = record.clone();
    clone.hash_self = None;
    let canonical = canonical_json_line(&clone)?;
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

/// Result of hash-chain verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyResult {
    Valid { lines: usize },
    Broken { line: usize, reason: String },
}

/// Verify the hash chain of an audit log file.
pub fn verify_hash_chain(path: impl AsRef<Path>) -> Result<VerifyResult> {
    let content = fs::read_to_string(path.as_ref())
        .with_context(|| format!("read audit log {:?}", path.as_ref()))?;
    verify_hash_chain_str(&content)
}

/// Verify the hash chain of in-memory JSONL content.
pub fn verify_hash_chain_str(content: &str) -> Result<VerifyResult> {
    let mut prev_hash: Option<String> = None;
    let mut line_count = 0usize;

    for (i, line) in content.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let record: OrderLogRecord = serde_json::from_str(trimmed)
            .with_context(|| format!("parse audit record at line {}", i + 1))?;
        line_count += 1;

        if record.hash_prev != prev_hash {
            return Ok(VerifyResult::Broken {
                line: i + 1,
                reason: format!(
                    "hash_prev mismatch: expected {prev_hash:?}, got {:?}",
                    record.hash_prev
                ),
            });
        }
        if let Some(ref claimed) = record.hash_self {
            let recomputed = compute_record_hash(&record)?;
            if *claimed != recomputed {
                return Ok(VerifyResult::Broken {
                    line: i + 1,
                    reason: format!("hash_self mismatch: claimed {claimed}, recomputed {recomputed}"),
                });
            }
        }
        prev_hash = record.hash_self.clone();
    }

    Ok(VerifyResult::Valid { lines: line_count })
}

#[cfg(test)]
mod tests {
    use super::*;
    use OrderLogEventType::*;

    fn record(event_type: OrderLogEventType) -> OrderLogRecord {
        OrderLogRecord::new(
            Some("sub-1".to_string()),
            "SBIN",
            "NSE",
            "MARKET",
            "BUY",
            10,
            event_type,
        )
    }

    // --- lifecycle validation ---

    #[test]
    fn legal_flows_pass() {
        for flow in [
            vec![],
            vec![Generated],
            vec![Generated, DryRun],
            vec![Generated, Submitted],
            vec![Generated, Submitted, Placed],
            vec![Generated, Submitted, Failed],
            vec![Generated, Submitted, Placed, Filled],
            vec![Generated, Submitted, Placed, Rejected],
        ] {
            assert!(validate_event_sequence(&flow).is_ok(), "flow {flow:?}");
        }
    }

    #[test]
    fn illegal_flows_fail() {
        for flow in [
            vec![Submitted],
            vec![Generated, Placed],
            vec![Generated, DryRun, Submitted],
            vec![Generated, Submitted, Filled],
            vec![Generated, Submitted, Placed, Failed],
            vec![Generated, Generated],
        ] {
            assert!(validate_event_sequence(&flow).is_err(), "flow {flow:?}");
        }
    }

    #[test]
    fn sequence_error_names_the_transition() {
        let err = validate_event_sequence(&[Generated, Placed]).unwrap_err();
        assert_eq!(err.index, 1);
        assert_eq!(err.from, Some(Generated));
        assert_eq!(err.to, Placed);
    }

    // --- writer + hash chain ---

    #[test]
    fn append_builds_verifiable_chain() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("orders.jsonl");
        let mut log = OrderAuditLog::new(&path, true).unwrap();

        log.append(record(Generated)).unwrap();
        log.append(record(Submitted)).unwrap();
        log.append(record(Placed)).unwrap();

        assert_eq!(log.seq(), 3);
        match verify_hash_chain(&path).unwrap() {
            VerifyResult::Valid { lines } => assert_eq!(lines, 3),
            broken => panic!("chain unexpectedly broken: {broken:?}"),
        }
    }

    #[test]
    fn tampering_breaks_the_chain() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("orders.jsonl");
        let mut log = OrderAuditLog::new(&path, true).unwrap();
        log.append(record(Generated)).unwrap();
        log.append(record(Submitted)).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let tampered = content.replace("\"quantity\":10", "\"quantity\":10000");
        assert_ne!(content, tampered);
        match verify_hash_chain_str(&tampered).unwrap() {
            VerifyResult::Broken { line, .. } => assert!(line >= 1),
            VerifyResult::Valid { .. } => panic!("tampering must break the chain"),
        }
    }

    #[test]
    fn record_ids_are_deterministic_for_identical_streams() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = OrderAuditLog::new(dir.path().join("a.jsonl"), true).unwrap();
        let mut b = OrderAuditLog::new(dir.path().join("b.jsonl"), true).unwrap();

        let mut base = record(Generated);
        base.created_at = chrono::TimeZone::timestamp_opt(&Utc, 1_700_000_000, 0).unwrap();

        let ra = a.append(base.clone()).unwrap();
        let rb = b.append(base).unwrap();
        assert_eq!(ra.record_id, rb.record_id);
    }

    #[test]
    fn resume_continues_the_chain() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("orders.jsonl");

        let last_hash;
        {
            let mut log = OrderAuditLog::new(&path, true).unwrap();
            log.append(record(Generated)).unwrap();
            last_hash = log.last_hash().map(str::to_string);
        }

        let mut resumed = OrderAuditLog::new(&path, true).unwrap();
        resumed.resume(last_hash, 1);
        resumed.append(record(Submitted)).unwrap();

        match verify_hash_chain(&path).unwrap() {
            VerifyResult::Valid { lines } => assert_eq!(lines, 2),
            broken => panic!("chain unexpectedly broken: {broken:?}"),
        }
    }

    #[test]
    fn plain_log_without_chain_still_verifies() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("orders.jsonl");
        let mut log = OrderAuditLog::new(&path, false).unwrap();
        log.append(record(Generated)).unwrap();
        log.append(record(DryRun)).unwrap();
        assert!(matches!(
            verify_hash_chain(&path).unwrap(),
            VerifyResult::Valid { lines: 2 }
        ));
    }
}
