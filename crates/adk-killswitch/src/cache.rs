use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::Result;

use crate::events::KillSwitchEvent;
use crate::KillSwitchStore;

/// Max age of the cached snapshot before the authoritative store must be
/// consulted again.
pub const MAX_STALENESS: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct Inner {
    global_reason: Option<String>,
    user_reasons: HashMap<String, String>,
    strategy_reasons: HashMap<String, String>,
    refreshed_at: Instant,
}

/// Locally cached kill-switch snapshot for the risk gate's fast path.
///
/// The cache is updated on every pub/sub event and refreshed from the
/// authoritative store when a read observes it older than [`MAX_STALENESS`].
/// Strategy-scope deactivation publishes no event, so only a refresh clears
/// those entries.
pub struct KillSwitchCache {
    inner: Mutex<Inner>,
    max_staleness: Duration,
}

impl KillSwitchCache {
    pub fn new() -> Self {
        Self::with_staleness(MAX_STALENESS)
    }

    pub fn with_staleness(max_staleness: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                global_reason: None,
                user_reasons: HashMap::new(),
                strategy_reasons: HashMap::new(),
                refreshed_at: Instant::now(),
            }),
            max_staleness,
        }
    }

    /// Apply one pub/sub event. Event application counts as a refresh.
    pub fn apply_event(&self, event: &KillSwitchEvent) {
        let mut inner = self.inner.lock().expect("kill-switch cache poisoned");
        match event {
            KillSwitchEvent::GlobalStop { reason, .. } => {
                inner.global_reason = Some(reason.clone());
            }
            KillSwitchEvent::GlobalResume { .. } => {
                inner.global_reason = None;
            }
            KillSwitchEvent::UserStop { user_id, reason } => {
                inner.user_reasons.insert(user_id.clone(), reason.clone());
            }
            KillSwitchEvent::UserResume { user_id } => {
                inner.user_reasons.remove(user_id);
            }
            KillSwitchEvent::StrategyStop {
                subscription_id,
                reason,
            } => {
                inner
                    .strategy_reasons
                    .insert(subscription_id.clone(), reason.clone());
            }
        }
        inner.refreshed_at = Instant::now();
    }

    /// True when the snapshot is older than the staleness bound.
    pub fn is_stale(&self) -> bool {
        let inner = self.inner.lock().expect("kill-switch cache poisoned");
        inner.refreshed_at.elapsed() > self.max_staleness
    }

    /// Reload the snapshot from the authoritative store for the given
    /// (subscription, user) pairs — the set of active runners.
    pub async fn refresh(
        &self,
        store: &dyn KillSwitchStore,
        pairs: &[(String, String)],
    ) -> Result<()> {
        let global = store.get_global_state().await?;
        let mut users = HashMap::new();
        let mut strategies = HashMap::new();

        for (subscription_id, user_id) in pairs {
            if !users.contains_key(user_id) {
                if let Some(state) = store.get_user_state(user_id).await? {
                    if state.is_active {
                        users.insert(user_id.clone(), state.reason);
                    }
                }
            }
            // Strategy scope has no dedicated state getter beyond the active
            // probe; record a generic reason when tripped on its own.
            if store.is_strategy_active(subscription_id, user_id).await?
                && global.as_ref().map(|g| g.is_active) != Some(true)
                && !users.contains_key(user_id)
            {
                strategies.insert(
                    subscription_id.clone(),
                    "strategy kill switch active".to_string(),
                );
            }
        }

        let mut inner = self.inner.lock().expect("kill-switch cache poisoned");
        inner.global_reason = global.filter(|g| g.is_active).map(|g| g.reason);
        inner.user_reasons = users;
        inner.strategy_reasons = strategies;
        inner.refreshed_at = Instant::now();
        Ok(())
    }

    /// Hierarchy walk: global, then user, then strategy. Returns the blocking
    /// reason when any scope is active.
    pub fn blocked_reason(&self, subscription_id: &str, user_id: &str) -> Option<String> {
        let inner = self.inner.lock().expect("kill-switch cache poisoned");
        if let Some(reason) = &inner.global_reason {
            return Some(reason.clone());
        }
        if let Some(reason) = inner.user_reasons.get(user_id) {
            return Some(reason.clone());
        }
        inner.strategy_reasons.get(subscription_id).cloned()
    }
}

impl Default for KillSwitchCache {
    fn default() -> Self {
        Self::new()
    }
}
