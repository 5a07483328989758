use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{broadcast, mpsc, RwLock};

use crate::events::{KillSwitchEvent, KillSwitchState};
use crate::{KillSwitchStore, GLOBAL_KEY, STRATEGY_KEY_PREFIX, USER_KEY_PREFIX};

/// In-memory kill switch for tests and single-node deployments.
///
/// Same key shapes and event payloads as the Redis backend; events are
/// delivered over a broadcast channel so multiple subscribers observe the
/// same publish order.
#[derive(Clone)]
pub struct MemoryKillSwitch {
    states: Arc<RwLock<HashMap<String, KillSwitchState>>>,
    events: broadcast::Sender<KillSwitchEvent>,
}

impl MemoryKillSwitch {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            states: Arc::new(RwLock::new(HashMap::new())),
            events,
        }
    }

    fn publish(&self, event: KillSwitchEvent) {
        // No subscriber yet is fine; state remains authoritative.
        let _ = self.events.send(event);
    }

    async fn is_key_active(&self, key: &str) -> bool {
        self.states
            .read()
            .await
            .get(key)
            .map(|s| s.is_active)
            .unwrap_or(false)
    }
}

impl Default for MemoryKillSwitch {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KillSwitchStore for MemoryKillSwitch {
    async fn activate_global(&self, reason: &str, activated_by: &str) -> Result<()> {
        self.states.write().await.insert(
            GLOBAL_KEY.to_string(),
            KillSwitchState {
                is_active: true,
                reason: reason.to_string(),
                activated_by: activated_by.to_string(),
                activated_at: Utc::now(),
                scope: "global".to_string(),
            },
        );
        self.publish(KillSwitchEvent::GlobalStop {
            reason: reason.to_string(),
            activated_by: activated_by.to_string(),
        });
        Ok(())
    }

    async fn deactivate_global(&self, deactivated_by: &str) -> Result<()> {
        self.states.write().await.remove(GLOBAL_KEY);
        self.publish(KillSwitchEvent::GlobalResume {
            deactivated_by: deactivated_by.to_string(),
        });
        Ok(())
    }

    async fn is_global_active(&self) -> Result<bool> {
        Ok(self.is_key_active(GLOBAL_KEY).await)
    }

    async fn activate_for_user(
        &self,
        user_id: &str,
        reason: &str,
        activated_by: &str,
    ) -> Result<()> {
        let key = format!("{USER_KEY_PREFIX}{user_id}");
        self.states.write().await.insert(
            key,
            KillSwitchState {
                is_active: true,
                reason: reason.to_string(),
                activated_by: activated_by.to_string(),
                activated_at: Utc::now(),
                scope: format!("user:{user_id}"),
            },
        );
        self.publish(KillSwitchEvent::UserStop {
            user_id: user_id.to_string(),
            reason: reason.to_string(),
        });
        Ok(())
    }

    async fn deactivate_for_user(&self, user_id: &str) -> Result<()> {
        self.states
            .write()
            .await
            .remove(&format!("{USER_KEY_PREFIX}{user_id}"));
        self.publish(KillSwitchEvent::UserResume {
            user_id: user_id.to_string(),
        });
        Ok(())
    }

    async fn is_user_active(&self, user_id: &str) -> Result<bool> {
        if self.is_global_active().await? {
            return Ok(true);
        }
        Ok(self
            .is_key_active(&format!("{USER_KEY_PREFIX}{user_id}"))
            .await)
    }

    async fn activate_for_strategy(
        &self,
        subscription_id: &str,
        reason: &str,
        activated_by: &str,
    ) -> Result<()> {
        let key = format!("{STRATEGY_KEY_PREFIX}{subscription_id}");
        self.states.write().await.insert(
            key,
            KillSwitchState {
                is_active: true,
                reason: reason.to_string(),
                activated_by: activated_by.to_string(),
                activated_at: Utc::now(),
                scope: format!("strategy:{subscription_id}"),
            },
        );
        self.publish(KillSwitchEvent::StrategyStop {
            subscription_id: subscription_id.to_string(),
            reason: reason.to_string(),
        });
        Ok(())
    }

    async fn deactivate_for_strategy(&self, subscription_id: &str) -> Result<()> {
        self.states
            .write()
            .await
            .remove(&format!("{STRATEGY_KEY_PREFIX}{subscription_id}"));
        Ok(())
    }

    async fn is_strategy_active(&self, subscription_id: &str, user_id: &str) -> Result<bool> {
        if self.is_user_active(user_id).await? {
            return Ok(true);
        }
        Ok(self
            .is_key_active(&format!("{STRATEGY_KEY_PREFIX}{subscription_id}"))
            .await)
    }

    async fn get_global_state(&self) -> Result<Option<KillSwitchState>> {
        Ok(self.states.read().await.get(GLOBAL_KEY).cloned())
    }

    async fn get_user_state(&self, user_id: &str) -> Result<Option<KillSwitchState>> {
        Ok(self
            .states
            .read()
            .await
            .get(&format!("{USER_KEY_PREFIX}{user_id}"))
            .cloned())
    }

    async fn subscribe_events(&self) -> Result<mpsc::Receiver<KillSwitchEvent>> {
        let (tx, rx) = mpsc::channel(256);
        let mut sub = self.events.subscribe();
        tokio::spawn(async move {
            loop {
                match sub.recv().await {
                    Ok(event) => {
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(rx)
    }
}
