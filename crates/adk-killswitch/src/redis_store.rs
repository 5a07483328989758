use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use redis::{aio::ConnectionManager, AsyncCommands};
use tokio::sync::mpsc;
use tracing::warn;

use crate::events::{KillSwitchEvent, KillSwitchState};
use crate::{KillSwitchStore, EVENT_CHANNEL, GLOBAL_KEY, STRATEGY_KEY_PREFIX, USER_KEY_PREFIX};

/// Redis-backed kill switch.
///
/// State is a hash per scope key (`active`, `reason`, `activated_by`,
/// `activated_at`); deactivation deletes the key. Every write publishes a
/// JSON event on `killswitch:events` so all supervisor replicas converge.
/// Last writer wins; the pub/sub event establishes ordering for subscribers.
pub struct RedisKillSwitch {
    client: redis::Client,
    conn: ConnectionManager,
}

impl RedisKillSwitch {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .with_context(|| format!("invalid redis url {redis_url}"))?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .context("redis connection failed")?;
        Ok(Self { client, conn })
    }

    async fn set_state(&self, key: &str, scope: &str, reason: &str, activated_by: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let fields = [
            ("active", "true".to_string()),
            ("reason", reason.to_string()),
            ("activated_by", activated_by.to_string()),
            ("activated_at", Utc::now().to_rfc3339()),
            ("scope", scope.to_string()),
        ];
        let _: () = conn
            .hset_multiple(key, &fields)
            .await
            .with_context(|| format!("hset {key}"))?;
        Ok(())
    }

    async fn clear_state(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(key).await.with_context(|| format!("del {key}"))?;
        Ok(())
    }

    async fn key_active(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let active: Option<String> = conn
            .hget(key, "active")
            .await
            .with_context(|| format!("hget {key} active"))?;
        Ok(active.as_deref() == Some("true"))
    }

    async fn read_state(&self, key: &str) -> Result<Option<KillSwitchState>> {
        let mut conn = self.conn.clone();
        let fields: std::collections::HashMap<String, String> = conn
            .hgetall(key)
            .await
            .with_context(|| format!("hgetall {key}"))?;
        if fields.is_empty() {
            return Ok(None);
        }
        let activated_at = fields
            .get("activated_at")
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);
        Ok(Some(KillSwitchState {
            is_active: fields.get("active").map(|s| s == "true").unwrap_or(false),
            reason: fields.get("reason").cloned().unwrap_or_default(),
            activated_by: fields.get("activated_by").cloned().unwrap_or_default(),
            activated_at,
            scope: fields.get("scope").cloned().unwrap_or_default(),
        }))
    }

    async fn publish(&self, event: &KillSwitchEvent) -> Result<()> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(event).context("serialize kill-switch event")?;
        let _: () = conn
            .publish(EVENT_CHANNEL, payload)
            .await
            .context("publish kill-switch event")?;
        Ok(())
    }
}

#[async_trait]
impl KillSwitchStore for RedisKillSwitch {
    async fn activate_global(&self, reason: &str, activated_by: &str) -> Result<()> {
        self.set_state(GLOBAL_KEY, "global", reason, activated_by)
            .await?;
        self.publish(&KillSwitchEvent::GlobalStop {
            reason: reason.to_string(),
            activated_by: activated_by.to_string(),
        })
        .await
    }

    async fn deactivate_global(&self, deactivated_by: &str) -> Result<()> {
        self.clear_state(GLOBAL_KEY).await?;
        self.publish(&KillSwitchEvent::GlobalResume {
            deactivated_by: deactivated_by.to_string(),
        })
        .await
    }

    async fn is_global_active(&self) -> Result<bool> {
        self.key_active(GLOBAL_KEY).await
    }

    async fn activate_for_user(
        &self,
        user_id: &str,
        reason: &str,
        activated_by: &str,
    ) -> Result<()> {
        let key = format!("{USER_KEY_PREFIX}{user_id}");
        self.set_state(&key, &format!("user:{user_id}"), reason, activated_by)
            .await?;
        self.publish(&KillSwitchEvent::UserStop {
            user_id: user_id.to_string(),
            reason: reason.to_string(),
        })
        .await
    }

    async fn deactivate_for_user(&self, user_id: &str) -> Result<()> {
        self.clear_state(&format!("{USER_KEY_PREFIX}{user_id}"))
            .await?;
        self.publish(&KillSwitchEvent::UserResume {
            user_id: user_id.to_string(),
        })
        .await
    }

    async fn is_user_active(&self, user_id: &str) -> Result<bool> {
        if self.is_global_active().await? {
            return Ok(true);
        }
        self.key_active(&format!("{USER_KEY_PREFIX}{user_id}")).await
    }

    async fn activate_for_strategy(
        &self,
        subscription_id: &str,
        reason: &str,
        activated_by: &str,
    ) -> Result<()> {
        let key = format!("{STRATEGY_KEY_PREFIX}{subscription_id}");
        self.set_state(
            &key,
            &format!("strategy:{subscription_id}"),
            reason,
            activated_by,
        )
        .await?;
        self.publish(&KillSwitchEvent::StrategyStop {
            subscription_id: subscription_id.to_string(),
            reason: reason.to_string(),
        })
        .await
    }

    async fn deactivate_for_strategy(&self, subscription_id: &str) -> Result<()> {
        self.clear_state(&format!("{STRATEGY_KEY_PREFIX}{subscription_id}"))
            .await
    }

    async fn is_strategy_active(&self, subscription_id: &str, user_id: &str) -> Result<bool> {
        if self.is_user_active(user_id).await? {
            return Ok(true);
        }
        self.key_active(&format!("{STRATEGY_KEY_PREFIX}{subscription_id}"))
            .await
    }

    async fn get_global_state(&self) -> Result<Option<KillSwitchState>> {
        self.read_state(GLOBAL_KEY).await
    }

    async fn get_user_state(&self, user_id: &str) -> Result<Option<KillSwitchState>> {
        self.read_state(&format!("{USER_KEY_PREFIX}{user_id}")).await
    }

    async fn subscribe_events(&self) -> Result<mpsc::Receiver<KillSwitchEvent>> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .context("redis pubsub connection failed")?;
        pubsub
            .subscribe(EVENT_CHANNEL)
            .await
            .context("subscribe to kill-switch channel")?;

        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(err) => {
                        warn!(%err, "unreadable kill-switch payload");
                        continue;
                    }
                };
                match serde_json::from_str::<KillSwitchEvent>(&payload) {
                    Ok(event) => {
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    // Unknown messages on the channel are logged and ignored.
                    Err(err) => warn!(%err, payload, "ignoring unknown kill-switch message"),
                }
            }
        });
        Ok(rx)
    }
}
