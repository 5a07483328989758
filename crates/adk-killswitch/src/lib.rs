//! adk-killswitch
//!
//! Hierarchical emergency halt spanning three scopes:
//! global supersedes user supersedes strategy (subscription).
//!
//! State lives in a key/value store; writes broadcast events on a pub/sub
//! channel so every supervisor replica reacts in bounded time. Two backends
//! implement the same trait: Redis for multi-replica deployments, an
//! in-memory store for tests and single-node runs. The risk gate's fast path
//! reads a locally cached snapshot refreshed on events and bounded to 1 s of
//! staleness.

mod cache;
mod events;
mod memory;
mod redis_store;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

pub use cache::KillSwitchCache;
pub use events::{KillSwitchEvent, KillSwitchState};
pub use memory::MemoryKillSwitch;
pub use redis_store::RedisKillSwitch;

/// Key for the global scope.
pub const GLOBAL_KEY: &str = "killswitch:global";
/// Key prefix for user scope: `killswitch:user:<id>`.
pub const USER_KEY_PREFIX: &str = "killswitch:user:";
/// Key prefix for strategy scope: `killswitch:strategy:<subscription-id>`.
pub const STRATEGY_KEY_PREFIX: &str = "killswitch:strategy:";
/// Pub/sub channel for kill-switch events.
pub const EVENT_CHANNEL: &str = "killswitch:events";

/// The kill-switch contract shared by all backends.
///
/// `is_user_active` must return true while global is active;
/// `is_strategy_active` must return true while user or global is active.
/// Activation is idempotent (last writer wins); deactivating an inactive
/// scope is a no-op.
#[async_trait]
pub trait KillSwitchStore: Send + Sync {
    async fn activate_global(&self, reason: &str, activated_by: &str) -> Result<()>;
    async fn deactivate_global(&self, deactivated_by: &str) -> Result<()>;
    async fn is_global_active(&self) -> Result<bool>;

    async fn activate_for_user(&self, user_id: &str, reason: &str, activated_by: &str)
        -> Result<()>;
    async fn deactivate_for_user(&self, user_id: &str) -> Result<()>;
    async fn is_user_active(&self, user_id: &str) -> Result<bool>;

    async fn activate_for_strategy(
        &self,
        subscription_id: &str,
        reason: &str,
        activated_by: &str,
    ) -> Result<()>;
    async fn deactivate_for_strategy(&self, subscription_id: &str) -> Result<()>;
    async fn is_strategy_active(&self, subscription_id: &str, user_id: &str) -> Result<bool>;

    async fn get_global_state(&self) -> Result<Option<KillSwitchState>>;
    async fn get_user_state(&self, user_id: &str) -> Result<Option<KillSwitchState>>;

    /// Subscribe to the event channel. Events arrive in publish order as the
    /// backend delivers them; unknown payloads are logged and skipped by the
    /// backend pump.
    async fn subscribe_events(&self) -> Result<mpsc::Receiver<KillSwitchEvent>>;
}
