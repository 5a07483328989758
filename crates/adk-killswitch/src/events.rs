use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// State of one kill-switch scope.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KillSwitchState {
    pub is_active: bool,
    pub reason: String,
    pub activated_by: String,
    pub activated_at: DateTime<Utc>,
    /// `global`, `user:<id>`, or `strategy:<subscription-id>`.
    pub scope: String,
}

/// Pub/sub event payloads. The JSON wire shape is
/// `{"type":"GLOBAL_STOP","reason":"…","activated_by":"…"}` etc.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum KillSwitchEvent {
    #[serde(rename = "GLOBAL_STOP")]
    GlobalStop { reason: String, activated_by: String },
    #[serde(rename = "GLOBAL_RESUME")]
    GlobalResume { deactivated_by: String },
    #[serde(rename = "USER_STOP")]
    UserStop { user_id: String, reason: String },
    #[serde(rename = "USER_RESUME")]
    UserResume { user_id: String },
    #[serde(rename = "STRATEGY_STOP")]
    StrategyStop {
        subscription_id: String,
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_stop_wire_shape() {
        let ev = KillSwitchEvent::GlobalStop {
            reason: "market halt".to_string(),
            activated_by: "admin".to_string(),
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "type": "GLOBAL_STOP",
                "reason": "market halt",
                "activated_by": "admin"
            })
        );
    }

    #[test]
    fn user_stop_round_trip() {
        let raw = r#"{"type":"USER_STOP","user_id":"u-9","reason":"risk"}"#;
        let ev: KillSwitchEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(
            ev,
            KillSwitchEvent::UserStop {
                user_id: "u-9".to_string(),
                reason: "risk".to_string()
            }
        );
    }

    #[test]
    fn unknown_event_type_fails_parse() {
        let raw = r#"{"type":"SOMETHING_ELSE"}"#;
        assert!(serde_json::from_str::<KillSwitchEvent>(raw).is_err());
    }
}
