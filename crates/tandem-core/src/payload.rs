use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SagaError;
use crate::step::Phase;

/// Separator between the segments of an idempotency key.
pub const KEY_SEPARATOR: char = ':';

/// Prefix of the reply topic derived from a model id.
pub const REPLY_TOPIC_PREFIX: &str = "trans:";

/// Key under which a parent response is injected into child payload data.
pub const FORWARDED_RESPONSE_KEY: &str = "_response";

/// Stable identifier for one (transaction, step, phase) attempt boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyKey {
    pub transaction_id: String,
    pub action: String,
    pub phase: Phase,
}

impl IdempotencyKey {
    pub fn new(transaction_id: impl Into<String>, action: impl Into<String>, phase: Phase) -> Self {
        Self {
            transaction_id: transaction_id.into(),
            action: action.into(),
            phase,
        }
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{KEY_SEPARATOR}{}{KEY_SEPARATOR}{}",
            self.transaction_id, self.action, self.phase
        )
    }
}

impl FromStr for IdempotencyKey {
    type Err = SagaError;

    /// Parse `<transaction_id>:<action>:<phase>`. The split runs from the
    /// right so transaction ids may themselves contain the separator.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.rsplitn(3, KEY_SEPARATOR);
        let phase = parts.next();
        let action = parts.next();
        let transaction_id = parts.next();
        match (transaction_id, action, phase) {
            (Some(tx), Some(action), Some(phase)) if !tx.is_empty() && !action.is_empty() => {
                let phase = Phase::parse(phase).ok_or_else(|| {
                    SagaError::IllegalState(format!("unknown phase in idempotency key '{s}'"))
                })?;
                Ok(Self::new(tx, action, phase))
            }
            _ => Err(SagaError::IllegalState(format!(
                "malformed idempotency key '{s}'"
            ))),
        }
    }
}

/// Metadata delivered alongside every handler dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadMetadata {
    /// Model id of the emitting orchestrator.
    pub producer: String,
    /// Topic external workers answer on, `trans:<model_id>`.
    pub reply_to_topic: String,
    /// `<transaction_id>:<action>:<phase>`.
    pub idempotency_key: String,
    pub action: String,
    /// The phase being executed.
    pub action_type: Phase,
    /// 1-based dispatch attempt for this phase.
    pub attempt: u32,
    pub timestamp: DateTime<Utc>,
}

/// The value handed to the step handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionPayload {
    pub metadata: PayloadMetadata,
    /// Transaction input, with `_response` injected when the parent forwards
    /// its response.
    pub data: serde_json::Value,
}

/// Reply topic for a model.
pub fn reply_topic(model_id: &str) -> String {
    format!("{REPLY_TOPIC_PREFIX}{model_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_round_trip() {
        let key = IdempotencyKey::new("tx-1", "charge", Phase::Invoke);
        let s = key.to_string();
        assert_eq!(s, "tx-1:charge:invoke");
        assert_eq!(s.parse::<IdempotencyKey>().unwrap(), key);
    }

    #[test]
    fn test_key_parse_tx_with_separator() {
        let key: IdempotencyKey = "order:2026:08:refund:compensate".parse().unwrap();
        assert_eq!(key.transaction_id, "order:2026:08");
        assert_eq!(key.action, "refund");
        assert_eq!(key.phase, Phase::Compensate);
    }

    #[test]
    fn test_key_parse_rejects_malformed() {
        assert!("just-a-tx".parse::<IdempotencyKey>().is_err());
        assert!("tx:action:sideways".parse::<IdempotencyKey>().is_err());
        assert!(":action:invoke".parse::<IdempotencyKey>().is_err());
    }

    #[test]
    fn test_reply_topic() {
        assert_eq!(reply_topic("orders"), "trans:orders");
    }

    #[test]
    fn test_payload_serializes_phase_lowercase() {
        let payload = TransactionPayload {
            metadata: PayloadMetadata {
                producer: "orders".into(),
                reply_to_topic: reply_topic("orders"),
                idempotency_key: "tx:charge:invoke".into(),
                action: "charge".into(),
                action_type: Phase::Invoke,
                attempt: 1,
                timestamp: Utc::now(),
            },
            data: serde_json::json!({"amount": 5}),
        };
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["metadata"]["action_type"], "invoke");
        assert_eq!(value["data"]["amount"], 5);
    }
}
