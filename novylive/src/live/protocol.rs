//! Wire messages exchanged over the live channel.
//!
//! Everything is JSON with a `type` tag. Channel names follow the
//! `"state:" + id` convention for both keyed store slots and registered
//! notifiers.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Channel on which batched rebuild notifications are published.
pub const REBUILD_CHANNEL: &str = "rebuild";

/// Channel label used by the publish-to-all mode.
pub const ALL_CHANNEL: &str = "*";

/// Channel name for a store key or notifier ID.
pub fn state_channel(id: &str) -> String {
    format!("state:{id}")
}

/// Server-to-client messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMsg {
    /// First frame on every connection, carrying the server-assigned ID.
    Connected { id: String, timestamp: u64 },
    /// Channel fan-out payload.
    Broadcast {
        channel: String,
        data: Value,
        timestamp: u64,
    },
    /// A registered notifier changed value.
    ValueChange {
        id: String,
        value: Value,
        timestamp: u64,
    },
    /// Reply to a client-level ping.
    Pong { timestamp: u64 },
}

/// Client-to-server messages.
///
/// `subscribe`/`unsubscribe` name either a raw `channel` or a
/// `notifier_id` (shorthand for that notifier's state channel). An
/// `unsubscribe` naming neither is an unsubscribe-all and closes the
/// connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMsg {
    Subscribe {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channel: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        notifier_id: Option<String>,
    },
    Unsubscribe {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channel: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        notifier_id: Option<String>,
    },
    Ping,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn server_messages_carry_snake_case_type_tags() {
        let msg = ServerMsg::ValueChange {
            id: "counter".into(),
            value: json!(5),
            timestamp: 123,
        };
        let encoded = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            encoded,
            json!({ "type": "value_change", "id": "counter", "value": 5, "timestamp": 123 })
        );
    }

    #[test]
    fn client_subscribe_accepts_either_field() {
        let by_channel: ClientMsg =
            serde_json::from_value(json!({ "type": "subscribe", "channel": "rebuild" })).unwrap();
        assert_eq!(
            by_channel,
            ClientMsg::Subscribe {
                channel: Some("rebuild".into()),
                notifier_id: None,
            }
        );

        let by_notifier: ClientMsg =
            serde_json::from_value(json!({ "type": "subscribe", "notifier_id": "counter" }))
                .unwrap();
        assert_eq!(
            by_notifier,
            ClientMsg::Subscribe {
                channel: None,
                notifier_id: Some("counter".into()),
            }
        );
    }

    #[test]
    fn bare_ping_parses() {
        let msg: ClientMsg = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(msg, ClientMsg::Ping);
    }

    #[test]
    fn state_channel_prefixes_ids() {
        assert_eq!(state_channel("counter"), "state:counter");
    }
}
