use serde::{Deserialize, Serialize};

use crate::change_event::ChangeEvent;

/// Inbound message on an open `/ws/updates` connection.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientMessage {
    pub action: ClientAction,
    pub chat_id: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientAction {
    Subscribe,
    Unsubscribe,
    Ping,
}

/// Outbound message on an open `/ws/updates` connection.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ServerEvent {
    Change(ChangeEvent),
    Pong(PongEvent),
}

#[derive(Debug, Clone, Serialize)]
pub struct PongEvent {
    #[serde(rename = "type")]
    pub kind: &'static str,
}

impl Default for PongEvent {
    fn default() -> Self {
        Self { kind: "pong" }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_subscribe_with_chat_id() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"action":"subscribe","chat_id":-1001}"#).unwrap();
        assert_eq!(msg.action, ClientAction::Subscribe);
        assert_eq!(msg.chat_id, Some(-1001));
    }

    #[test]
    fn parses_ping_without_chat_id() {
        let msg: ClientMessage = serde_json::from_str(r#"{"action":"ping"}"#).unwrap();
        assert_eq!(msg.action, ClientAction::Ping);
        assert_eq!(msg.chat_id, None);
    }

    #[test]
    fn pong_serializes_with_type_field() {
        let v = serde_json::to_value(ServerEvent::Pong(PongEvent::default())).unwrap();
        assert_eq!(v["type"], "pong");
    }
}
