use serde::{Deserialize, Serialize};

/// Normalised mutation notification produced by both storage backends and
/// consumed by the real-time bridge, then forwarded (after mass-op
/// buffering for edits/deletes) to WebSocket subscribers and push.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub chat_id: i64,
    #[serde(flatten)]
    pub data: ChangeEventData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ChangeEventData {
    NewMessage {
        message: serde_json::Value,
    },
    Edit {
        message_id: i64,
        new_text: String,
        edit_date: chrono::NaiveDateTime,
    },
    Delete {
        message_id: i64,
    },
}

impl ChangeEvent {
    pub fn kind(&self) -> &'static str {
        match &self.data {
            ChangeEventData::NewMessage { .. } => "new_message",
            ChangeEventData::Edit { .. } => "edit",
            ChangeEventData::Delete { .. } => "delete",
        }
    }

    /// `true` for events that bypass the mass-operation protector.
    pub fn is_new_message(&self) -> bool {
        matches!(self.data, ChangeEventData::NewMessage { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_chat_id_alongside_type_and_data() {
        let ev = ChangeEvent {
            chat_id: -1001,
            data: ChangeEventData::Delete { message_id: 42 },
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["chat_id"], -1001);
        assert_eq!(v["type"], "delete");
        assert_eq!(v["data"]["message_id"], 42);
    }

    #[test]
    fn round_trips_edit_event() {
        let json = serde_json::json!({
            "chat_id": 5,
            "type": "edit",
            "data": {"message_id": 100, "new_text": "hi", "edit_date": "2024-01-15T10:00:00"}
        });
        let ev: ChangeEvent = serde_json::from_value(json).unwrap();
        assert_eq!(ev.kind(), "edit");
        assert!(!ev.is_new_message());
    }
}
