//! Wire types shared between the real-time bridge, the WebSocket fan-out,
//! and the embedded backend's loop-back ingest endpoint.

pub mod change_event;
pub mod ws_message;

pub use change_event::{ChangeEvent, ChangeEventData};
pub use ws_message::{ClientAction, ClientMessage, ServerEvent};
