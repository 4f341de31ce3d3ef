//! Message envelope and statistics types shared by the communicator and
//! its callers.
//!
//! The wire envelope is a single JSON object with camelCase keys:
//!
//! ```json
//! {
//!   "messageId": "…",
//!   "deviceId":  "…",
//!   "command":   "…",
//!   "payload":   { },
//!   "timestamp": 1735689600123,
//!   "priority":  0
//! }
//! ```
//!
//! On the socket each envelope travels inside a 4-byte big-endian length
//! frame (see [`crate::connection::session`]).

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Wall-clock milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// The envelope the core transports between device processes and clients.
///
/// `device_id` doubles as the routing tag: on a server an empty
/// `device_id` broadcasts to every connected client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CommunicationMessage {
    pub message_id: String,
    pub device_id: String,
    pub command: String,
    pub payload: Value,
    pub timestamp: i64,
    pub priority: i32,
}

impl Default for CommunicationMessage {
    fn default() -> Self {
        Self {
            message_id: String::new(),
            device_id: String::new(),
            command: String::new(),
            payload: Value::Null,
            timestamp: now_millis(),
            priority: 0,
        }
    }
}

impl CommunicationMessage {
    /// Creates a message with a fresh id and the current timestamp.
    pub fn new(device_id: impl Into<String>, command: impl Into<String>, payload: Value) -> Self {
        Self {
            message_id: generate_message_id(),
            device_id: device_id.into(),
            command: command.into(),
            payload,
            timestamp: now_millis(),
            priority: 0,
        }
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Fills in a message id if the caller left it empty. The timestamp is
    /// never touched after creation.
    pub fn ensure_id(&mut self) {
        if self.message_id.is_empty() {
            self.message_id = generate_message_id();
        }
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn from_json(value: &Value) -> crate::error::Result<Self> {
        Ok(serde_json::from_value(value.clone())?)
    }

    /// Fallback message synthesized when inbound data fails to parse.
    pub(crate) fn parse_failure(raw: &str, error: &str) -> Self {
        Self {
            message_id: generate_message_id(),
            device_id: String::new(),
            command: String::from("error"),
            payload: serde_json::json!({ "error": error, "raw_data": raw }),
            timestamp: now_millis(),
            priority: 0,
        }
    }
}

pub(crate) fn generate_message_id() -> String {
    format!("tcp_{}", Uuid::new_v4().simple())
}

/// Acknowledgement for a sent [`CommunicationMessage`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommunicationResponse {
    pub message_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Time from accepting the message to the response, in milliseconds.
    pub response_time: u64,
    pub timestamp: i64,
}

impl CommunicationResponse {
    pub fn success(message_id: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            message_id: message_id.into(),
            success: true,
            error_message: None,
            response_time: elapsed.as_millis() as u64,
            timestamp: now_millis(),
        }
    }

    pub fn failure(message_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            success: false,
            error_message: Some(error.into()),
            response_time: 0,
            timestamp: now_millis(),
        }
    }
}

/// Aggregate statistics exposed by
/// [`DeviceCommunicator::statistics`](crate::communicator::DeviceCommunicator::statistics).
///
/// Response times are milliseconds; the average uses the running
/// `avg = (avg + sample) / 2` form so recent traffic dominates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CommunicationStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub messages_error: u64,
    pub average_response_time: f64,
    pub min_response_time: f64,
    pub max_response_time: f64,
    /// Epoch milliseconds of the most recent send or receive; 0 = never.
    pub last_activity: i64,
}

impl CommunicationStats {
    pub(crate) fn record_response(&mut self, response: &CommunicationResponse) {
        if response.success {
            self.messages_sent += 1;
        } else {
            self.messages_error += 1;
        }

        if response.response_time > 0 {
            let sample = response.response_time as f64;
            self.average_response_time = (self.average_response_time + sample) / 2.0;
            if self.min_response_time == 0.0 || sample < self.min_response_time {
                self.min_response_time = sample;
            }
            if sample > self.max_response_time {
                self.max_response_time = sample;
            }
        }

        self.last_activity = response.timestamp;
    }

    pub(crate) fn record_received(&mut self) {
        self.messages_received += 1;
        self.last_activity = now_millis();
    }
}
