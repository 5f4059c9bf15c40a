//! Notification normalization
//!
//! Server events arrive as a target name plus arbitrary JSON. Normalization
//! gives every event a unique id, a kind derived from the target name and a
//! UTC timestamp, and keeps the payload as it was received.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::types::{OrderStatusNotification, PurchaseOrderNotification, SystemAlertNotification};

pub const PURCHASE_ORDER_TAG: &str = "PurchaseOrderNotification";
pub const ORDER_STATUS_TAG: &str = "OrderStatusNotification";
pub const SYSTEM_ALERT_TAG: &str = "SystemAlertNotification";

/// Discriminates the payload shape of a notification
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum NotificationKind {
    PurchaseOrder,
    OrderStatus,
    SystemAlert,
    /// Any event tag without a known shape
    Other(String),
}

impl NotificationKind {
    pub fn as_str(&self) -> &str {
        match self {
            NotificationKind::PurchaseOrder => PURCHASE_ORDER_TAG,
            NotificationKind::OrderStatus => ORDER_STATUS_TAG,
            NotificationKind::SystemAlert => SYSTEM_ALERT_TAG,
            NotificationKind::Other(tag) => tag,
        }
    }
}

impl From<&str> for NotificationKind {
    fn from(tag: &str) -> Self {
        if tag.eq_ignore_ascii_case(PURCHASE_ORDER_TAG) {
            NotificationKind::PurchaseOrder
        } else if tag.eq_ignore_ascii_case(ORDER_STATUS_TAG) {
            NotificationKind::OrderStatus
        } else if tag.eq_ignore_ascii_case(SYSTEM_ALERT_TAG) {
            NotificationKind::SystemAlert
        } else {
            NotificationKind::Other(tag.to_string())
        }
    }
}

impl From<String> for NotificationKind {
    fn from(tag: String) -> Self {
        NotificationKind::from(tag.as_str())
    }
}

impl From<NotificationKind> for String {
    fn from(kind: NotificationKind) -> Self {
        kind.as_str().to_string()
    }
}

impl std::fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A server event in its normalized form
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
}

impl Notification {
    /// Build a notification, generating the id and defaulting the timestamp
    /// to now when they are not supplied
    pub fn stamp(
        kind: NotificationKind,
        payload: Value,
        timestamp: Option<DateTime<Utc>>,
        id: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.unwrap_or_else(|| generate_id(now)),
            kind,
            payload,
            timestamp: timestamp.unwrap_or(now),
            received_at: now,
        }
    }

    pub fn as_purchase_order(&self) -> Result<PurchaseOrderNotification> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    pub fn as_order_status(&self) -> Result<OrderStatusNotification> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    pub fn as_system_alert(&self) -> Result<SystemAlertNotification> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    /// `title` field of the payload, if it has one
    pub fn title(&self) -> Option<&str> {
        self.payload.get("title").and_then(Value::as_str)
    }
}

/// Normalize a raw server event received under `tag`
pub fn normalize(raw: Value, tag: &str) -> Notification {
    normalize_at(raw, tag, Utc::now())
}

/// [`normalize`] with an explicit arrival time
pub fn normalize_at(raw: Value, tag: &str, arrival: DateTime<Utc>) -> Notification {
    let timestamp = raw
        .get("timestamp")
        .and_then(parse_timestamp)
        .unwrap_or(arrival);

    Notification {
        id: generate_id(arrival),
        kind: NotificationKind::from(tag),
        payload: raw,
        timestamp,
        received_at: arrival,
    }
}

/// Collapse invocation arguments into a single payload value
pub fn payload_from_arguments(mut args: Vec<Value>) -> Value {
    match args.len() {
        0 => Value::Null,
        1 => args.remove(0),
        _ => Value::Array(args),
    }
}

fn generate_id(arrival: DateTime<Utc>) -> String {
    format!(
        "notification_{}_{}",
        arrival.timestamp_millis(),
        uuid::Uuid::new_v4().simple()
    )
}

/// Accepts RFC 3339, naive ISO-8601 (taken as UTC) and epoch milliseconds
fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(text) => {
            let text = text.trim();
            if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
                return Some(parsed.with_timezone(&Utc));
            }
            ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
                .iter()
                .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
                .map(|naive| naive.and_utc())
        }
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|ms| ms as i64))
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        _ => None,
    }
}
