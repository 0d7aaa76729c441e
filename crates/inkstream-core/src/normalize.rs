use crate::{Notification, NotificationId};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;

/// Event name the push channel uses for notification deliveries.
pub const NOTIFICATION_EVENT: &str = "ReceiveNotification";

const NOTIFICATION_EVENT_ALIASES: &[&str] = &[
    "receivenotification",
    "notification",
    "notification_created",
    "newnotification",
];
const ID_KEYS: &[&str] = &["id", "Id", "ID"];
const EVENT_KEYS: &[&str] = &["target", "Target", "event", "Event", "type", "Type"];
const PAYLOAD_KEYS: &[&str] = &[
    "payload",
    "Payload",
    "data",
    "Data",
    "arguments",
    "Arguments",
];
const MESSAGE_KEYS: &[&str] = &["message", "Message", "content", "Content"];
const PAGE_KEYS: &[&str] = &["items", "Items", "data", "Data", "notifications"];
// SignalR-style transports terminate every JSON record with this byte.
const RECORD_SEPARATOR: char = '\u{1e}';

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("expected a json object, found {0}")]
    NotAnObject(&'static str),
    #[error("payload has no id")]
    MissingId,
    #[error("payload id is not an integer: {0}")]
    InvalidId(String),
    #[error("page has no notification list")]
    MissingItems,
}

/// What one push frame carried once envelopes are peeled off.
#[derive(Debug)]
pub enum PushFrame {
    Notifications(Vec<Result<Notification, NormalizeError>>),
    Other(String),
}

#[derive(Debug, Default, Deserialize)]
struct RawNotification {
    #[serde(default, alias = "Id", alias = "ID")]
    id: Option<Value>,
    #[serde(default, alias = "Message", alias = "content", alias = "Content")]
    message: Option<String>,
    #[serde(default, alias = "Url", alias = "URL", alias = "link", alias = "Link")]
    url: Option<String>,
    #[serde(default, rename = "isRead", alias = "IsRead", alias = "is_read")]
    is_read: Option<bool>,
    #[serde(
        default,
        rename = "createdAt",
        alias = "CreatedAt",
        alias = "created_at"
    )]
    created_at: Option<String>,
}

/// Maps one notification-shaped object onto [`Notification`].
///
/// `received_at` stands in for a missing or unreadable `createdAt`. A payload
/// without a usable id is rejected; nothing here invents identities.
pub fn normalize_value(
    value: &Value,
    received_at: DateTime<Utc>,
) -> Result<Notification, NormalizeError> {
    if !value.is_object() {
        return Err(NormalizeError::NotAnObject(json_kind(value)));
    }
    let raw: RawNotification = serde_json::from_value(value.clone())?;
    let id = parse_id(raw.id.as_ref())?;
    let created_at = raw
        .created_at
        .as_deref()
        .and_then(parse_timestamp)
        .unwrap_or(received_at);
    Ok(Notification {
        id,
        message: raw.message.unwrap_or_default(),
        url: raw
            .url
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty()),
        is_read: raw.is_read.unwrap_or(false),
        created_at,
    })
}

pub fn decode_push_frame(
    text: &str,
    received_at: DateTime<Utc>,
) -> Result<PushFrame, NormalizeError> {
    let trimmed = text.trim().trim_end_matches(RECORD_SEPARATOR);
    let value: Value = serde_json::from_str(trimmed)?;
    let payloads = match value {
        Value::Array(items) => items,
        Value::Object(map) => match unwrap_envelope(map) {
            Ok(payloads) => payloads,
            Err(event) => return Ok(PushFrame::Other(event)),
        },
        other => return Err(NormalizeError::NotAnObject(json_kind(&other))),
    };
    Ok(PushFrame::Notifications(
        payloads
            .iter()
            .map(|payload| normalize_value(payload, received_at))
            .collect(),
    ))
}

/// Pulls the record list out of a list-endpoint response.
pub fn decode_page(value: Value) -> Result<Vec<Value>, NormalizeError> {
    match value {
        Value::Array(items) => Ok(items),
        Value::Object(mut map) => {
            for key in PAGE_KEYS {
                if let Some(Value::Array(items)) = map.remove(*key) {
                    return Ok(items);
                }
            }
            Err(NormalizeError::MissingItems)
        }
        other => Err(NormalizeError::NotAnObject(json_kind(&other))),
    }
}

fn unwrap_envelope(map: Map<String, Value>) -> Result<Vec<Value>, String> {
    if ID_KEYS.iter().any(|key| map.contains_key(*key)) {
        return Ok(vec![Value::Object(map)]);
    }
    let event = match EVENT_KEYS.iter().find_map(|key| map.get(*key)) {
        Some(Value::String(event)) => event.clone(),
        // Numeric frame kinds (pings, acks) carry no notification.
        Some(other) => return Err(other.to_string()),
        None => return Ok(vec![Value::Object(map)]),
    };
    if !is_notification_event(&event) {
        // A bare notification whose `type` is its category, sent without an
        // id: surface it as malformed rather than as a foreign event.
        if MESSAGE_KEYS.iter().any(|key| map.contains_key(*key)) {
            return Ok(vec![Value::Object(map)]);
        }
        return Err(event);
    }
    let payload = PAYLOAD_KEYS.iter().find_map(|key| map.get(*key)).cloned();
    match payload {
        Some(Value::Array(items)) => Ok(items),
        Some(value) => Ok(vec![value]),
        None => Ok(vec![Value::Object(map)]),
    }
}

fn is_notification_event(event: &str) -> bool {
    let normalized = event.trim().to_ascii_lowercase();
    NOTIFICATION_EVENT_ALIASES.contains(&normalized.as_str())
}

fn parse_id(raw: Option<&Value>) -> Result<NotificationId, NormalizeError> {
    match raw {
        None | Some(Value::Null) => Err(NormalizeError::MissingId),
        Some(Value::Number(n)) => n
            .as_i64()
            .ok_or_else(|| NormalizeError::InvalidId(n.to_string())),
        Some(Value::String(s)) if s.trim().is_empty() => Err(NormalizeError::MissingId),
        Some(Value::String(s)) => s
            .trim()
            .parse::<NotificationId>()
            .map_err(|_| NormalizeError::InvalidId(s.clone())),
        Some(other) => Err(NormalizeError::InvalidId(other.to_string())),
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
