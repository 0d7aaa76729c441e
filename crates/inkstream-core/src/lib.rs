use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod normalize;

pub use normalize::{
    decode_page, decode_push_frame, normalize_value, NormalizeError, PushFrame,
    NOTIFICATION_EVENT,
};

pub type NotificationId = i64;

/// One notification as every surface sees it, whichever source delivered it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: NotificationId,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn is_unread(&self) -> bool {
        !self.is_read
    }
}

pub fn unread_count(items: &[Notification]) -> usize {
    items.iter().filter(|item| item.is_unread()).count()
}

/// Stable sort, so entries sharing a timestamp keep their delivery order.
pub fn sort_newest_first(items: &mut [Notification]) {
    items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
}
