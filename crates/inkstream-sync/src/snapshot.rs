use crate::api::NotificationApi;
use crate::error::SyncResult;
use crate::identity::Credential;
use chrono::Utc;
use inkstream_core::{normalize_value, sort_newest_first, Notification};
use std::sync::Arc;
use tracing::{debug, warn};

const FIRST_PAGE: u32 = 1;

/// One-shot fetch of the most recent persisted notifications. Does not touch
/// reconciler state; the engine hands the result over.
#[derive(Clone)]
pub struct SnapshotLoader {
    api: Arc<dyn NotificationApi>,
    page_size: u32,
}

impl SnapshotLoader {
    pub fn new(api: Arc<dyn NotificationApi>, page_size: u32) -> Self {
        Self {
            api,
            page_size: page_size.max(1),
        }
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub async fn fetch_recent(&self, credential: &Credential) -> SyncResult<Vec<Notification>> {
        let records = self
            .api
            .list(credential, FIRST_PAGE, self.page_size)
            .await?;
        let received_at = Utc::now();
        let mut items = Vec::with_capacity(records.len());
        for record in &records {
            match normalize_value(record, received_at) {
                Ok(item) => items.push(item),
                Err(err) => warn!("snapshot_record_skipped: {err}"),
            }
        }
        sort_newest_first(&mut items);
        debug!(
            "snapshot_fetched records={} kept={}",
            records.len(),
            items.len()
        );
        Ok(items)
    }
}
