//! Persistence API for notifications.
//!
//! The engine only talks to [`NotificationApi`]; [`HttpNotificationApi`] is the
//! REST implementation used by the binary.

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::identity::Credential;
use async_trait::async_trait;
use inkstream_core::{decode_page, NotificationId};
use reqwest::{Client, Method, Response, StatusCode};
use serde_json::Value;
use url::Url;

#[async_trait]
pub trait NotificationApi: Send + Sync {
    /// Raw records of one page, newest first as the server sees it.
    async fn list(
        &self,
        credential: &Credential,
        page: u32,
        page_size: u32,
    ) -> SyncResult<Vec<Value>>;

    async fn mark_read(&self, credential: &Credential, id: NotificationId) -> SyncResult<()>;

    async fn mark_all_read(&self, credential: &Credential) -> SyncResult<()>;

    async fn delete(&self, credential: &Credential, id: NotificationId) -> SyncResult<()>;
}

#[derive(Clone)]
pub struct HttpNotificationApi {
    client: Client,
    base: Url,
}

impl HttpNotificationApi {
    pub fn new(config: &SyncConfig) -> SyncResult<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            client,
            base: config.api_base.clone(),
        })
    }

    fn endpoint(&self, segments: &[&str]) -> SyncResult<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| SyncError::Config(format!("api url {} cannot be a base", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn send(&self, method: Method, url: Url, credential: &Credential) -> SyncResult<Response> {
        let response = self
            .client
            .request(method, url)
            .bearer_auth(credential.expose())
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, &body))
    }
}

#[async_trait]
impl NotificationApi for HttpNotificationApi {
    async fn list(
        &self,
        credential: &Credential,
        page: u32,
        page_size: u32,
    ) -> SyncResult<Vec<Value>> {
        let mut url = self.endpoint(&["notifications"])?;
        url.query_pairs_mut()
            .append_pair("page", &page.to_string())
            .append_pair("pageSize", &page_size.to_string());
        let response = self.send(Method::GET, url, credential).await?;
        let body: Value = response.json().await?;
        Ok(decode_page(body)?)
    }

    async fn mark_read(&self, credential: &Credential, id: NotificationId) -> SyncResult<()> {
        let id = id.to_string();
        let url = self.endpoint(&["notifications", id.as_str(), "read"])?;
        self.send(Method::PUT, url, credential).await?;
        Ok(())
    }

    async fn mark_all_read(&self, credential: &Credential) -> SyncResult<()> {
        let url = self.endpoint(&["notifications", "read-all"])?;
        self.send(Method::PUT, url, credential).await?;
        Ok(())
    }

    async fn delete(&self, credential: &Credential, id: NotificationId) -> SyncResult<()> {
        let id = id.to_string();
        let url = self.endpoint(&["notifications", id.as_str()])?;
        self.send(Method::DELETE, url, credential).await?;
        Ok(())
    }
}

fn classify_status(status: StatusCode, body: &str) -> SyncError {
    let detail = body.trim();
    let message = if detail.is_empty() {
        format!("status {status}")
    } else {
        format!("status {status}: {detail}")
    };
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => SyncError::Auth(message),
        _ => SyncError::Transport(message),
    }
}
