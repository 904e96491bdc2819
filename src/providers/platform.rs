use async_trait::async_trait;
use serde::Serialize;

use super::{check, AckStatus, Acknowledgement, Platform};
use crate::error::ApiError;
use crate::model::tag::Tag;
use crate::model::time_record::TimeRecord;

/// HTTP client for the time-tracking platform's connect API.
pub struct PlatformClient {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl PlatformClient {
    pub fn new(base_url: String, api_key: String) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusUpdate<'a> {
    group_id: &'a str,
    status: AckStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<&'a str>,
}

#[async_trait]
impl Platform for PlatformClient {
    fn name(&self) -> &str {
        "platform"
    }

    async fn verify_access(&self) -> Result<(), ApiError> {
        let resp = self
            .client
            .get(self.url("team/info"))
            .header("x-api-key", &self.api_key)
            .send()
            .await?;
        check(resp).await.map(|_| ())
    }

    async fn fetch_posted_time(&self, limit: u32) -> Result<Vec<TimeRecord>, ApiError> {
        let resp = self
            .client
            .get(self.url("postedtime/fetch"))
            .header("x-api-key", &self.api_key)
            .query(&[("limit", limit)])
            .send()
            .await?;
        Ok(check(resp).await?.json().await?)
    }

    async fn upsert_tag(&self, tag: &Tag) -> Result<(), ApiError> {
        let resp = self
            .client
            .post(self.url("tag/upsert"))
            .header("x-api-key", &self.api_key)
            .json(tag)
            .send()
            .await?;
        check(resp).await.map(|_| ())
    }

    async fn acknowledge(&self, record_id: &str, ack: &Acknowledgement) -> Result<(), ApiError> {
        let body = StatusUpdate {
            group_id: record_id,
            status: ack.status,
            message: ack.message.as_deref(),
        };
        let resp = self
            .client
            .post(self.url("postedtime/status"))
            .header("x-api-key", &self.api_key)
            .json(&body)
            .send()
            .await?;
        check(resp).await.map(|_| ())
    }
}
