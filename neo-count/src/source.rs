//! External count source: the object catalog answering "how many objects
//! were observed on date D".

use crate::config::CatalogConfig;
use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use url::Url;

/// Why a single date could not contribute to an aggregate
#[derive(Error, Debug)]
pub enum LookupError {
    #[error("Invalid catalog target: {0}")]
    InvalidTarget(String),

    #[error("Catalog request failed: {0}")]
    RequestFailed(String),

    #[error("Catalog responded with status {0}")]
    UnexpectedStatus(http::StatusCode),

    #[error("Failed to decode catalog response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Lookup cancelled")]
    Cancelled,

    #[error("Lookup task failed: {0}")]
    TaskFailed(String),
}

#[async_trait]
pub trait CountSource: Send + Sync {
    /// Number of objects the catalog reports for `date` (`YYYY-MM-DD`).
    async fn element_count(&self, date: &str) -> Result<u64, LookupError>;
}

#[derive(Deserialize)]
struct FeedResponse {
    element_count: u64,
}

/// Client for a NeoWs-style `feed` endpoint.
///
/// Each lookup asks for a single day (`start_date == end_date`) in detailed
/// mode. There is no retry and no client-side deadline; callers bound the
/// call by dropping its future.
#[derive(Clone)]
pub struct FeedClient {
    client: reqwest::Client,
    url: Url,
    api_key: String,
}

impl FeedClient {
    pub fn new(config: &CatalogConfig) -> Self {
        FeedClient {
            client: reqwest::Client::new(),
            url: config.url.clone(),
            api_key: config.api_key.clone(),
        }
    }

    fn build_request(&self, date: &str) -> Result<reqwest::Request, LookupError> {
        self.client
            .get(self.url.clone())
            .query(&[
                ("start_date", date),
                ("end_date", date),
                ("detailed", "true"),
                ("api_key", self.api_key.as_str()),
            ])
            .build()
            .map_err(|e| LookupError::InvalidTarget(e.to_string()))
    }
}

#[async_trait]
impl CountSource for FeedClient {
    async fn element_count(&self, date: &str) -> Result<u64, LookupError> {
        let request = self.build_request(date)?;

        let response = self
            .client
            .execute(request)
            .await
            .map_err(|e| LookupError::RequestFailed(e.without_url().to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(LookupError::UnexpectedStatus(status));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| LookupError::RequestFailed(e.without_url().to_string()))?;

        let feed: FeedResponse = serde_json::from_slice(&body)?;
        Ok(feed.element_count)
    }
}
