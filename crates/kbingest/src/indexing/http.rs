//! HTTP client for the knowledge-base indexing API.

use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use super::{DataSourceDescriptor, IndexingClient, PassReport, PassState};
use crate::error::IndexingError;

/// Maximum length for error bodies kept in error messages.
const MAX_ERROR_BODY_LENGTH: usize = 200;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

fn truncate_body(body: &str) -> String {
    if body.len() > MAX_ERROR_BODY_LENGTH {
        let mut end = MAX_ERROR_BODY_LENGTH;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... (truncated)", &body[..end])
    } else {
        body.to_string()
    }
}

#[derive(Debug, Serialize)]
struct CreateDataSourceRequest<'a> {
    knowledge_base_uuid: &'a str,
    name: &'a str,
    item_path: &'a str,
    source_url: &'a str,
}

#[derive(Debug, Deserialize)]
struct CreateDataSourceResponse {
    knowledge_base_data_source: DataSourceBody,
}

#[derive(Debug, Deserialize)]
struct DataSourceBody {
    uuid: String,
}

#[derive(Debug, Serialize)]
struct StartIndexingJobRequest<'a> {
    knowledge_base_uuid: &'a str,
    data_source_uuids: &'a [String],
}

#[derive(Debug, Deserialize)]
struct IndexingJobResponse {
    job: IndexingJobBody,
}

#[derive(Debug, Deserialize)]
struct IndexingJobBody {
    uuid: String,
    #[serde(default)]
    phase: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    error: Option<String>,
}

impl IndexingJobBody {
    /// Picks the field that carries the most information. The service reports
    /// both a batch phase and an index status, and either may be the first to
    /// turn terminal. A failure in one wins over success in the other.
    fn into_report(self) -> PassReport {
        let phase = PassState::decode(&self.phase);
        let status = PassState::decode(&self.status);
        let state = match (&phase, &status) {
            (PassState::Failed, _) => self.phase,
            (_, PassState::Failed) => self.status,
            (p, _) if p.is_terminal() => self.phase,
            (_, s) if s.is_terminal() => self.status,
            _ if !self.status.is_empty() => self.status,
            _ => self.phase,
        };
        PassReport {
            state,
            detail: self.error,
        }
    }
}

/// reqwest-based [`IndexingClient`].
pub struct HttpIndexingClient {
    client: Client,
    base_url: String,
    api_token: Option<SecretString>,
}

impl HttpIndexingClient {
    pub fn new(
        base_url: &str,
        api_token: Option<SecretString>,
        timeout: Duration,
    ) -> Result<Self, IndexingError> {
        if base_url.trim().is_empty() {
            return Err(IndexingError::NotConfigured(
                "indexing base_url is empty".to_string(),
            ));
        }
        let client = Client::builder()
            .connect_timeout(DEFAULT_CONNECT_TIMEOUT)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_token,
        })
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_token {
            Some(token) => request.bearer_auth(token.expose_secret()),
            None => request,
        }
    }

    async fn check(response: Response) -> Result<Response, IndexingError> {
        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(IndexingError::Throttled { retry_after });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(IndexingError::Status {
                status: status.as_u16(),
                body: truncate_body(&body),
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl IndexingClient for HttpIndexingClient {
    async fn register_data_source(
        &self,
        index_ref: &str,
        source: &DataSourceDescriptor,
    ) -> Result<String, IndexingError> {
        let url = format!(
            "{}/v2/gen-ai/knowledge_bases/{}/data_sources",
            self.base_url, index_ref
        );
        let body = CreateDataSourceRequest {
            knowledge_base_uuid: index_ref,
            name: &source.title,
            item_path: &source.object_key,
            source_url: &source.storage_url,
        };

        let response = self
            .authorized(self.client.post(&url).json(&body))
            .send()
            .await?;
        let parsed: CreateDataSourceResponse = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| IndexingError::Decode(format!("data source response: {}", e)))?;

        debug!(
            "Registered data source {} for item {}",
            parsed.knowledge_base_data_source.uuid, source.item_id
        );
        Ok(parsed.knowledge_base_data_source.uuid)
    }

    async fn start_indexing_pass(
        &self,
        index_ref: &str,
        data_source_ids: &[String],
    ) -> Result<String, IndexingError> {
        let url = format!("{}/v2/gen-ai/indexing_jobs", self.base_url);
        let body = StartIndexingJobRequest {
            knowledge_base_uuid: index_ref,
            data_source_uuids: data_source_ids,
        };

        let response = self
            .authorized(self.client.post(&url).json(&body))
            .send()
            .await?;
        let parsed: IndexingJobResponse = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| IndexingError::Decode(format!("indexing job response: {}", e)))?;

        if parsed.job.uuid.is_empty() {
            return Err(IndexingError::Decode(
                "indexing job response has no uuid".to_string(),
            ));
        }
        Ok(parsed.job.uuid)
    }

    async fn get_indexing_pass_status(&self, pass_id: &str) -> Result<PassReport, IndexingError> {
        let url = format!("{}/v2/gen-ai/indexing_jobs/{}", self.base_url, pass_id);
        let response = self.authorized(self.client.get(&url)).send().await?;
        let parsed: IndexingJobResponse = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| IndexingError::Decode(format!("indexing job response: {}", e)))?;
        Ok(parsed.job.into_report())
    }
}
