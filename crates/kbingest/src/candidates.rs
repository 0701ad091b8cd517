//! Candidate papers discovered by crawlers, which can be turned into job items.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::{ItemRequest, ItemType};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub title: String,
    /// Page the paper was found on.
    pub source_url: String,
    /// Direct link to the PDF when the crawler could resolve one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pdf_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub month: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exam_type: Option<String>,
}

impl Candidate {
    /// URL the pipeline should fetch.
    pub fn fetch_url(&self) -> &str {
        self.pdf_url
            .as_deref()
            .filter(|u| !u.trim().is_empty())
            .unwrap_or(&self.source_url)
    }

    pub fn into_item_request(self) -> ItemRequest {
        ItemRequest {
            item_type: ItemType::ExamPaper,
            source_url: self.fetch_url().to_string(),
            title: self.title,
            subject_ref: self.subject_code,
            year: self.year,
            month: self.month,
            exam_type: self.exam_type,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateFilter {
    #[serde(default)]
    pub subject_code: Option<String>,
    /// Case-insensitive match against the title.
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl CandidateFilter {
    pub fn matches(&self, candidate: &Candidate) -> bool {
        if let Some(code) = &self.subject_code {
            let same = candidate
                .subject_code
                .as_deref()
                .is_some_and(|c| c.eq_ignore_ascii_case(code));
            if !same {
                return false;
            }
        }
        if let Some(query) = &self.query {
            if !candidate
                .title
                .to_lowercase()
                .contains(&query.to_lowercase())
            {
                return false;
            }
        }
        true
    }
}

/// Interface implemented by crawlers.
#[async_trait]
pub trait CandidateProvider: Send + Sync {
    async fn search(&self, filter: &CandidateFilter) -> Result<Vec<Candidate>>;
}

/// Serves a fixed candidate list, e.g. one loaded from a crawler export.
#[derive(Debug, Clone, Default)]
pub struct StaticCandidateProvider {
    candidates: Vec<Candidate>,
}

impl StaticCandidateProvider {
    pub fn new(candidates: Vec<Candidate>) -> Self {
        Self { candidates }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let candidates: Vec<Candidate> = serde_json::from_str(json)
            .map_err(|e| crate::error::IngestError::Validation(format!("candidate list: {}", e)))?;
        Ok(Self::new(candidates))
    }
}

#[async_trait]
impl CandidateProvider for StaticCandidateProvider {
    async fn search(&self, filter: &CandidateFilter) -> Result<Vec<Candidate>> {
        let limit = filter.limit.unwrap_or(usize::MAX);
        Ok(self
            .candidates
            .iter()
            .filter(|c| filter.matches(c))
            .take(limit)
            .cloned()
            .collect())
    }
}
