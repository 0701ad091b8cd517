//! File validation before anything is stored.

use serde::{Deserialize, Serialize};

use crate::fetch::FetchedFile;
use crate::model::JobType;

const MB: u64 = 1024 * 1024;

/// PDF readers accept the header anywhere in the first KiB.
const HEADER_SEARCH_WINDOW: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyLimits {
    pub max_bytes: u64,
    pub max_pages: u32,
}

impl PolicyLimits {
    /// Crawled exam papers are small; user uploads may be whole books of notes.
    pub fn for_job_type(job_type: JobType) -> Self {
        match job_type {
            JobType::BatchIngest => Self {
                max_bytes: 50 * MB,
                max_pages: 50,
            },
            JobType::BatchUpload => Self {
                max_bytes: 100 * MB,
                max_pages: 2000,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationOutcome {
    pub valid: bool,
    pub error: Option<String>,
    pub page_count: Option<u32>,
}

impl ValidationOutcome {
    pub fn ok(page_count: Option<u32>) -> Self {
        Self {
            valid: true,
            error: None,
            page_count,
        }
    }

    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            valid: false,
            error: Some(error.into()),
            page_count: None,
        }
    }
}

/// Interface implemented by file validators. Validation is CPU-bound, so the
/// pipeline runs it on the blocking pool.
pub trait Validator: Send + Sync {
    fn validate(&self, file: &FetchedFile, limits: &PolicyLimits) -> ValidationOutcome;
}

/// Accepts PDFs within the size and page limits.
#[derive(Debug, Default, Clone, Copy)]
pub struct PdfValidator;

impl PdfValidator {
    pub fn new() -> Self {
        Self
    }
}

impl Validator for PdfValidator {
    fn validate(&self, file: &FetchedFile, limits: &PolicyLimits) -> ValidationOutcome {
        if file.bytes.is_empty() {
            return ValidationOutcome::rejected("file is empty");
        }
        if file.size() > limits.max_bytes {
            return ValidationOutcome::rejected(format!(
                "file is {:.1} MB, limit is {} MB",
                file.size() as f64 / MB as f64,
                limits.max_bytes / MB
            ));
        }

        let window = &file.bytes[..file.bytes.len().min(HEADER_SEARCH_WINDOW)];
        if !window.windows(5).any(|w| w == b"%PDF-") {
            return ValidationOutcome::rejected(format!(
                "'{}' is not a PDF document",
                file.filename
            ));
        }

        let doc = match lopdf::Document::load_mem(&file.bytes) {
            Ok(doc) => doc,
            Err(e) => {
                log::debug!("lopdf failed to parse {}: {}", file.filename, e);
                return ValidationOutcome::rejected(format!(
                    "'{}' could not be parsed as PDF",
                    file.filename
                ));
            }
        };

        let pages = doc.get_pages().len() as u32;
        if pages == 0 {
            return ValidationOutcome::rejected("PDF has no pages");
        }
        if pages > limits.max_pages {
            return ValidationOutcome::rejected(format!(
                "PDF has {} pages, limit is {}",
                pages, limits.max_pages
            ));
        }

        ValidationOutcome::ok(Some(pages))
    }
}
