//! Fake collaborators with scripted behavior.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use lopdf::{dictionary, Document, Object};
use tokio::sync::Semaphore;

use kbingest::error::{FetchError, IndexingError, NotifyError};
use kbingest::fetch::{FetchedFile, SourceFetcher};
use kbingest::indexing::{DataSourceDescriptor, IndexingClient, PassReport};
use kbingest::notify::{Notification, NotificationKind, Notifier};

/// Builds a minimal, valid PDF with `pages` empty pages.
pub fn pdf_bytes(pages: usize) -> Vec<u8> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let kids: Vec<Object> = (0..pages)
        .map(|_| {
            doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "MediaBox" => vec![0.into(), 0.into(), 595.into(), 842.into()],
            })
            .into()
        })
        .collect();
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => pages as i64,
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut buffer = Vec::new();
    doc.save_to(&mut buffer).expect("Failed to serialize test PDF");
    buffer
}

/// Serves bytes by URL. Unknown URLs answer HTTP 404. A URL can be gated so
/// its fetch blocks until the test releases it.
#[derive(Default)]
pub struct MapFetcher {
    files: Mutex<HashMap<String, Vec<u8>>>,
    gates: Mutex<HashMap<String, Arc<Semaphore>>>,
    fetches: AtomicU32,
}

impl MapFetcher {
    pub fn insert(&self, url: &str, bytes: Vec<u8>) {
        self.files.lock().unwrap().insert(url.to_string(), bytes);
    }

    /// Blocks fetches of `url` until a permit is added to the returned gate.
    pub fn gate(&self, url: &str) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        self.gates
            .lock()
            .unwrap()
            .insert(url.to_string(), Arc::clone(&gate));
        gate
    }

    pub fn fetch_count(&self) -> u32 {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceFetcher for MapFetcher {
    async fn fetch(&self, source_url: &str) -> Result<FetchedFile, FetchError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let gate = self.gates.lock().unwrap().get(source_url).cloned();
        if let Some(gate) = gate {
            let _permit = gate.acquire().await.expect("gate closed");
        }

        let bytes = self.files.lock().unwrap().get(source_url).cloned();
        match bytes {
            Some(bytes) => Ok(FetchedFile {
                bytes,
                filename: kbingest::fetch::filename_from_url(source_url),
                content_type: Some("application/pdf".to_string()),
            }),
            None => Err(FetchError::Status {
                url: source_url.to_string(),
                status: 404,
            }),
        }
    }
}

/// One scripted answer to a pass status poll.
#[derive(Debug, Clone)]
pub enum PollAnswer {
    Report(PassReport),
    Throttle,
}

/// Indexing service fake. Pass polls pop answers from a script and repeat
/// `fallback` once it runs dry.
pub struct ScriptedIndex {
    script: Mutex<VecDeque<PollAnswer>>,
    fallback: Mutex<PassReport>,
    reject_titles: Mutex<HashSet<String>>,
    fail_pass_start: AtomicBool,
    throttled_registrations: AtomicU32,
    poll_gate: Mutex<Option<Arc<Semaphore>>>,
    registered: Mutex<Vec<DataSourceDescriptor>>,
    registration_attempts: AtomicU32,
    passes: Mutex<Vec<Vec<String>>>,
    polls: AtomicU32,
}

impl Default for ScriptedIndex {
    fn default() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(PassReport::new("INDEX_JOB_STATUS_IN_PROGRESS")),
            reject_titles: Mutex::new(HashSet::new()),
            fail_pass_start: AtomicBool::new(false),
            throttled_registrations: AtomicU32::new(0),
            poll_gate: Mutex::new(None),
            registered: Mutex::new(Vec::new()),
            registration_attempts: AtomicU32::new(0),
            passes: Mutex::new(Vec::new()),
            polls: AtomicU32::new(0),
        }
    }
}

impl ScriptedIndex {
    pub fn push_state(&self, state: &str) {
        self.script
            .lock()
            .unwrap()
            .push_back(PollAnswer::Report(PassReport::new(state)));
    }

    pub fn push_report(&self, report: PassReport) {
        self.script
            .lock()
            .unwrap()
            .push_back(PollAnswer::Report(report));
    }

    pub fn push_throttle(&self) {
        self.script.lock().unwrap().push_back(PollAnswer::Throttle);
    }

    /// Answer for every poll once the script is exhausted.
    pub fn set_fallback(&self, state: &str) {
        *self.fallback.lock().unwrap() = PassReport::new(state);
    }

    pub fn reject_registration_of(&self, title: &str) {
        self.reject_titles.lock().unwrap().insert(title.to_string());
    }

    pub fn fail_pass_start(&self, fail: bool) {
        self.fail_pass_start.store(fail, Ordering::SeqCst);
    }

    /// The next `n` registrations answer with a throttle.
    pub fn throttle_registrations(&self, n: u32) {
        self.throttled_registrations.store(n, Ordering::SeqCst);
    }

    /// Blocks status polls until a permit is added to the returned gate.
    /// The poll is counted before it blocks.
    pub fn gate_polls(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.poll_gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    pub fn registration_attempts(&self) -> u32 {
        self.registration_attempts.load(Ordering::SeqCst)
    }

    pub fn registered(&self) -> Vec<DataSourceDescriptor> {
        self.registered.lock().unwrap().clone()
    }

    pub fn passes(&self) -> Vec<Vec<String>> {
        self.passes.lock().unwrap().clone()
    }

    pub fn poll_count(&self) -> u32 {
        self.polls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IndexingClient for ScriptedIndex {
    async fn register_data_source(
        &self,
        _index_ref: &str,
        source: &DataSourceDescriptor,
    ) -> Result<String, IndexingError> {
        self.registration_attempts.fetch_add(1, Ordering::SeqCst);
        let throttle = self
            .throttled_registrations
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if throttle {
            return Err(IndexingError::Throttled { retry_after: None });
        }
        if self.reject_titles.lock().unwrap().contains(&source.title) {
            return Err(IndexingError::Status {
                status: 422,
                body: "unsupported document".to_string(),
            });
        }
        self.registered.lock().unwrap().push(source.clone());
        Ok(format!("ds-{}", source.item_id))
    }

    async fn start_indexing_pass(
        &self,
        _index_ref: &str,
        data_source_ids: &[String],
    ) -> Result<String, IndexingError> {
        if self.fail_pass_start.load(Ordering::SeqCst) {
            return Err(IndexingError::Status {
                status: 503,
                body: "unavailable".to_string(),
            });
        }
        let mut passes = self.passes.lock().unwrap();
        passes.push(data_source_ids.to_vec());
        Ok(format!("pass-{}", passes.len()))
    }

    async fn get_indexing_pass_status(&self, _pass_id: &str) -> Result<PassReport, IndexingError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        let gate = self.poll_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            let _permit = gate.acquire().await.expect("gate closed");
        }
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(PollAnswer::Report(report)) => Ok(report),
            Some(PollAnswer::Throttle) => Err(IndexingError::Throttled { retry_after: None }),
            None => Ok(self.fallback.lock().unwrap().clone()),
        }
    }
}

/// Keeps every notification it is handed.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn all(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }

    pub fn for_job(&self, job_id: &str) -> Vec<Notification> {
        self.all()
            .into_iter()
            .filter(|n| n.metadata.job_id == job_id)
            .collect()
    }

    /// Notifications for the job other than the `in_progress` one.
    pub fn terminal_for(&self, job_id: &str) -> Vec<Notification> {
        self.for_job(job_id)
            .into_iter()
            .filter(|n| n.kind != NotificationKind::InProgress)
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn emit(&self, notification: &Notification) -> Result<(), NotifyError> {
        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }
}
