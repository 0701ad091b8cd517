//! End-to-end job lifecycle tests: submit, process, confirm, cancel, retry.

mod common;

use common::TestHarness;
use kbingest::notify::NotificationKind;
use kbingest::storage::ObjectStorage;
use kbingest::{
    Caller, Candidate, CandidateFilter, ErrorKind, IngestionItem, ItemRequest, ItemStatus, ItemType,
    JobSnapshot, JobStatus, JobType, ListJobsFilter, StaticCandidateProvider,
};

async fn rejected(h: &TestHarness, items: Vec<ItemRequest>) -> ErrorKind {
    h.orchestrator
        .start_job(&h.owner, JobType::BatchUpload, items)
        .await
        .unwrap_err()
        .kind()
}

fn item<'a>(snapshot: &'a JobSnapshot, title: &str) -> &'a IngestionItem {
    snapshot
        .items
        .iter()
        .find(|i| i.title == title)
        .unwrap_or_else(|| panic!("no item titled {}", title))
}

#[tokio::test]
async fn test_full_batch_waits_for_pass_then_completes() {
    let h = TestHarness::new();
    for n in 1..=3 {
        h.add_pdf(&format!("https://papers.test/{}.pdf", n));
    }
    let receipt = h
        .submit_and_settle(
            (1..=3)
                .map(|n| {
                    TestHarness::document(
                        &format!("https://papers.test/{}.pdf", n),
                        &format!("Paper {}", n),
                    )
                })
                .collect(),
        )
        .await;
    assert_eq!(receipt.status, JobStatus::Pending);
    assert_eq!(receipt.total_items, 3);

    let snapshot = h.snapshot(&receipt.job_id);
    assert_eq!(snapshot.job.status, JobStatus::AwaitingExternalConfirmation);
    assert_eq!(snapshot.job.completed_items, 3);
    assert_eq!(snapshot.job.external_index_ref.as_deref(), Some("pass-1"));
    assert_eq!(snapshot.progress, 100);
    for item in &snapshot.items {
        assert_eq!(item.status, ItemStatus::Completed);
        assert!(item.created_entity_ref.is_some());
        assert!(item.storage_url.as_deref().unwrap().starts_with("memory://"));
        assert_eq!(item.data_source_id.as_deref(), Some(format!("ds-{}", item.id).as_str()));
    }
    assert_eq!(h.storage.len(), 3);
    assert_eq!(h.index.passes().len(), 1);
    assert_eq!(h.index.passes()[0].len(), 3);

    let in_progress = h.notifier.for_job(&receipt.job_id);
    assert_eq!(in_progress.len(), 1);
    assert_eq!(in_progress[0].kind, NotificationKind::InProgress);

    for _ in 0..3 {
        h.index.push_state("INDEX_JOB_STATUS_IN_PROGRESS");
    }
    h.index.push_state("INDEX_JOB_STATUS_COMPLETED");

    for _ in 0..3 {
        let report = h.reconcile().await;
        assert_eq!(report.checked, 1);
        assert_eq!(report.still_running, 1);
        assert_eq!(h.status(&receipt.job_id), JobStatus::AwaitingExternalConfirmation);
    }
    let report = h.reconcile().await;
    assert_eq!(report.finalized, 1);

    let snapshot = h.snapshot(&receipt.job_id);
    assert_eq!(snapshot.job.status, JobStatus::Completed);
    assert!(snapshot.job.completed_at.is_some());

    let terminal = h.notifier.terminal_for(&receipt.job_id);
    assert_eq!(terminal.len(), 1);
    assert_eq!(terminal[0].kind, NotificationKind::Success);
    assert_eq!(terminal[0].user_id, common::OWNER);
    assert_eq!(terminal[0].metadata.completed, 3);
}

#[tokio::test]
async fn test_partial_batch_completes_as_partially_completed() {
    let h = TestHarness::new();
    h.add_pdf("https://papers.test/a.pdf");
    h.add_pdf("https://papers.test/b.pdf");
    h.add_garbage("https://papers.test/c.pdf");
    let receipt = h
        .submit_and_settle(vec![
            TestHarness::document("https://papers.test/a.pdf", "A"),
            TestHarness::document("https://papers.test/b.pdf", "B"),
            TestHarness::document("https://papers.test/c.pdf", "C"),
        ])
        .await;

    let snapshot = h.snapshot(&receipt.job_id);
    assert_eq!(snapshot.job.status, JobStatus::AwaitingExternalConfirmation);
    let c = item(&snapshot, "C");
    assert_eq!(c.status, ItemStatus::Failed);
    assert!(c
        .error_message
        .as_deref()
        .unwrap()
        .starts_with("Validation failed"));
    // Only the registered data sources go into the pass.
    assert_eq!(h.index.passes()[0].len(), 2);

    h.index.push_state("BATCH_JOB_PHASE_SUCCEEDED");
    h.reconcile().await;

    let snapshot = h.snapshot(&receipt.job_id);
    assert_eq!(snapshot.job.status, JobStatus::PartiallyCompleted);
    assert_eq!(snapshot.job.completed_items, 2);
    assert_eq!(snapshot.job.failed_items, 1);

    let terminal = h.notifier.terminal_for(&receipt.job_id);
    assert_eq!(terminal.len(), 1);
    assert_eq!(terminal[0].kind, NotificationKind::Warning);
}

#[tokio::test]
async fn test_job_with_no_successful_items_fails_without_pass() {
    let h = TestHarness::new();
    h.add_garbage("https://papers.test/page.html");
    let receipt = h
        .submit_and_settle(vec![
            TestHarness::document("https://papers.test/page.html", "Not a pdf"),
            TestHarness::document("https://papers.test/gone.pdf", "Gone"),
        ])
        .await;

    let snapshot = h.snapshot(&receipt.job_id);
    assert_eq!(snapshot.job.status, JobStatus::Failed);
    assert_eq!(snapshot.job.failed_items, 2);
    assert_eq!(
        snapshot.job.error_message.as_deref(),
        Some("No items completed successfully")
    );
    let rejected = item(&snapshot, "Not a pdf");
    assert!(rejected.error_message.as_deref().unwrap().contains("not a PDF"));
    let gone = item(&snapshot, "Gone");
    assert!(gone.error_message.as_deref().unwrap().contains("404"));
    assert!(h.index.passes().is_empty());
    assert!(h.storage.is_empty());

    let terminal = h.notifier.terminal_for(&receipt.job_id);
    assert_eq!(terminal.len(), 1);
    assert_eq!(terminal[0].kind, NotificationKind::Error);
    assert_eq!(h.notifier.for_job(&receipt.job_id).len(), 1);
}

#[tokio::test]
async fn test_rejected_registration_removes_stored_object() {
    let h = TestHarness::new();
    h.add_pdf("https://papers.test/ok.pdf");
    h.add_pdf("https://papers.test/bad.pdf");
    h.index.reject_registration_of("Bad");
    let receipt = h
        .submit_and_settle(vec![
            TestHarness::document("https://papers.test/ok.pdf", "Ok"),
            TestHarness::document("https://papers.test/bad.pdf", "Bad"),
        ])
        .await;

    let snapshot = h.snapshot(&receipt.job_id);
    let bad = item(&snapshot, "Bad");
    assert_eq!(bad.status, ItemStatus::Failed);
    assert!(bad.error_message.as_deref().unwrap().contains("422"));
    assert_eq!(h.storage.len(), 1);
    assert_eq!(h.index.registered().len(), 1);
    assert_eq!(h.index.registered()[0].title, "Ok");
}

#[tokio::test]
async fn test_without_confirmation_job_settles_from_item_counts() {
    let h = TestHarness::builder().without_confirmation().build();
    h.add_pdf("https://papers.test/a.pdf");
    let receipt = h
        .submit_and_settle(vec![
            TestHarness::document("https://papers.test/a.pdf", "A"),
            TestHarness::document("https://papers.test/b.pdf", "B"),
        ])
        .await;

    assert_eq!(h.status(&receipt.job_id), JobStatus::PartiallyCompleted);
    assert!(h.index.passes().is_empty());
    assert_eq!(h.notifier.terminal_for(&receipt.job_id).len(), 1);
    assert_eq!(h.notifier.for_job(&receipt.job_id).len(), 1);
}

#[tokio::test]
async fn test_start_job_rejects_bad_batches() {
    let h = TestHarness::builder().batch_cap(2).build();

    assert_eq!(rejected(&h, vec![]).await, ErrorKind::Validation);
    let oversized = vec![
        TestHarness::document("https://a.test/1.pdf", "1"),
        TestHarness::document("https://a.test/2.pdf", "2"),
        TestHarness::document("https://a.test/3.pdf", "3"),
    ];
    assert_eq!(rejected(&h, oversized).await, ErrorKind::Validation);
    let blank_url = vec![TestHarness::document("   ", "Blank url")];
    assert_eq!(rejected(&h, blank_url).await, ErrorKind::Validation);
    let blank_title = vec![TestHarness::document("https://a.test/1.pdf", "")];
    assert_eq!(rejected(&h, blank_title).await, ErrorKind::Validation);

    let (jobs, total) = h
        .orchestrator
        .list_jobs(&h.admin, &ListJobsFilter::default())
        .unwrap();
    assert!(jobs.is_empty());
    assert_eq!(total, 0);
}

#[tokio::test]
async fn test_jobs_are_scoped_to_their_owner() {
    let h = TestHarness::new();
    h.add_pdf("https://papers.test/a.pdf");
    let receipt = h
        .submit_and_settle(vec![TestHarness::document("https://papers.test/a.pdf", "A")])
        .await;
    let stranger = Caller::user("user-2");

    let err = h
        .orchestrator
        .get_job_status("no-such-job", &h.owner)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let err = h
        .orchestrator
        .get_job_status(&receipt.job_id, &stranger)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);

    let err = h
        .orchestrator
        .cancel_job(&receipt.job_id, &stranger)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);

    let (own, _) = h
        .orchestrator
        .list_jobs(&h.owner, &ListJobsFilter::default())
        .unwrap();
    assert_eq!(own.len(), 1);
    let (theirs, total) = h
        .orchestrator
        .list_jobs(&stranger, &ListJobsFilter::default())
        .unwrap();
    assert!(theirs.is_empty());
    assert_eq!(total, 0);
    let (awaiting, _) = h
        .orchestrator
        .list_jobs(
            &h.admin,
            &ListJobsFilter {
                status: Some(JobStatus::AwaitingExternalConfirmation),
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(awaiting.len(), 1);
}

#[tokio::test]
async fn test_cancel_lets_in_flight_item_finish() {
    let h = TestHarness::builder().max_concurrent_items(1).build();
    let urls = [
        "https://papers.test/1.pdf",
        "https://papers.test/2.pdf",
        "https://papers.test/3.pdf",
    ];
    let gates: Vec<_> = urls
        .iter()
        .map(|url| {
            h.add_pdf(url);
            h.fetcher.gate(url)
        })
        .collect();

    let receipt = h
        .submit(
            urls.iter()
                .enumerate()
                .map(|(n, url)| TestHarness::document(url, &format!("Paper {}", n)))
                .collect(),
        )
        .await;
    h.wait_for("first fetch", || h.fetcher.fetch_count() == 1)
        .await;

    let status = h
        .orchestrator
        .cancel_job(&receipt.job_id, &h.owner)
        .await
        .unwrap();
    assert_eq!(status, JobStatus::Processing);

    for gate in &gates {
        gate.add_permits(1);
    }
    h.settle().await;

    let snapshot = h.snapshot(&receipt.job_id);
    assert_eq!(snapshot.job.status, JobStatus::Cancelled);
    assert_eq!(snapshot.job.completed_items, 1);
    let cancelled = snapshot
        .items
        .iter()
        .filter(|i| i.status == ItemStatus::Cancelled)
        .count();
    assert_eq!(cancelled, 2);
    assert_eq!(h.fetcher.fetch_count(), 1);
    assert!(h.index.passes().is_empty());

    let terminal = h.notifier.terminal_for(&receipt.job_id);
    assert_eq!(terminal.len(), 1);
    assert_eq!(terminal[0].kind, NotificationKind::Warning);
    assert!(terminal[0].message.contains("1 of 3"));

    let err = h
        .orchestrator
        .cancel_job(&receipt.job_id, &h.owner)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn test_cancel_while_awaiting_confirmation() {
    let h = TestHarness::new();
    h.add_pdf("https://papers.test/a.pdf");
    let receipt = h
        .submit_and_settle(vec![TestHarness::document("https://papers.test/a.pdf", "A")])
        .await;
    assert_eq!(h.status(&receipt.job_id), JobStatus::AwaitingExternalConfirmation);

    let status = h
        .orchestrator
        .cancel_job(&receipt.job_id, &h.owner)
        .await
        .unwrap();
    assert_eq!(status, JobStatus::Cancelled);

    h.index.push_state("INDEX_JOB_STATUS_COMPLETED");
    let report = h.reconcile().await;
    assert_eq!(report.checked, 0);
    assert_eq!(h.status(&receipt.job_id), JobStatus::Cancelled);
    assert_eq!(h.notifier.terminal_for(&receipt.job_id).len(), 1);
}

#[tokio::test]
async fn test_retry_failed_item() {
    let h = TestHarness::builder().without_confirmation().build();
    h.add_pdf("https://papers.test/a.pdf");
    let receipt = h
        .submit_and_settle(vec![
            TestHarness::document("https://papers.test/a.pdf", "A"),
            TestHarness::document("https://papers.test/late.pdf", "Late"),
        ])
        .await;
    assert_eq!(h.status(&receipt.job_id), JobStatus::PartiallyCompleted);

    let snapshot = h.snapshot(&receipt.job_id);
    let done = item(&snapshot, "A").id.clone();
    let late = item(&snapshot, "Late").id.clone();

    let err = h
        .orchestrator
        .retry_item(&receipt.job_id, &done, &h.owner)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    let err = h
        .orchestrator
        .retry_item(&receipt.job_id, "no-such-item", &h.owner)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    h.add_pdf("https://papers.test/late.pdf");
    h.orchestrator
        .retry_item(&receipt.job_id, &late, &h.owner)
        .await
        .unwrap();
    h.settle().await;

    let snapshot = h.snapshot(&receipt.job_id);
    assert_eq!(snapshot.job.status, JobStatus::Completed);
    assert_eq!(snapshot.job.completed_items, 2);
    assert_eq!(snapshot.job.failed_items, 0);
    assert!(snapshot.job.error_message.is_none());

    // One notification per terminal transition.
    let kinds: Vec<_> = h
        .notifier
        .terminal_for(&receipt.job_id)
        .into_iter()
        .map(|n| n.kind)
        .collect();
    assert_eq!(kinds, vec![NotificationKind::Warning, NotificationKind::Success]);
}

#[tokio::test]
async fn test_retired_job_is_hidden_and_frozen() {
    let h = TestHarness::builder().without_confirmation().build();
    let receipt = h
        .submit_and_settle(vec![TestHarness::document("https://papers.test/x.pdf", "X")])
        .await;
    assert_eq!(h.status(&receipt.job_id), JobStatus::Failed);

    h.orchestrator
        .retire_job(&receipt.job_id, &h.owner)
        .unwrap();
    let (jobs, _) = h
        .orchestrator
        .list_jobs(&h.owner, &ListJobsFilter::default())
        .unwrap();
    assert!(jobs.is_empty());

    let item_id = h.snapshot(&receipt.job_id).items[0].id.clone();
    let err = h
        .orchestrator
        .retry_item(&receipt.job_id, &item_id, &h.owner)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn test_job_from_candidates() {
    let h = TestHarness::new();
    h.add_pdf("https://exams.test/9709_s23_qp_12.pdf");
    let provider = StaticCandidateProvider::new(vec![
        Candidate {
            title: "Mathematics 9709 May/June 2023 Paper 12".to_string(),
            source_url: "https://exams.test/listing".to_string(),
            pdf_url: Some("https://exams.test/9709_s23_qp_12.pdf".to_string()),
            subject_code: Some("9709".to_string()),
            year: Some(2023),
            month: Some("June".to_string()),
            exam_type: Some("qp".to_string()),
        },
        Candidate {
            title: "Physics 9702 2023".to_string(),
            source_url: "https://exams.test/physics".to_string(),
            pdf_url: None,
            subject_code: Some("9702".to_string()),
            year: Some(2023),
            month: None,
            exam_type: None,
        },
    ]);
    let filter = CandidateFilter {
        subject_code: Some("9709".to_string()),
        ..Default::default()
    };

    let receipt = h
        .orchestrator
        .start_from_candidates(&h.owner, &provider, &filter)
        .await
        .unwrap();
    h.settle().await;

    let snapshot = h.snapshot(&receipt.job_id);
    assert_eq!(snapshot.job.job_type, JobType::BatchIngest);
    assert_eq!(snapshot.items.len(), 1);
    assert_eq!(snapshot.items[0].item_type, ItemType::ExamPaper);
    assert_eq!(snapshot.items[0].year, Some(2023));
    assert_eq!(snapshot.items[0].status, ItemStatus::Completed);

    let nothing = CandidateFilter {
        subject_code: Some("0000".to_string()),
        ..Default::default()
    };
    let err = h
        .orchestrator
        .start_from_candidates(&h.owner, &provider, &nothing)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn test_progress_events_follow_the_job() {
    let h = TestHarness::builder().without_confirmation().build();
    h.add_pdf("https://papers.test/a.pdf");
    let mut events = h.orchestrator.progress().subscribe();

    let receipt = h
        .submit_and_settle(vec![TestHarness::document("https://papers.test/a.pdf", "A")])
        .await;

    let mut job_statuses = Vec::new();
    let mut item_statuses = Vec::new();
    while let Ok(event) = events.try_recv() {
        assert_eq!(event.job_id, receipt.job_id);
        if let Some(status) = event.job_status {
            job_statuses.push(status);
        }
        if let Some(status) = event.item_status {
            assert_eq!(event.title.as_deref(), Some("A"));
            item_statuses.push(status);
        }
    }
    assert_eq!(
        job_statuses,
        vec![JobStatus::Pending, JobStatus::Processing, JobStatus::Completed]
    );
    assert_eq!(
        item_statuses,
        vec![
            ItemStatus::Fetching,
            ItemStatus::Validating,
            ItemStatus::Storing,
            ItemStatus::Registering,
            ItemStatus::Completed,
        ]
    );
}

#[tokio::test]
async fn test_throttled_registration_is_retried() {
    let h = TestHarness::new();
    h.add_pdf("https://papers.test/a.pdf");
    h.index.throttle_registrations(1);

    let receipt = h
        .submit_and_settle(vec![TestHarness::document("https://papers.test/a.pdf", "A")])
        .await;

    let snapshot = h.snapshot(&receipt.job_id);
    assert_eq!(snapshot.job.status, JobStatus::AwaitingExternalConfirmation);
    assert_eq!(snapshot.job.failed_items, 0);
    assert_eq!(snapshot.items[0].status, ItemStatus::Completed);
    assert!(snapshot.items[0].error_message.is_none());
    assert_eq!(h.index.registration_attempts(), 2);
    assert_eq!(h.limiter.backoff_multiplier(), 2.0);
}

#[tokio::test]
async fn test_registration_throttled_past_retries_fails_item() {
    let h = TestHarness::builder().without_confirmation().build();
    h.add_pdf("https://papers.test/a.pdf");
    h.index.throttle_registrations(10);

    let receipt = h
        .submit_and_settle(vec![TestHarness::document("https://papers.test/a.pdf", "A")])
        .await;

    let snapshot = h.snapshot(&receipt.job_id);
    assert_eq!(snapshot.job.status, JobStatus::Failed);
    assert!(snapshot.items[0]
        .error_message
        .as_deref()
        .unwrap()
        .contains("throttling"));
    assert_eq!(h.index.registration_attempts(), 3);
    assert!(h.storage.is_empty());
}

#[tokio::test]
async fn test_same_title_items_get_separate_objects() {
    let h = TestHarness::new();
    h.add_pdf("https://papers.test/2023.pdf");
    h.fetcher.insert("https://papers.test/2024.pdf", common::pdf_bytes(3));

    let receipt = h
        .submit_and_settle(vec![
            TestHarness::document("https://papers.test/2023.pdf", "Exam"),
            TestHarness::document("https://papers.test/2024.pdf", "Exam"),
        ])
        .await;

    let snapshot = h.snapshot(&receipt.job_id);
    assert!(snapshot
        .items
        .iter()
        .all(|i| i.status == ItemStatus::Completed));
    let first = snapshot.items[0].created_entity_ref.clone().unwrap();
    let second = snapshot.items[1].created_entity_ref.clone().unwrap();
    assert_ne!(first, second);
    assert_eq!(h.storage.len(), 2);
    assert_ne!(
        h.storage.get(&first).await.unwrap(),
        h.storage.get(&second).await.unwrap()
    );
}

#[tokio::test]
async fn test_store_error_fails_item_and_discards_object() {
    let h = TestHarness::new();
    h.add_pdf("https://papers.test/a.pdf");
    h.db.with_conn(|conn| {
        conn.execute_batch(
            "CREATE TRIGGER reject_storage_url BEFORE UPDATE OF storage_url ON ingestion_items
             BEGIN SELECT RAISE(ABORT, 'disk I/O error'); END;",
        )?;
        Ok(())
    })
    .unwrap();

    let receipt = h
        .submit_and_settle(vec![TestHarness::document("https://papers.test/a.pdf", "A")])
        .await;

    let snapshot = h.snapshot(&receipt.job_id);
    assert_eq!(snapshot.job.status, JobStatus::Failed);
    assert_eq!(snapshot.items[0].status, ItemStatus::Failed);
    assert!(snapshot.items[0]
        .error_message
        .as_deref()
        .unwrap()
        .contains("disk I/O error"));
    assert!(h.storage.is_empty());
    assert!(!h.orchestrator.is_driving(&receipt.job_id));
}

#[tokio::test]
async fn test_resume_leaves_jobs_being_driven_alone() {
    let h = TestHarness::new();
    h.add_pdf("https://papers.test/a.pdf");
    let gate = h.fetcher.gate("https://papers.test/a.pdf");

    let receipt = h
        .submit(vec![TestHarness::document("https://papers.test/a.pdf", "A")])
        .await;
    assert!(h.orchestrator.is_driving(&receipt.job_id));
    assert_eq!(h.orchestrator.resume_interrupted().await.unwrap(), 0);

    h.wait_for("fetch to start", || h.fetcher.fetch_count() == 1).await;
    assert_eq!(h.orchestrator.resume_interrupted().await.unwrap(), 0);

    gate.add_permits(1);
    h.settle().await;
    assert_eq!(h.fetcher.fetch_count(), 1);
    assert_eq!(h.status(&receipt.job_id), JobStatus::AwaitingExternalConfirmation);
    assert!(!h.orchestrator.is_driving(&receipt.job_id));
}
