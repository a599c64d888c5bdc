//! End-to-end scenarios for the orchestrator.
//!
//! Every collaborator is a scripted stand-in so routing, revision counting and
//! the human gate can be checked without network access.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use mail_crew::channels::EmailSender;
use mail_crew::config::WorkflowConfig;
use mail_crew::error::{ChannelError, DatabaseError, RunErrorKind, StepError};
use mail_crew::journal::JsonlJournal;
use mail_crew::pipeline::drafter::{DraftRequest, Drafter};
use mail_crew::pipeline::external::{EXTERNAL_ERROR_PREFIX, ExternalInfoFetcher};
use mail_crew::pipeline::intent::IntentClassifier;
use mail_crew::pipeline::retriever::ContextRetriever;
use mail_crew::pipeline::review::SafetyReviewer;
use mail_crew::pipeline::state::{FailureReason, RunRecord, RunState};
use mail_crew::pipeline::types::{
    Draft, EmailTask, FinalEmail, HumanDecision, IntentResult, RetrievedContext, SafetyVerdict, Source, Urgency,
    labels,
};
use mail_crew::pipeline::{AutoApprove, Orchestrator, OrchestratorDeps, RunOutcome, ScriptedGate};
use mail_crew::retry::RetryConfig;
use mail_crew::store::{LibSqlRunStore, RunStore};

/// Maximum time any scenario is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

// ── Scripted collaborators ──────────────────────────────────────────

enum ClassifierMode {
    Fixed(IntentResult),
    /// Never answers within the step timeout.
    Hang,
}

struct ScriptedClassifier {
    mode: ClassifierMode,
    calls: AtomicU32,
}

#[async_trait]
impl IntentClassifier for ScriptedClassifier {
    async fn classify(&self, _task: &EmailTask) -> Result<IntentResult, StepError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.mode {
            ClassifierMode::Fixed(intent) => Ok(intent.clone()),
            ClassifierMode::Hang => {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Err(StepError::Provider("unreachable".into()))
            }
        }
    }
}

struct FixedRetriever {
    confidence: f32,
    calls: AtomicU32,
    feedback_seen: Mutex<Vec<Option<String>>>,
}

#[async_trait]
impl ContextRetriever for FixedRetriever {
    async fn retrieve(
        &self,
        _task: &EmailTask,
        _intent: &IntentResult,
        feedback: Option<&str>,
    ) -> Result<RetrievedContext, StepError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.feedback_seen.lock().await.push(feedback.map(str::to_string));
        Ok(RetrievedContext::new(
            vec!["Refunds are processed within 5 business days.".into()],
            self.confidence,
            false,
        ))
    }
}

struct CountingExternal {
    fail: bool,
    calls: AtomicU32,
}

#[async_trait]
impl ExternalInfoFetcher for CountingExternal {
    async fn fetch(&self, _task: &EmailTask, _intent: &IntentResult) -> Result<String, StepError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            Err(StepError::Provider("search API down".into()))
        } else {
            Ok("[External] Summary: prices rose 3% this quarter.".into())
        }
    }
}

struct EchoDrafter {
    calls: AtomicU32,
}

#[async_trait]
impl Drafter for EchoDrafter {
    async fn draft(&self, request: &DraftRequest<'_>) -> Result<Draft, StepError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let mut body = format!("Hello,\n\nAbout: {}\n", request.task.description);
        if let Some(feedback) = request.human_feedback {
            body.push_str(&format!("Noted: {feedback}\n"));
        }
        body.push_str(&format!("(draft {n})"));

        let mut draft = Draft::new("Re: your request", body);
        for source in request.sources() {
            draft.add_source(source);
        }
        draft.revision_notes = request.revision_notes.to_vec();
        Ok(draft)
    }
}

/// Replays verdicts in order, repeating the last one.
struct SequenceReviewer {
    verdicts: Vec<bool>,
    fail: bool,
    calls: AtomicUsize,
}

#[async_trait]
impl SafetyReviewer for SequenceReviewer {
    async fn review(&self, _task: &EmailTask, draft: &Draft) -> Result<SafetyVerdict, StepError> {
        let i = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(StepError::Provider("moderation API down".into()));
        }
        let approved = self
            .verdicts
            .get(i)
            .or(self.verdicts.last())
            .copied()
            .unwrap_or(true);
        let redacted = format!("{}\n-- reviewed", draft.body);
        if approved {
            Ok(SafetyVerdict::approved(redacted))
        } else {
            Ok(SafetyVerdict::rejected(vec!["Tone too casual".into()], redacted))
        }
    }
}

struct RecordingSender {
    fail: bool,
    delay: Duration,
    sent: Mutex<Vec<FinalEmail>>,
}

#[async_trait]
impl EmailSender for RecordingSender {
    fn name(&self) -> &str {
        "recording"
    }

    async fn send(&self, email: &FinalEmail) -> Result<(), ChannelError> {
        tokio::time::sleep(self.delay).await;
        if self.fail {
            return Err(ChannelError::SendFailed {
                name: "recording".into(),
                reason: "relay refused connection".into(),
            });
        }
        self.sent.lock().await.push(email.clone());
        Ok(())
    }
}

/// A run store whose reads yield, like a remote database would.
struct SlowReadStore {
    inner: LibSqlRunStore,
    read_delay: Duration,
}

#[async_trait]
impl RunStore for SlowReadStore {
    async fn save_run(&self, record: &RunRecord) -> Result<(), DatabaseError> {
        self.inner.save_run(record).await
    }

    async fn get_run(&self, session_id: &str) -> Result<Option<RunRecord>, DatabaseError> {
        tokio::time::sleep(self.read_delay).await;
        self.inner.get_run(session_id).await
    }

    async fn delete_run(&self, session_id: &str) -> Result<bool, DatabaseError> {
        self.inner.delete_run(session_id).await
    }

    async fn list_awaiting(&self) -> Result<Vec<RunRecord>, DatabaseError> {
        self.inner.list_awaiting().await
    }

    async fn claim_awaiting(&self, session_id: &str) -> Result<bool, DatabaseError> {
        self.inner.claim_awaiting(session_id).await
    }

    async fn list_awaiting_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<RunRecord>, DatabaseError> {
        self.inner.list_awaiting_before(cutoff).await
    }
}

// ── Harness ─────────────────────────────────────────────────────────

struct Harness {
    classifier: Arc<ScriptedClassifier>,
    retriever: Arc<FixedRetriever>,
    external: Arc<CountingExternal>,
    drafter: Arc<EchoDrafter>,
    reviewer: Arc<SequenceReviewer>,
    sender: Arc<RecordingSender>,
}

impl Harness {
    fn new(mode: ClassifierMode, confidence: f32, verdicts: Vec<bool>) -> Self {
        Self {
            classifier: Arc::new(ScriptedClassifier {
                mode,
                calls: AtomicU32::new(0),
            }),
            retriever: Arc::new(FixedRetriever {
                confidence,
                calls: AtomicU32::new(0),
                feedback_seen: Mutex::new(Vec::new()),
            }),
            external: Arc::new(CountingExternal {
                fail: false,
                calls: AtomicU32::new(0),
            }),
            drafter: Arc::new(EchoDrafter {
                calls: AtomicU32::new(0),
            }),
            reviewer: Arc::new(SequenceReviewer {
                verdicts,
                fail: false,
                calls: AtomicUsize::new(0),
            }),
            sender: Arc::new(RecordingSender {
                fail: false,
                delay: Duration::ZERO,
                sent: Mutex::new(Vec::new()),
            }),
        }
    }

    fn general(confidence: f32, verdicts: Vec<bool>) -> Self {
        Self::new(
            ClassifierMode::Fixed(IntentResult::new(labels::GENERAL, Urgency::Normal, false)),
            confidence,
            verdicts,
        )
    }

    fn deps(&self, store: Arc<dyn RunStore>) -> OrchestratorDeps {
        OrchestratorDeps::new(
            self.classifier.clone(),
            self.retriever.clone(),
            self.external.clone(),
            self.drafter.clone(),
            self.reviewer.clone(),
            self.sender.clone(),
            store,
        )
    }

    async fn orchestrator(&self) -> Orchestrator {
        let store = Arc::new(LibSqlRunStore::new_memory().await.unwrap());
        Orchestrator::new(config(), self.deps(store))
    }

    async fn sent(&self) -> Vec<FinalEmail> {
        self.sender.sent.lock().await.clone()
    }
}

fn config() -> WorkflowConfig {
    WorkflowConfig {
        step_timeout: Duration::from_millis(50),
        retry: RetryConfig::immediate(3),
        ..WorkflowConfig::default()
    }
}

fn task() -> EmailTask {
    EmailTask::new("client@example.com", "Where is my refund?")
}

async fn run<F: std::future::Future>(future: F) -> F::Output {
    tokio::time::timeout(TEST_TIMEOUT, future)
        .await
        .expect("scenario hung")
}

// ── Scenarios ───────────────────────────────────────────────────────

#[tokio::test]
async fn confident_retrieval_approved_first_time_is_sent() {
    let h = Harness::general(0.9, vec![true]);
    let orchestrator = h.orchestrator().await;

    let outcome = run(orchestrator.orchestrate(task(), &AutoApprove)).await.unwrap();
    let RunOutcome::Sent { email, revisions, .. } = outcome else {
        panic!("expected sent, got {outcome:?}");
    };
    assert_eq!(revisions, 0);
    assert_eq!(email.recipient, "client@example.com");
    assert_eq!(h.external.calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.sent().await, vec![email]);
}

#[tokio::test]
async fn two_rejections_then_approval_accumulates_notes() {
    let h = Harness::general(0.9, vec![false, false, true]);
    let orchestrator = h.orchestrator().await;

    let outcome = run(orchestrator.orchestrate(task(), &AutoApprove)).await.unwrap();
    let RunOutcome::Sent { session_id, revisions, email } = outcome else {
        panic!("expected sent, got {outcome:?}");
    };
    assert_eq!(revisions, 2);
    assert_eq!(h.drafter.calls.load(Ordering::SeqCst), 3);

    let record = orchestrator.get_run(&session_id).await.unwrap();
    let draft = record.draft.unwrap();
    assert_eq!(draft.revision_notes.len(), 2);
    assert!(draft.revision_notes[0].starts_with("Revision 1: Tone too casual"));
    assert!(draft.revision_notes[1].starts_with("Revision 2: Tone too casual"));
    assert!(email.body.contains("(draft 3)"));
}

#[tokio::test]
async fn classifier_timeouts_fall_back_and_still_finish() {
    let h = Harness::new(ClassifierMode::Hang, 0.9, vec![true]);
    let orchestrator = h.orchestrator().await;

    let outcome = run(orchestrator.orchestrate(task(), &AutoApprove)).await.unwrap();
    assert!(matches!(outcome, RunOutcome::Sent { .. }));
    assert_eq!(h.classifier.calls.load(Ordering::SeqCst), 3);

    let record = orchestrator.get_run(outcome.session_id()).await.unwrap();
    let intent = record.intent.unwrap();
    assert_eq!(intent, IntentResult::fallback());
    assert_eq!(intent.label, "Error_Fallback");
    assert_eq!(intent.urgency, Urgency::High);
    assert!(!intent.needs_external);
    // Error_Fallback is treated as a general inquiry.
    assert_eq!(h.retriever.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn rejection_without_feedback_ends_the_run() {
    let h = Harness::general(0.9, vec![true]);
    let orchestrator = h.orchestrator().await;

    let outcome = run(orchestrator.orchestrate(task(), &ScriptedGate::new([HumanDecision::reject()])))
        .await
        .unwrap();
    let RunOutcome::Rejected { session_id } = outcome else {
        panic!("expected rejected, got {outcome:?}");
    };
    assert!(h.sent().await.is_empty());

    let record = orchestrator.get_run(&session_id).await.unwrap();
    assert_eq!(
        record.state,
        RunState::Failed {
            reason: FailureReason::Rejected
        }
    );
    assert_eq!(record.state.to_string(), "error(rejected)");
    assert!(record.final_email.is_none());
}

#[tokio::test]
async fn confident_retrieval_skips_external_even_when_flagged() {
    let h = Harness::new(
        ClassifierMode::Fixed(IntentResult::new(labels::PRICING_REQUEST, Urgency::Normal, true)),
        0.9,
        vec![true],
    );
    let orchestrator = h.orchestrator().await;

    let outcome = run(orchestrator.orchestrate(task(), &AutoApprove)).await.unwrap();
    assert!(matches!(outcome, RunOutcome::Sent { .. }));
    assert_eq!(h.retriever.calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.external.calls.load(Ordering::SeqCst), 0);

    let record = orchestrator.get_run(outcome.session_id()).await.unwrap();
    assert!(record.external_info.is_none());
    assert!(!record.route.iter().any(|s| s == "external"));
}

#[tokio::test]
async fn weak_retrieval_with_external_need_fetches_external() {
    let h = Harness::new(
        ClassifierMode::Fixed(IntentResult::new(labels::PRICING_REQUEST, Urgency::Normal, true)),
        0.3,
        vec![true],
    );
    let orchestrator = h.orchestrator().await;

    let outcome = run(orchestrator.orchestrate(task(), &AutoApprove)).await.unwrap();
    assert_eq!(h.external.calls.load(Ordering::SeqCst), 1);

    let record = orchestrator.get_run(outcome.session_id()).await.unwrap();
    assert_eq!(
        record.routing_decision(),
        "classify -> retrieve -> external -> draft -> review -> human_gate -> send -> sent"
    );
    let draft = record.draft.unwrap();
    assert!(draft.sources.contains(&Source::VectorDb));
    assert!(draft.sources.contains(&Source::ExternalTool));
}

#[tokio::test]
async fn weak_retrieval_without_external_need_goes_to_draft() {
    let h = Harness::general(0.1, vec![true]);
    let orchestrator = h.orchestrator().await;

    run(orchestrator.orchestrate(task(), &AutoApprove)).await.unwrap();
    assert_eq!(h.external.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn research_requests_go_straight_to_external() {
    let h = Harness::new(
        ClassifierMode::Fixed(IntentResult::new(labels::RESEARCH_REQUEST, Urgency::Normal, true)),
        0.9,
        vec![true],
    );
    let orchestrator = h.orchestrator().await;

    let outcome = run(orchestrator.orchestrate(task(), &AutoApprove)).await.unwrap();
    assert_eq!(h.retriever.calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.external.calls.load(Ordering::SeqCst), 1);

    let record = orchestrator.get_run(outcome.session_id()).await.unwrap();
    assert!(record.routing_decision().starts_with("classify -> external -> draft"));
}

#[tokio::test]
async fn thank_you_notes_skip_retrieval() {
    let h = Harness::new(
        ClassifierMode::Fixed(IntentResult::new(labels::THANK_YOU, Urgency::Low, false)),
        0.9,
        vec![true],
    );
    let orchestrator = h.orchestrator().await;

    let outcome = run(orchestrator.orchestrate(task(), &AutoApprove)).await.unwrap();
    assert!(matches!(outcome, RunOutcome::Sent { .. }));
    assert_eq!(h.retriever.calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.external.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn external_outage_degrades_into_tagged_text() {
    let mut h = Harness::new(
        ClassifierMode::Fixed(IntentResult::new(labels::RESEARCH_REQUEST, Urgency::Normal, true)),
        0.9,
        vec![true],
    );
    h.external = Arc::new(CountingExternal {
        fail: true,
        calls: AtomicU32::new(0),
    });
    let orchestrator = h.orchestrator().await;

    let outcome = run(orchestrator.submit(task())).await.unwrap();
    assert!(matches!(outcome, RunOutcome::AwaitingApproval(_)));
    assert_eq!(h.external.calls.load(Ordering::SeqCst), 3);

    let record = orchestrator.get_run(outcome.session_id()).await.unwrap();
    assert!(record.external_info.unwrap().starts_with(EXTERNAL_ERROR_PREFIX));
}

#[tokio::test]
async fn endless_rejection_hits_revision_limit_within_step_bound() {
    let h = Harness::general(0.9, vec![false]);
    let orchestrator = h.orchestrator().await;

    let err = run(orchestrator.orchestrate(task(), &AutoApprove)).await.unwrap_err();
    assert_eq!(err.kind, RunErrorKind::RevisionLimitExceeded { attempts: 3 });
    assert!(!err.session_id.is_empty());
    assert!(h.sent().await.is_empty());
    assert_eq!(h.drafter.calls.load(Ordering::SeqCst), 4);

    let record = orchestrator.get_run(&err.session_id).await.unwrap();
    assert_eq!(
        record.state,
        RunState::Failed {
            reason: FailureReason::MaxRevisionsExceeded
        }
    );
    assert!(record.transitions.len() <= config().max_steps() as usize);

    let draft_entries = record
        .transitions
        .iter()
        .filter(|t| t.to == RunState::Draft)
        .count();
    assert_eq!(draft_entries, 4);
    assert_eq!(record.revision_count, 3);
}

#[tokio::test]
async fn reviewer_outage_fails_closed() {
    let mut h = Harness::general(0.9, vec![true]);
    h.reviewer = Arc::new(SequenceReviewer {
        verdicts: vec![true],
        fail: true,
        calls: AtomicUsize::new(0),
    });
    let orchestrator = h.orchestrator().await;

    let err = run(orchestrator.submit(task())).await.unwrap_err();
    assert!(matches!(err.kind, RunErrorKind::RevisionLimitExceeded { .. }));

    let record = orchestrator.get_run(&err.session_id).await.unwrap();
    let verdict = record.verdict.unwrap();
    assert!(!verdict.approved);
    assert!(verdict.issues[0].starts_with("Safety review unavailable"));
}

#[tokio::test]
async fn feedback_reaches_retrieval_and_drafting() {
    let h = Harness::general(0.9, vec![true]);
    let orchestrator = h.orchestrator().await;
    let gate = ScriptedGate::new([
        HumanDecision::reject_with("Mention the warranty"),
        HumanDecision::Approve,
    ]);

    let outcome = run(orchestrator.orchestrate(task(), &gate)).await.unwrap();
    let RunOutcome::Sent { email, revisions, session_id } = outcome else {
        panic!("expected sent, got {outcome:?}");
    };
    assert_eq!(revisions, 1);
    assert!(email.body.contains("Noted: Mention the warranty"));

    let seen = h.retriever.feedback_seen.lock().await.clone();
    assert_eq!(seen, vec![None, Some("Mention the warranty".to_string())]);

    let record = orchestrator.get_run(&session_id).await.unwrap();
    assert!(record.draft.unwrap().sources.contains(&Source::HumanFeedback));
}

#[tokio::test]
async fn sent_run_task_log_round_trips_final_email() {
    let dir = tempfile::tempdir().unwrap();
    let journal = Arc::new(JsonlJournal::open(dir.path()).await.unwrap());
    let h = Harness::general(0.9, vec![true]);
    let store = Arc::new(LibSqlRunStore::new_memory().await.unwrap());
    let orchestrator = Orchestrator::new(
        config(),
        h.deps(store).with_events(journal.clone()).with_task_log(journal.clone()),
    );

    let outcome = run(orchestrator.orchestrate(task(), &AutoApprove)).await.unwrap();

    let entries = journal.read_task_log().await.unwrap();
    assert_eq!(entries.len(), 1);
    let entry = &entries[0];
    assert_eq!(entry.session_id, outcome.session_id());

    let final_email = entry.final_email.as_ref().unwrap();
    let draft = entry.draft.as_ref().unwrap();
    let verdict = entry.verdict.as_ref().unwrap();
    assert_eq!(final_email.subject, draft.subject);
    assert_eq!(final_email.body, verdict.redacted_body);
    assert_ne!(final_email.body, draft.body);
    assert_eq!(entry.extra["delivery"], "sent");
    assert_eq!(entry.extra["revision_count"], 0);
    assert_eq!(
        entry.extra["routing_decision"],
        "classify -> retrieve -> draft -> review -> human_gate -> send -> sent"
    );

    let history = journal.session_history(outcome.session_id()).await.unwrap();
    assert_eq!(history.first().unwrap().step, "submitted");
    assert_eq!(history.last().unwrap().step, "send");
}

#[tokio::test]
async fn send_failure_is_fatal_but_logged() {
    let dir = tempfile::tempdir().unwrap();
    let journal = Arc::new(JsonlJournal::open(dir.path()).await.unwrap());
    let mut h = Harness::general(0.9, vec![true]);
    h.sender = Arc::new(RecordingSender {
        fail: true,
        delay: Duration::ZERO,
        sent: Mutex::new(Vec::new()),
    });
    let store = Arc::new(LibSqlRunStore::new_memory().await.unwrap());
    let orchestrator = Orchestrator::new(config(), h.deps(store).with_task_log(journal.clone()));

    let err = run(orchestrator.orchestrate(task(), &AutoApprove)).await.unwrap_err();
    assert_eq!(err.kind, RunErrorKind::SendFailure);
    assert!(err.message.contains("relay refused connection"));

    let entries = journal.read_task_log().await.unwrap();
    assert_eq!(entries.len(), 1);
    assert!(entries[0].final_email.is_some());
    assert_eq!(entries[0].extra["delivery"], "failed");
}

#[tokio::test]
async fn slow_send_is_awaited_not_abandoned() {
    let mut h = Harness::general(0.9, vec![true]);
    // Longer than the 50ms step timeout.
    h.sender = Arc::new(RecordingSender {
        fail: false,
        delay: Duration::from_millis(150),
        sent: Mutex::new(Vec::new()),
    });
    let orchestrator = h.orchestrator().await;

    let outcome = run(orchestrator.orchestrate(task(), &AutoApprove)).await.unwrap();
    assert!(matches!(outcome, RunOutcome::Sent { .. }));
    assert_eq!(h.sent().await.len(), 1);

    let record = orchestrator.get_run(outcome.session_id()).await.unwrap();
    assert_eq!(record.state, RunState::Sent);
    assert!(record.error.is_none());
}

#[tokio::test]
async fn suspended_run_resumes_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("runs.db");
    let h = Harness::general(0.9, vec![true]);

    let session_id = {
        let store = Arc::new(LibSqlRunStore::new_local(&db_path).await.unwrap());
        let orchestrator = Orchestrator::new(config(), h.deps(store));
        let outcome = run(orchestrator.submit(task())).await.unwrap();
        let RunOutcome::AwaitingApproval(pending) = outcome else {
            panic!("expected the run to park, got {outcome:?}");
        };
        pending.session_id
    };

    let store = Arc::new(LibSqlRunStore::new_local(&db_path).await.unwrap());
    let orchestrator = Orchestrator::new(config(), h.deps(store));
    let pending = orchestrator.pending_approvals().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].session_id, session_id);

    let outcome = run(orchestrator.resume(&session_id, HumanDecision::Approve))
        .await
        .unwrap();
    assert!(matches!(outcome, RunOutcome::Sent { .. }));
    assert_eq!(h.sent().await.len(), 1);
    assert!(orchestrator.pending_approvals().await.unwrap().is_empty());
}

#[tokio::test]
async fn late_approval_is_refused_once_window_elapsed() {
    let h = Harness::general(0.9, vec![true]);
    let store = Arc::new(LibSqlRunStore::new_memory().await.unwrap());
    let config = WorkflowConfig {
        human_gate_timeout: Some(Duration::from_millis(10)),
        ..config()
    };
    let orchestrator = Orchestrator::new(config, h.deps(store));

    let outcome = run(orchestrator.submit(task())).await.unwrap();
    tokio::time::sleep(Duration::from_millis(40)).await;

    let err = orchestrator
        .resume(outcome.session_id(), HumanDecision::Approve)
        .await
        .unwrap_err();
    assert_eq!(err.kind, RunErrorKind::ApprovalExpired);
    assert!(h.sent().await.is_empty());

    let record = orchestrator.get_run(outcome.session_id()).await.unwrap();
    assert_eq!(
        record.state,
        RunState::Failed {
            reason: FailureReason::ApprovalExpired
        }
    );
}

#[tokio::test]
async fn concurrent_approvals_send_only_once() {
    let h = Harness::general(0.9, vec![true]);
    let store = Arc::new(SlowReadStore {
        inner: LibSqlRunStore::new_memory().await.unwrap(),
        read_delay: Duration::from_millis(5),
    });
    let orchestrator = Orchestrator::new(config(), h.deps(store));

    let outcome = run(orchestrator.submit(task())).await.unwrap();
    let session_id = outcome.session_id().to_string();

    let (a, b) = run(async {
        tokio::join!(
            orchestrator.resume(&session_id, HumanDecision::Approve),
            orchestrator.resume(&session_id, HumanDecision::Approve),
        )
    })
    .await;

    let (won, lost) = match (a, b) {
        (Ok(won), Err(lost)) | (Err(lost), Ok(won)) => (won, lost),
        other => panic!("expected exactly one decision to apply, got {other:?}"),
    };
    assert!(matches!(won, RunOutcome::Sent { .. }));
    assert!(matches!(lost.kind, RunErrorKind::InvalidState { .. }));
    assert_eq!(h.sent().await.len(), 1);

    let record = orchestrator.get_run(&session_id).await.unwrap();
    assert_eq!(record.state, RunState::Sent);
}

#[tokio::test]
async fn expiry_skips_runs_already_taken_off_the_gate() {
    let h = Harness::general(0.9, vec![true]);
    let store = Arc::new(LibSqlRunStore::new_memory().await.unwrap());
    let config = WorkflowConfig {
        human_gate_timeout: Some(Duration::from_millis(10)),
        ..config()
    };
    let orchestrator = Orchestrator::new(config, h.deps(store.clone()));

    let outcome = run(orchestrator.submit(task())).await.unwrap();
    tokio::time::sleep(Duration::from_millis(40)).await;

    // Another process has claimed the run but not yet saved its next state.
    assert!(store.claim_awaiting(outcome.session_id()).await.unwrap());

    let closed = orchestrator.expire_stale_approvals().await.unwrap();
    assert!(closed.is_empty());
    let record = orchestrator.get_run(outcome.session_id()).await.unwrap();
    assert_eq!(record.state, RunState::AwaitingApproval);
}
