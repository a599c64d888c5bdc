//! Run orchestrator.
//!
//! Drives a [`RunRecord`] through the state machine in [`crate::pipeline::state`]:
//! executes the step for the current state, turns step failures into degraded
//! data, and persists the record after every transition. A run suspends at the
//! human gate; [`Orchestrator::resume`] picks it up again, possibly in another
//! process.
//!
//! **No send without a human decision.** The only path to `Send` is an
//! explicit approval at the gate.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::channels::EmailSender;
use crate::config::WorkflowConfig;
use crate::error::{RunError, RunErrorKind, StepError};
use crate::journal::{EventSink, NoopJournal, RunEvent, TaskLogSink};
use crate::pipeline::drafter::{DraftRequest, Drafter};
use crate::pipeline::external::{EXTERNAL_ERROR_PREFIX, ExternalInfoFetcher, external_error};
use crate::pipeline::intent::IntentClassifier;
use crate::pipeline::retriever::ContextRetriever;
use crate::pipeline::review::{SafetyReviewer, fail_closed};
use crate::pipeline::state::{FailureReason, RunRecord, RunState, StepOutcome, transition};
use crate::pipeline::types::{
    DeliveryStatus, Draft, EmailTask, FinalEmail, HumanDecision, IntentResult, RetrievedContext,
    SafetyVerdict, TaskLogEntry,
};
use crate::retry::{CallPolicy, RetryResult, call_with_policy};
use crate::safety::SafetyLayer;
use crate::store::RunStore;
use crate::tracing_sink::{NoopTraceSink, TraceSink};

type Fields = serde_json::Map<String, Value>;

fn fields(value: Value) -> Fields {
    match value {
        Value::Object(map) => map,
        _ => Fields::new(),
    }
}

// ── Outcomes ────────────────────────────────────────────────────────

/// A run parked at the human gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingApproval {
    pub session_id: String,
    pub recipient: String,
    pub draft: Draft,
    pub verdict: SafetyVerdict,
    pub revision_count: u32,
    pub awaiting_since: Option<DateTime<Utc>>,
}

impl PendingApproval {
    fn from_record(record: &RunRecord) -> Option<Self> {
        if record.state != RunState::AwaitingApproval {
            return None;
        }
        Some(Self {
            session_id: record.session_id.clone(),
            recipient: record.task.recipient.clone(),
            draft: record.draft.clone()?,
            verdict: record.verdict.clone()?,
            revision_count: record.revision_count,
            awaiting_since: record.awaiting_since,
        })
    }
}

/// Non-error result of driving a run.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Sent {
        session_id: String,
        email: FinalEmail,
        revisions: u32,
    },
    AwaitingApproval(PendingApproval),
    /// A human rejected the draft without feedback.
    Rejected { session_id: String },
}

impl RunOutcome {
    pub fn session_id(&self) -> &str {
        match self {
            Self::Sent { session_id, .. } | Self::Rejected { session_id } => session_id,
            Self::AwaitingApproval(pending) => &pending.session_id,
        }
    }
}

// ── Human gate ──────────────────────────────────────────────────────

/// Decides on a pending draft. `None` leaves the run suspended.
#[async_trait]
pub trait ApprovalGate: Send + Sync {
    async fn decide(&self, pending: &PendingApproval) -> Option<HumanDecision>;
}

/// Approves everything. For batch runs where a human already signed off.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoApprove;

#[async_trait]
impl ApprovalGate for AutoApprove {
    async fn decide(&self, _pending: &PendingApproval) -> Option<HumanDecision> {
        Some(HumanDecision::Approve)
    }
}

/// Never decides; the run stays parked until `resume` is called.
#[derive(Debug, Clone, Copy, Default)]
pub struct Deferred;

#[async_trait]
impl ApprovalGate for Deferred {
    async fn decide(&self, _pending: &PendingApproval) -> Option<HumanDecision> {
        None
    }
}

/// Replays a fixed list of decisions, then defers.
#[derive(Debug, Default)]
pub struct ScriptedGate {
    decisions: Mutex<VecDeque<HumanDecision>>,
}

impl ScriptedGate {
    pub fn new(decisions: impl IntoIterator<Item = HumanDecision>) -> Self {
        Self {
            decisions: Mutex::new(decisions.into_iter().collect()),
        }
    }
}

#[async_trait]
impl ApprovalGate for ScriptedGate {
    async fn decide(&self, _pending: &PendingApproval) -> Option<HumanDecision> {
        self.decisions.lock().await.pop_front()
    }
}

// ── Collaborators ───────────────────────────────────────────────────

/// Everything the orchestrator calls out to.
pub struct OrchestratorDeps {
    pub classifier: Arc<dyn IntentClassifier>,
    pub retriever: Arc<dyn ContextRetriever>,
    pub external: Arc<dyn ExternalInfoFetcher>,
    pub drafter: Arc<dyn Drafter>,
    pub reviewer: Arc<dyn SafetyReviewer>,
    pub sender: Arc<dyn EmailSender>,
    pub store: Arc<dyn RunStore>,
    pub events: Arc<dyn EventSink>,
    pub task_log: Arc<dyn TaskLogSink>,
    pub tracer: Arc<dyn TraceSink>,
    /// Used to scrub drafts when the reviewer itself is unavailable.
    pub safety: SafetyLayer,
}

impl OrchestratorDeps {
    /// Journals and tracing default to no-ops.
    pub fn new(
        classifier: Arc<dyn IntentClassifier>,
        retriever: Arc<dyn ContextRetriever>,
        external: Arc<dyn ExternalInfoFetcher>,
        drafter: Arc<dyn Drafter>,
        reviewer: Arc<dyn SafetyReviewer>,
        sender: Arc<dyn EmailSender>,
        store: Arc<dyn RunStore>,
    ) -> Self {
        Self {
            classifier,
            retriever,
            external,
            drafter,
            reviewer,
            sender,
            store,
            events: Arc::new(NoopJournal),
            task_log: Arc::new(NoopJournal),
            tracer: Arc::new(NoopTraceSink),
            safety: SafetyLayer::new(),
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn with_task_log(mut self, task_log: Arc<dyn TaskLogSink>) -> Self {
        self.task_log = task_log;
        self
    }

    pub fn with_tracer(mut self, tracer: Arc<dyn TraceSink>) -> Self {
        self.tracer = tracer;
        self
    }

    pub fn with_safety(mut self, safety: SafetyLayer) -> Self {
        self.safety = safety;
        self
    }
}

// ── Orchestrator ────────────────────────────────────────────────────

pub struct Orchestrator {
    config: WorkflowConfig,
    deps: OrchestratorDeps,
}

impl Orchestrator {
    pub fn new(config: WorkflowConfig, deps: OrchestratorDeps) -> Self {
        Self { config, deps }
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    /// Run `task` to completion, asking `gate` at every human checkpoint.
    /// Returns `AwaitingApproval` if the gate defers.
    pub async fn orchestrate(&self, task: EmailTask, gate: &dyn ApprovalGate) -> Result<RunOutcome, RunError> {
        let mut outcome = self.submit(task).await?;
        loop {
            let pending = match outcome {
                RunOutcome::AwaitingApproval(pending) => pending,
                done => return Ok(done),
            };
            match gate.decide(&pending).await {
                Some(decision) => outcome = self.resume(&pending.session_id, decision).await?,
                None => return Ok(RunOutcome::AwaitingApproval(pending)),
            }
        }
    }

    /// Start a run and drive it to the human gate or a terminal state.
    pub async fn submit(&self, task: EmailTask) -> Result<RunOutcome, RunError> {
        task.validate()
            .map_err(|e| RunError::new(RunErrorKind::InvalidTask, task.session_id.clone(), e.to_string()))?;

        let session_id = task.session_id.clone();
        if let Some(existing) = self.load_optional(&session_id).await? {
            return Err(RunError::new(
                RunErrorKind::InvalidState {
                    state: existing.state.to_string(),
                },
                session_id,
                "a run with this session id already exists",
            ));
        }

        info!(
            session_id = %session_id,
            recipient = %task.recipient,
            "Run started"
        );

        let mut record = RunRecord::new(task);
        record.trace_id = self.deps.tracer.start_trace(&session_id).await;
        self.persist(&record).await?;
        self.emit(
            RunEvent::new(&session_id, "submitted")
                .with("recipient", record.task.recipient.clone())
                .with("trace_id", record.trace_id.clone()),
        )
        .await;

        self.drive(record).await
    }

    /// Apply a human decision to a suspended run and continue it.
    pub async fn resume(&self, session_id: &str, decision: HumanDecision) -> Result<RunOutcome, RunError> {
        let mut record = self.load(session_id).await?;
        if record.state != RunState::AwaitingApproval {
            return Err(RunError::new(
                RunErrorKind::InvalidState {
                    state: record.state.to_string(),
                },
                session_id,
                "run is not waiting for approval",
            ));
        }

        if !self.claim(session_id).await? {
            return Err(RunError::new(
                RunErrorKind::InvalidState {
                    state: RunState::AwaitingApproval.to_string(),
                },
                session_id,
                "another decision is already being applied to this run",
            ));
        }

        if self.is_expired(&record, Utc::now()) {
            warn!(session_id, "Approval window elapsed, closing run");
            record.error = Some("approval window elapsed before a decision was made".into());
            self.advance(&mut record, StepOutcome::ApprovalExpired, Fields::new())
                .await?;
            return self.finish(record).await;
        }

        let outcome = match &decision {
            HumanDecision::Approve => StepOutcome::HumanApproved,
            HumanDecision::Reject { feedback: Some(feedback) } => {
                record.human_feedback = Some(feedback.clone());
                StepOutcome::HumanRejected { with_feedback: true }
            }
            HumanDecision::Reject { feedback: None } => StepOutcome::HumanRejected { with_feedback: false },
        };
        info!(session_id, decision = ?decision, "Human decision received");

        let decision_fields = fields(json!({ "decision": decision }));
        self.advance(&mut record, outcome, decision_fields).await?;
        self.drive(record).await
    }

    /// Runs waiting at the human gate, oldest first.
    pub async fn pending_approvals(&self) -> Result<Vec<PendingApproval>, RunError> {
        let records = self
            .deps
            .store
            .list_awaiting()
            .await
            .map_err(|e| RunError::storage("", e))?;
        Ok(records.iter().filter_map(PendingApproval::from_record).collect())
    }

    /// Waiting runs whose approval window has elapsed.
    pub async fn expired_approvals(&self) -> Result<Vec<PendingApproval>, RunError> {
        let Some(cutoff) = self.gate_cutoff(Utc::now()) else {
            return Ok(Vec::new());
        };
        let records = self
            .deps
            .store
            .list_awaiting_before(cutoff)
            .await
            .map_err(|e| RunError::storage("", e))?;
        Ok(records.iter().filter_map(PendingApproval::from_record).collect())
    }

    /// Close every expired run. Returns the session ids that were closed.
    pub async fn expire_stale_approvals(&self) -> Result<Vec<String>, RunError> {
        let mut closed = Vec::new();
        for pending in self.expired_approvals().await? {
            if !self.claim(&pending.session_id).await? {
                debug!(session_id = %pending.session_id, "Run resumed before it could be expired");
                continue;
            }
            let mut record = self.load(&pending.session_id).await?;
            record.error = Some("approval window elapsed before a decision was made".into());
            self.advance(&mut record, StepOutcome::ApprovalExpired, Fields::new())
                .await?;
            // The error is the expected result; only the side effects matter here.
            let _ = self.finish(record).await;
            closed.push(pending.session_id);
        }
        if !closed.is_empty() {
            info!(count = closed.len(), "Expired stale approvals");
        }
        Ok(closed)
    }

    /// Load a persisted run.
    pub async fn get_run(&self, session_id: &str) -> Result<RunRecord, RunError> {
        self.load(session_id).await
    }

    // ── Driver ──────────────────────────────────────────────────────

    async fn drive(&self, mut record: RunRecord) -> Result<RunOutcome, RunError> {
        let max_steps = self.config.max_steps();

        loop {
            if record.state.is_terminal() {
                return self.finish(record).await;
            }

            if record.state.is_suspended() {
                let pending = PendingApproval::from_record(&record).ok_or_else(|| {
                    RunError::new(
                        RunErrorKind::InvalidState {
                            state: record.state.to_string(),
                        },
                        record.session_id.clone(),
                        "run reached the human gate without a reviewed draft",
                    )
                })?;
                info!(
                    session_id = %record.session_id,
                    revisions = record.revision_count,
                    route = %record.routing_decision(),
                    "Run awaiting human approval"
                );
                return Ok(RunOutcome::AwaitingApproval(pending));
            }

            if record.steps_in_leg >= max_steps {
                error!(
                    session_id = %record.session_id,
                    state = %record.state,
                    max_steps,
                    "Step limit exceeded"
                );
                return Err(RunError::new(
                    RunErrorKind::InvalidState {
                        state: record.state.to_string(),
                    },
                    record.session_id.clone(),
                    format!("step limit of {max_steps} exceeded"),
                ));
            }

            record.steps_in_leg += 1;
            let (outcome, step_fields) = self.execute(&mut record).await?;
            self.advance(&mut record, outcome, step_fields).await?;
        }
    }

    /// Route `outcome`, record the transition, journal it and persist.
    async fn advance(&self, record: &mut RunRecord, outcome: StepOutcome, step_fields: Fields) -> Result<(), RunError> {
        let ctx = record.routing_context(self.config.confidence_threshold, self.config.max_redraft_attempts);
        let from = record.state;
        let to = transition(from, outcome, &ctx).map_err(|e| {
            RunError::new(
                RunErrorKind::InvalidState {
                    state: from.to_string(),
                },
                record.session_id.clone(),
                e.to_string(),
            )
        })?;

        debug!(
            session_id = %record.session_id,
            from = %from,
            to = %to,
            outcome = ?outcome,
            "Transition"
        );
        record.transition_to(to, Some(format!("{outcome:?}")));

        let mut event = RunEvent::new(&record.session_id, from.name())
            .with("next", to.to_string())
            .with("revision_count", record.revision_count);
        event.fields.extend(step_fields);
        self.emit(event).await;

        self.persist(record).await
    }

    async fn execute(&self, record: &mut RunRecord) -> Result<(StepOutcome, Fields), RunError> {
        match record.state {
            RunState::Classify => Ok(self.classify(record).await),
            RunState::Retrieve => Ok(self.retrieve(record).await),
            RunState::External => Ok(self.fetch_external(record).await),
            RunState::Draft => Ok(self.draft(record).await),
            RunState::Review => self.review(record).await,
            RunState::Send => self.send(record).await,
            state @ (RunState::AwaitingApproval | RunState::Sent | RunState::Failed { .. }) => Err(RunError::new(
                RunErrorKind::InvalidState {
                    state: state.to_string(),
                },
                record.session_id.clone(),
                "no step to execute in this state",
            )),
        }
    }

    // ── Steps ───────────────────────────────────────────────────────

    async fn classify(&self, record: &mut RunRecord) -> (StepOutcome, Fields) {
        let classifier = &self.deps.classifier;
        let task = &record.task;
        let call = call_with_policy("classify", &self.policy(), || classifier.classify(task)).await;
        let intent = self.degrade(record, "classify", call, |_| IntentResult::fallback());

        self.span(
            record,
            "classify",
            json!({ "description": record.task.description }),
            json!(intent),
        )
        .await;

        let outcome = StepOutcome::classified(&intent);
        let step_fields = fields(json!({
            "label": intent.label,
            "urgency": intent.urgency,
            "needs_external": intent.needs_external,
        }));
        record.intent = Some(intent);
        (outcome, step_fields)
    }

    async fn retrieve(&self, record: &mut RunRecord) -> (StepOutcome, Fields) {
        let intent = record.intent.clone().unwrap_or_else(IntentResult::fallback);
        let retriever = &self.deps.retriever;
        let task = &record.task;
        let feedback = record.human_feedback.as_deref();
        let call = call_with_policy("retrieve", &self.policy(), || {
            retriever.retrieve(task, &intent, feedback)
        })
        .await;
        let context = self.degrade(record, "retrieve", call, |_| RetrievedContext::degraded());

        self.span(
            record,
            "retrieve",
            json!({ "label": intent.label, "feedback": record.human_feedback }),
            json!(context),
        )
        .await;

        let outcome = StepOutcome::Retrieved {
            confidence: context.confidence,
            needs_external: intent.needs_external,
        };
        let step_fields = fields(json!({
            "snippets": context.snippets.len(),
            "confidence": context.confidence,
            "escalation_required": context.escalation_required,
        }));
        record.context = Some(context);
        (outcome, step_fields)
    }

    async fn fetch_external(&self, record: &mut RunRecord) -> (StepOutcome, Fields) {
        let intent = record.intent.clone().unwrap_or_else(IntentResult::fallback);
        let fetcher = &self.deps.external;
        let task = &record.task;
        let call = call_with_policy("external", &self.policy(), || fetcher.fetch(task, &intent)).await;
        let info = self.degrade(record, "external", call, |e| external_error(e));

        self.span(
            record,
            "external",
            json!({ "label": intent.label }),
            json!({ "summary": info }),
        )
        .await;

        let step_fields = fields(json!({
            "chars": info.chars().count(),
            "degraded": info.starts_with(EXTERNAL_ERROR_PREFIX),
        }));
        record.external_info = Some(info);
        (StepOutcome::ExternalFetched, step_fields)
    }

    async fn draft(&self, record: &mut RunRecord) -> (StepOutcome, Fields) {
        let notes = record
            .draft
            .as_ref()
            .map(|d| d.revision_notes.clone())
            .unwrap_or_default();

        let request = DraftRequest {
            task: &record.task,
            intent: record.intent.as_ref(),
            context: record.context.as_ref(),
            external_info: record.external_info.as_deref(),
            human_feedback: record.human_feedback.as_deref(),
            revision_notes: &notes,
        };
        let drafter = &self.deps.drafter;
        let call = call_with_policy("draft", &self.policy(), || drafter.draft(&request)).await;
        let mut draft = self.degrade(record, "draft", call, |e| Draft::error(e));
        draft.revision_notes = notes;
        draft.trace_id = record.trace_id.clone();

        self.span(
            record,
            "draft",
            json!({ "revision": record.revision_count, "notes": draft.revision_notes }),
            json!({ "subject": draft.subject, "sources": draft.sources }),
        )
        .await;

        let step_fields = fields(json!({
            "subject": draft.subject,
            "sources": draft.sources,
            "error_draft": draft.is_error(),
        }));
        record.verdict = None;
        record.draft = Some(draft);
        (StepOutcome::Drafted, step_fields)
    }

    async fn review(&self, record: &mut RunRecord) -> Result<(StepOutcome, Fields), RunError> {
        let draft = record.draft.clone().ok_or_else(|| {
            RunError::new(
                RunErrorKind::InvalidState {
                    state: record.state.to_string(),
                },
                record.session_id.clone(),
                "no draft to review",
            )
        })?;

        let reviewer = &self.deps.reviewer;
        let task = &record.task;
        let call = call_with_policy("review", &self.policy(), || reviewer.review(task, &draft)).await;
        let mut verdict = self.degrade(record, "review", call, |e| {
            fail_closed(&self.deps.safety, &draft, format!("Safety review unavailable: {e}"))
        });

        if draft.is_error() && verdict.approved {
            verdict = fail_closed(
                &self.deps.safety,
                &draft,
                "Draft is an error placeholder and cannot be sent",
            );
        }

        self.span(
            record,
            "review",
            json!({ "subject": draft.subject }),
            json!({ "approved": verdict.approved, "issues": verdict.issues }),
        )
        .await;

        if !verdict.approved {
            let issues = if verdict.issues.is_empty() {
                "rejected without details".to_string()
            } else {
                verdict.issues.join("; ")
            };
            let note = format!("Revision {}: {}", record.revision_count + 1, issues);
            debug!(session_id = %record.session_id, note = %note, "Draft rejected by safety review");
            if let Some(current) = record.draft.as_mut() {
                current.revision_notes.push(note);
            }
        }

        let outcome = StepOutcome::Reviewed {
            approved: verdict.approved,
        };
        let step_fields = fields(json!({
            "approved": verdict.approved,
            "issues": verdict.issues,
        }));
        record.verdict = Some(verdict);
        Ok((outcome, step_fields))
    }

    async fn send(&self, record: &mut RunRecord) -> Result<(StepOutcome, Fields), RunError> {
        let (Some(draft), Some(verdict)) = (record.draft.as_ref(), record.verdict.as_ref()) else {
            return Err(RunError::new(
                RunErrorKind::InvalidState {
                    state: record.state.to_string(),
                },
                record.session_id.clone(),
                "nothing approved to send",
            ));
        };

        let email = FinalEmail {
            recipient: record.task.recipient.clone(),
            subject: draft.subject.clone(),
            body: verdict.redacted_body.clone(),
            trace_id: record.trace_id.clone(),
        };

        // Not wrapped in the step timeout: an abandoned send may still deliver.
        let result = self.deps.sender.send(&email).await.map_err(|e| e.to_string());

        let outcome = match result {
            Ok(()) => {
                info!(
                    session_id = %record.session_id,
                    recipient = %email.recipient,
                    sender = self.deps.sender.name(),
                    "Email delivered"
                );
                StepOutcome::Delivered
            }
            Err(reason) => {
                error!(
                    session_id = %record.session_id,
                    recipient = %email.recipient,
                    error = %reason,
                    "Email delivery failed"
                );
                record.error = Some(reason);
                StepOutcome::DeliveryFailed
            }
        };

        self.span(
            record,
            "send",
            json!({ "recipient": email.recipient, "subject": email.subject }),
            json!({ "delivered": outcome == StepOutcome::Delivered }),
        )
        .await;

        let step_fields = fields(json!({
            "sender": self.deps.sender.name(),
            "delivered": outcome == StepOutcome::Delivered,
        }));
        record.final_email = Some(email);
        Ok((outcome, step_fields))
    }

    // ── Terminal handling ───────────────────────────────────────────

    /// Write the task log and convert the terminal state for the caller.
    async fn finish(&self, record: RunRecord) -> Result<RunOutcome, RunError> {
        self.log_task(&record).await;

        let session_id = record.session_id.clone();
        match record.state {
            RunState::Sent => {
                let email = record.final_email.ok_or_else(|| {
                    RunError::new(
                        RunErrorKind::InvalidState {
                            state: RunState::Sent.to_string(),
                        },
                        session_id.clone(),
                        "sent run has no final email",
                    )
                })?;
                info!(
                    session_id = %session_id,
                    revisions = record.revision_count,
                    "Run completed"
                );
                Ok(RunOutcome::Sent {
                    session_id,
                    email,
                    revisions: record.revision_count,
                })
            }
            RunState::Failed {
                reason: FailureReason::Rejected,
            } => {
                info!(session_id = %session_id, "Run rejected by reviewer");
                Ok(RunOutcome::Rejected { session_id })
            }
            RunState::Failed {
                reason: FailureReason::MaxRevisionsExceeded,
            } => {
                warn!(
                    session_id = %session_id,
                    attempts = record.revision_count,
                    "Revision limit exceeded"
                );
                Err(RunError::new(
                    RunErrorKind::RevisionLimitExceeded {
                        attempts: record.revision_count,
                    },
                    session_id,
                    format!(
                        "draft still rejected after {} revisions",
                        record.revision_count
                    ),
                ))
            }
            RunState::Failed {
                reason: FailureReason::SendFailed,
            } => Err(RunError::new(
                RunErrorKind::SendFailure,
                session_id,
                record.error.unwrap_or_else(|| "delivery failed".into()),
            )),
            RunState::Failed {
                reason: FailureReason::ApprovalExpired,
            } => Err(RunError::new(
                RunErrorKind::ApprovalExpired,
                session_id,
                record.error.unwrap_or_else(|| "approval window elapsed".into()),
            )),
            state => Err(RunError::new(
                RunErrorKind::InvalidState {
                    state: state.to_string(),
                },
                session_id,
                "run is not terminal",
            )),
        }
    }

    async fn log_task(&self, record: &RunRecord) {
        let delivery = match record.state {
            RunState::Sent => Some(DeliveryStatus::Sent),
            RunState::Failed {
                reason: FailureReason::SendFailed,
            } => Some(DeliveryStatus::Failed),
            _ => None,
        };

        let entry = TaskLogEntry {
            session_id: record.session_id.clone(),
            task: record.task.clone(),
            intent: record.intent.clone(),
            context: record.context.clone(),
            external_info: record.external_info.clone(),
            draft: record.draft.clone(),
            verdict: record.verdict.clone(),
            final_email: record.final_email.clone(),
            extra: json!({
                "routing_decision": record.routing_decision(),
                "revision_count": record.revision_count,
                "delivery": delivery,
                "outcome": record.state.to_string(),
                "error": record.error,
            }),
            logged_at: Utc::now(),
        };

        if let Err(e) = self.deps.task_log.record_task(&entry).await {
            warn!(session_id = %record.session_id, error = %e, "Failed to write task log entry");
        }
    }

    // ── Helpers ─────────────────────────────────────────────────────

    fn policy(&self) -> CallPolicy {
        CallPolicy {
            retry: self.config.retry.clone(),
            timeout: self.config.step_timeout,
        }
    }

    /// Unwrap a step result, or log and substitute the degraded value.
    fn degrade<T>(
        &self,
        record: &RunRecord,
        step: &str,
        call: RetryResult<T>,
        fallback: impl FnOnce(&StepError) -> T,
    ) -> T {
        match call.result {
            Ok(value) => value,
            Err(e) => {
                warn!(
                    session_id = %record.session_id,
                    step,
                    attempts = call.attempts,
                    error = %e,
                    "Step failed, continuing with degraded result"
                );
                fallback(&e)
            }
        }
    }

    async fn span(&self, record: &RunRecord, step: &str, input: Value, output: Value) {
        if let Some(trace_id) = &record.trace_id {
            self.deps.tracer.record_span(trace_id, step, &input, &output).await;
        }
    }

    async fn emit(&self, event: RunEvent) {
        if let Err(e) = self.deps.events.record_event(&event).await {
            warn!(
                session_id = %event.session_id,
                step = %event.step,
                error = %e,
                "Failed to write run event"
            );
        }
    }

    async fn persist(&self, record: &RunRecord) -> Result<(), RunError> {
        self.deps
            .store
            .save_run(record)
            .await
            .map_err(|e| RunError::storage(record.session_id.clone(), e))
    }

    async fn claim(&self, session_id: &str) -> Result<bool, RunError> {
        self.deps
            .store
            .claim_awaiting(session_id)
            .await
            .map_err(|e| RunError::storage(session_id, e))
    }

    async fn load_optional(&self, session_id: &str) -> Result<Option<RunRecord>, RunError> {
        self.deps
            .store
            .get_run(session_id)
            .await
            .map_err(|e| RunError::storage(session_id, e))
    }

    async fn load(&self, session_id: &str) -> Result<RunRecord, RunError> {
        self.load_optional(session_id)
            .await?
            .ok_or_else(|| RunError::new(RunErrorKind::NotFound, session_id, "no run with this session id"))
    }

    /// Runs parked before this instant have expired. `None` when the gate
    /// has no timeout.
    fn gate_cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let timeout = self.config.human_gate_timeout?;
        let window = chrono::Duration::from_std(timeout).ok()?;
        now.checked_sub_signed(window)
    }

    fn is_expired(&self, record: &RunRecord, now: DateTime<Utc>) -> bool {
        match (self.gate_cutoff(now), record.awaiting_since) {
            (Some(cutoff), Some(since)) => since < cutoff,
            _ => false,
        }
    }
}
