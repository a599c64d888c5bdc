//! Run state machine.
//!
//! `transition` is a pure function of (state, outcome, routing context). The
//! orchestrator executes the step for the current state, reports what happened
//! as a [`StepOutcome`], and asks `transition` where to go next.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::pipeline::types::{Draft, EmailTask, FinalEmail, IntentResult, RetrievedContext, SafetyVerdict};

/// Why a run ended without sending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    MaxRevisionsExceeded,
    Rejected,
    SendFailed,
    ApprovalExpired,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::MaxRevisionsExceeded => "max_revisions_exceeded",
            Self::Rejected => "rejected",
            Self::SendFailed => "send_failed",
            Self::ApprovalExpired => "approval_expired",
        };
        write!(f, "{s}")
    }
}

/// State of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunState {
    Classify,
    Retrieve,
    External,
    Draft,
    Review,
    /// Suspended at the human gate.
    AwaitingApproval,
    Send,
    Sent,
    Failed { reason: FailureReason },
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Sent | Self::Failed { .. })
    }

    /// States where the driver loop stops and returns control to the caller.
    pub fn is_suspended(&self) -> bool {
        matches!(self, Self::AwaitingApproval)
    }

    /// Short name used for the persisted status column and event `step` field.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Classify => "classify",
            Self::Retrieve => "retrieve",
            Self::External => "external",
            Self::Draft => "draft",
            Self::Review => "review",
            Self::AwaitingApproval => "human_gate",
            Self::Send => "send",
            Self::Sent => "sent",
            Self::Failed { .. } => "error",
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Failed { reason } => write!(f, "error({reason})"),
            other => write!(f, "{}", other.name()),
        }
    }
}

/// What the step for the current state produced, reduced to what routing needs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StepOutcome {
    Classified { research: bool, needs_retrieval: bool },
    Retrieved { confidence: f32, needs_external: bool },
    ExternalFetched,
    Drafted,
    Reviewed { approved: bool },
    HumanApproved,
    HumanRejected { with_feedback: bool },
    ApprovalExpired,
    Delivered,
    DeliveryFailed,
}

impl StepOutcome {
    /// Classification routing: research goes straight out, anything that
    /// needs internal knowledge (or external info) goes through retrieval.
    pub fn classified(intent: &IntentResult) -> Self {
        Self::Classified {
            research: intent.is_research(),
            needs_retrieval: intent.needs_external || intent.needs_internal_knowledge(),
        }
    }
}

/// Run-level facts routing depends on.
#[derive(Debug, Clone, Copy)]
pub struct RoutingContext {
    pub confidence_threshold: f32,
    pub max_redraft_attempts: u32,
    pub revision_count: u32,
    /// A draft already exists, so entering `Draft` is a revision.
    pub has_draft: bool,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransitionError {
    #[error("run is already terminal ({0})")]
    Terminal(RunState),

    #[error("outcome {outcome:?} is not valid in state {state}")]
    Unexpected { state: RunState, outcome: StepOutcome },
}

/// Compute the next state.
pub fn transition(
    state: RunState,
    outcome: StepOutcome,
    ctx: &RoutingContext,
) -> Result<RunState, TransitionError> {
    use RunState::*;
    use StepOutcome::*;

    if state.is_terminal() {
        return Err(TransitionError::Terminal(state));
    }

    let next = match (state, outcome) {
        (Classify, Classified { research: true, .. }) => External,
        (Classify, Classified { needs_retrieval: true, .. }) => Retrieve,
        (Classify, Classified { .. }) => enter_draft(ctx),

        (Retrieve, Retrieved { confidence, needs_external }) => {
            if needs_external && confidence < ctx.confidence_threshold {
                External
            } else {
                enter_draft(ctx)
            }
        }

        (External, ExternalFetched) => enter_draft(ctx),

        (Draft, Drafted) => Review,

        (Review, Reviewed { approved: true }) => AwaitingApproval,
        (Review, Reviewed { approved: false }) => enter_draft(ctx),

        (AwaitingApproval, HumanApproved) => Send,
        (AwaitingApproval, HumanRejected { with_feedback: true }) => Retrieve,
        (AwaitingApproval, HumanRejected { with_feedback: false }) => Failed {
            reason: FailureReason::Rejected,
        },
        (AwaitingApproval, StepOutcome::ApprovalExpired) => Failed {
            reason: FailureReason::ApprovalExpired,
        },

        (Send, Delivered) => Sent,
        (Send, DeliveryFailed) => Failed {
            reason: FailureReason::SendFailed,
        },

        (state, outcome) => return Err(TransitionError::Unexpected { state, outcome }),
    };

    Ok(next)
}

/// Entering `Draft` again is a revision; refuse once the budget is spent.
fn enter_draft(ctx: &RoutingContext) -> RunState {
    if ctx.has_draft && ctx.revision_count >= ctx.max_redraft_attempts {
        RunState::Failed {
            reason: FailureReason::MaxRevisionsExceeded,
        }
    } else {
        RunState::Draft
    }
}

/// A recorded state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: RunState,
    pub to: RunState,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}

const MAX_TRANSITIONS: usize = 200;

/// Everything a run knows. Persisted at every step so a suspended run can be
/// resumed from another process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub session_id: String,
    pub task: EmailTask,
    pub state: RunState,
    pub intent: Option<IntentResult>,
    pub context: Option<RetrievedContext>,
    pub external_info: Option<String>,
    pub draft: Option<Draft>,
    pub verdict: Option<SafetyVerdict>,
    pub human_feedback: Option<String>,
    pub final_email: Option<FinalEmail>,
    pub trace_id: Option<String>,
    /// Last fatal error message (delivery failure, expiry).
    #[serde(default)]
    pub error: Option<String>,
    pub revision_count: u32,
    /// Steps executed since the last human decision.
    pub steps_in_leg: u32,
    /// States visited, in order, across the whole run.
    pub route: Vec<String>,
    pub transitions: Vec<StateTransition>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub awaiting_since: Option<DateTime<Utc>>,
}

impl RunRecord {
    pub fn new(task: EmailTask) -> Self {
        let now = Utc::now();
        Self {
            session_id: task.session_id.clone(),
            task,
            state: RunState::Classify,
            intent: None,
            context: None,
            external_info: None,
            draft: None,
            verdict: None,
            human_feedback: None,
            final_email: None,
            trace_id: None,
            error: None,
            revision_count: 0,
            steps_in_leg: 0,
            route: vec![RunState::Classify.name().to_string()],
            transitions: Vec::new(),
            created_at: now,
            updated_at: now,
            awaiting_since: None,
        }
    }

    pub fn routing_context(&self, confidence_threshold: f32, max_redraft_attempts: u32) -> RoutingContext {
        RoutingContext {
            confidence_threshold,
            max_redraft_attempts,
            revision_count: self.revision_count,
            has_draft: self.draft.is_some(),
        }
    }

    /// Move to `to`, keeping bookkeeping in sync.
    pub fn transition_to(&mut self, to: RunState, reason: Option<String>) {
        let now = Utc::now();
        self.transitions.push(StateTransition {
            from: self.state,
            to,
            timestamp: now,
            reason,
        });
        if self.transitions.len() > MAX_TRANSITIONS {
            let drain_count = self.transitions.len() - MAX_TRANSITIONS;
            self.transitions.drain(..drain_count);
        }

        if to == RunState::Draft && self.draft.is_some() {
            self.revision_count += 1;
        }
        if to == RunState::AwaitingApproval {
            self.awaiting_since = Some(now);
        } else if self.state == RunState::AwaitingApproval {
            self.awaiting_since = None;
            self.steps_in_leg = 0;
        }

        self.route.push(to.name().to_string());
        self.state = to;
        self.updated_at = now;
    }

    /// Human-readable route, e.g. `classify -> retrieve -> draft`.
    pub fn routing_decision(&self) -> String {
        self.route.join(" -> ")
    }
}
