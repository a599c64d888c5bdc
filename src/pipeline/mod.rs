//! Reply pipeline.
//!
//! Every task flows through:
//! 1. `IntentClassifier::classify()`: label, urgency, external need
//! 2. `ContextRetriever::retrieve()`: knowledge snippets with a confidence
//! 3. `ExternalInfoFetcher::fetch()`: only when retrieval is not confident
//! 4. `Drafter::draft()` and `SafetyReviewer::review()`, looping on rejection
//! 5. Human gate, then `EmailSender::send()`
//!
//! **No auto-send path exists.** Every outbound email requires a human
//! approval recorded through [`orchestrator::Orchestrator::resume`] or an
//! [`orchestrator::ApprovalGate`].

pub mod drafter;
pub mod external;
pub mod intent;
pub mod orchestrator;
pub mod retriever;
pub mod review;
pub mod state;
pub mod types;

pub use orchestrator::{
    ApprovalGate, AutoApprove, Deferred, Orchestrator, OrchestratorDeps, PendingApproval, RunOutcome,
    ScriptedGate,
};
