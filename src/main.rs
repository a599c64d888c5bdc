use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use mail_crew::channels::{EmailSender, LogSender, SmtpConfig, SmtpSender};
use mail_crew::config::{RuntimeConfig, WorkflowConfig};
use mail_crew::journal::JsonlJournal;
use mail_crew::knowledge::InMemoryKnowledgeBase;
use mail_crew::llm::{LlmConfig, create_provider};
use mail_crew::pipeline::drafter::{Drafter, LlmDrafter, TemplateDrafter};
use mail_crew::pipeline::external::SearchFetcher;
use mail_crew::pipeline::intent::{IntentClassifier, KeywordIntentClassifier, LlmIntentClassifier};
use mail_crew::pipeline::retriever::KnowledgeRetriever;
use mail_crew::pipeline::review::{BlocklistReviewer, LlmSafetyReviewer, SafetyReviewer};
use mail_crew::pipeline::types::{EmailTask, HumanDecision};
use mail_crew::pipeline::{Orchestrator, OrchestratorDeps, PendingApproval, RunOutcome};
use mail_crew::search::{SearchConfig, StubSearch, TavilySearch, WebSearch};
use mail_crew::store::LibSqlRunStore;
use mail_crew::tracing_sink::LogTraceSink;

/// Mail Crew
#[derive(Parser)]
#[command(name = "mail-crew")]
#[command(version, about = "Customer-service reply pipeline with a human gate", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Draft a reply and park it for approval
    Draft {
        /// Recipient address
        recipient: String,

        /// What the customer asked about
        description: String,

        /// Subject to use instead of the default
        #[arg(long)]
        subject: Option<String>,

        /// Extra text to append to the body
        #[arg(long)]
        hint: Option<String>,

        /// Explicit session id (generated if omitted)
        #[arg(long)]
        session: Option<String>,
    },

    /// Approve a pending draft and send it
    Approve { session: String },

    /// Reject a pending draft; feedback triggers a new revision
    Reject { session: String, feedback: Option<String> },

    /// List runs waiting for approval
    Pending,

    /// Close runs whose approval window has elapsed
    Expire,

    /// Show what a knowledge directory would load
    Ingest { dir: PathBuf },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    let runtime = RuntimeConfig::from_env();
    let _log_guard = init_tracing(runtime.log_dir.as_deref());

    match cli.command {
        Command::Ingest { dir } => {
            let kb = InMemoryKnowledgeBase::ingest_dir(&dir).await?;
            println!("📚 {} documents in {}", kb.len(), dir.display());
            for source in kb.sources() {
                println!("   - {source}");
            }
        }

        Command::Draft {
            recipient,
            description,
            subject,
            hint,
            session,
        } => {
            let mut task = EmailTask::new(recipient, description);
            if let Some(session) = session {
                task = task.with_session_id(session);
            }
            if let Some(subject) = subject {
                task = task.with_subject_hint(subject);
            }
            if let Some(hint) = hint {
                task = task.with_body_hint(hint);
            }
            let orchestrator = build_orchestrator(&runtime).await?;
            let outcome = orchestrator.submit(task).await?;
            print_outcome(&outcome);
        }

        Command::Approve { session } => {
            let orchestrator = build_orchestrator(&runtime).await?;
            let outcome = orchestrator.resume(&session, HumanDecision::Approve).await?;
            print_outcome(&outcome);
        }

        Command::Reject { session, feedback } => {
            let decision = match feedback {
                Some(feedback) => HumanDecision::reject_with(feedback),
                None => HumanDecision::reject(),
            };
            let orchestrator = build_orchestrator(&runtime).await?;
            let outcome = orchestrator.resume(&session, decision).await?;
            print_outcome(&outcome);
        }

        Command::Pending => {
            let orchestrator = build_orchestrator(&runtime).await?;
            let pending = orchestrator.pending_approvals().await?;
            if pending.is_empty() {
                println!("No runs waiting for approval.");
            }
            for item in &pending {
                print_pending(item);
            }
        }

        Command::Expire => {
            let orchestrator = build_orchestrator(&runtime).await?;
            let closed = orchestrator.expire_stale_approvals().await?;
            println!("⏱️  Closed {} expired run(s)", closed.len());
            for session_id in closed {
                println!("   - {session_id}");
            }
        }
    }

    Ok(())
}

/// Stderr logging, plus a daily-rotated file when `log_dir` is set.
fn init_tracing(log_dir: Option<&Path>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "mail-crew.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .init();
            None
        }
    }
}

async fn build_orchestrator(runtime: &RuntimeConfig) -> anyhow::Result<Orchestrator> {
    let config = WorkflowConfig::from_env()?;

    // ── Storage ──────────────────────────────────────────────────────────
    let store = LibSqlRunStore::new_local(&runtime.db_path)
        .await
        .with_context(|| format!("opening database at {}", runtime.db_path.display()))?;
    let journal = Arc::new(JsonlJournal::open(runtime.journal_dir.clone()).await?);

    // ── Knowledge + search ───────────────────────────────────────────────
    let kb = match &runtime.knowledge_dir {
        Some(dir) => InMemoryKnowledgeBase::ingest_dir(dir).await?,
        None => {
            warn!("MAIL_CREW_KNOWLEDGE_DIR not set, retrieval will find nothing");
            InMemoryKnowledgeBase::new()
        }
    };
    let retriever = Arc::new(KnowledgeRetriever::new(Arc::new(kb)));

    let search_config = SearchConfig::from_env();
    let search: Arc<dyn WebSearch> = match &search_config.api_key {
        Some(key) => Arc::new(TavilySearch::new(
            key.clone(),
            search_config.endpoint.clone(),
            search_config.timeout,
        )?),
        None => Arc::new(StubSearch),
    };
    info!(provider = search.provider_name(), "External search ready");
    let external = Arc::new(SearchFetcher::new(search, search_config.max_results));

    // ── LLM steps (or offline fallbacks) ─────────────────────────────────
    let (classifier, drafter, reviewer): (
        Arc<dyn IntentClassifier>,
        Arc<dyn Drafter>,
        Arc<dyn SafetyReviewer>,
    ) = match LlmConfig::from_env()? {
        Some(llm_config) => {
            let llm = create_provider(&llm_config)?;
            info!(model = llm.model_name(), "Using LLM classifier, drafter and reviewer");
            (
                Arc::new(LlmIntentClassifier::new(llm.clone())),
                Arc::new(LlmDrafter::new(llm.clone())),
                Arc::new(LlmSafetyReviewer::new(llm, config.min_safety_confidence)),
            )
        }
        None => {
            info!("No LLM key configured, using keyword classifier and template drafter");
            (
                Arc::new(KeywordIntentClassifier::default_rules()),
                Arc::new(TemplateDrafter::new()),
                Arc::new(BlocklistReviewer::default()),
            )
        }
    };

    // ── Delivery ─────────────────────────────────────────────────────────
    let sender: Arc<dyn EmailSender> = match SmtpConfig::from_env() {
        Some(smtp) => Arc::new(SmtpSender::new(smtp.with_timeout_within(config.step_timeout))),
        None => {
            warn!("SMTP_HOST not set, approved emails will only be logged");
            Arc::new(LogSender)
        }
    };

    let deps = OrchestratorDeps::new(
        classifier,
        retriever,
        external,
        drafter,
        reviewer,
        sender,
        Arc::new(store),
    )
    .with_events(journal.clone())
    .with_task_log(journal)
    .with_tracer(Arc::new(LogTraceSink));

    Ok(Orchestrator::new(config, deps))
}

fn print_outcome(outcome: &RunOutcome) {
    match outcome {
        RunOutcome::AwaitingApproval(pending) => print_pending(pending),
        RunOutcome::Sent {
            session_id,
            email,
            revisions,
        } => println!(
            "✅ Sent to {} (session {session_id}, {revisions} revision(s))",
            email.recipient
        ),
        RunOutcome::Rejected { session_id } => {
            println!("🛑 Session {session_id} rejected, nothing was sent")
        }
    }
}

fn print_pending(pending: &PendingApproval) {
    println!("📝 Session {} awaiting approval", pending.session_id);
    println!("   To:      {}", pending.recipient);
    println!("   Subject: {}", pending.draft.subject);
    if pending.revision_count > 0 {
        println!("   Revisions: {}", pending.revision_count);
    }
    if let Some(since) = pending.awaiting_since {
        println!("   Waiting since: {}", since.to_rfc3339());
    }
    println!();
    println!("{}", pending.verdict.redacted_body);
    println!();
}
