//! Outbound delivery of approved replies.

pub mod email;

pub use email::{LogSender, SmtpConfig, SmtpSender};

use async_trait::async_trait;

use crate::error::ChannelError;
use crate::pipeline::types::FinalEmail;

/// Delivers a final email. Called once per run; failures are not retried here.
///
/// The caller waits for the send to finish, so implementations bound their
/// own I/O (see [`SmtpConfig::timeout`]).
#[async_trait]
pub trait EmailSender: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, email: &FinalEmail) -> Result<(), ChannelError>;
}
