//! Mail Crew: customer-service reply pipeline with a human gate.

pub mod channels;
pub mod config;
pub mod error;
pub mod journal;
pub mod knowledge;
pub mod llm;
pub mod pipeline;
pub mod retry;
pub mod safety;
pub mod search;
pub mod store;
pub mod tracing_sink;
