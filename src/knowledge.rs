//! Knowledge base used by the retriever.
//!
//! The in-memory implementation ranks documents by how many query terms they
//! contain. Documents are loaded from a directory of `*.txt` files.

use std::collections::HashSet;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{ConfigError, StepError};

/// A ranked hit. `score` is in [0, 1].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredSnippet {
    pub text: String,
    pub score: f32,
    pub source: String,
}

#[async_trait]
pub trait KnowledgeBase: Send + Sync {
    /// Best `k` snippets for `query`, highest score first.
    async fn search(&self, query: &str, k: usize) -> Result<Vec<ScoredSnippet>, StepError>;
}

#[derive(Debug, Clone)]
struct Document {
    source: String,
    text: String,
    terms: HashSet<String>,
}

/// Term-overlap ranking over documents held in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryKnowledgeBase {
    documents: Vec<Document>,
}

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "with", "that", "this", "from", "you", "your", "are", "was", "have",
    "les", "des", "une", "est", "pour", "que", "qui", "dans", "par", "sur", "pas", "vous", "nous",
];

fn terms(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() >= 3)
        .map(str::to_lowercase)
        .filter(|w| !STOPWORDS.contains(&w.as_str()))
        .collect()
}

impl InMemoryKnowledgeBase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_document(mut self, source: impl Into<String>, text: impl Into<String>) -> Self {
        self.add_document(source, text);
        self
    }

    pub fn add_document(&mut self, source: impl Into<String>, text: impl Into<String>) {
        let text = text.into();
        self.documents.push(Document {
            source: source.into(),
            terms: terms(&text),
            text,
        });
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Sources of every loaded document, in load order.
    pub fn sources(&self) -> Vec<&str> {
        self.documents.iter().map(|d| d.source.as_str()).collect()
    }

    /// Load every `*.txt` file directly under `dir`, sorted by file name.
    pub async fn ingest_dir(dir: &Path) -> Result<Self, ConfigError> {
        let mut entries = tokio::fs::read_dir(dir).await?;
        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "txt") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut kb = Self::new();
        for path in paths {
            let bytes = tokio::fs::read(&path).await?;
            let text = String::from_utf8_lossy(&bytes).into_owned();
            if text.trim().is_empty() {
                warn!(path = %path.display(), "Skipping empty knowledge file");
                continue;
            }
            let source = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            kb.add_document(source, text);
        }

        info!(dir = %dir.display(), documents = kb.len(), "Loaded knowledge base");
        Ok(kb)
    }
}

#[async_trait]
impl KnowledgeBase for InMemoryKnowledgeBase {
    async fn search(&self, query: &str, k: usize) -> Result<Vec<ScoredSnippet>, StepError> {
        let query_terms = terms(query);
        if query_terms.is_empty() || k == 0 {
            return Ok(Vec::new());
        }

        let mut hits: Vec<ScoredSnippet> = self
            .documents
            .iter()
            .filter_map(|doc| {
                let overlap = query_terms.intersection(&doc.terms).count();
                (overlap > 0).then(|| ScoredSnippet {
                    text: doc.text.clone(),
                    score: overlap as f32 / query_terms.len() as f32,
                    source: doc.source.clone(),
                })
            })
            .collect();

        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(k);
        debug!(query_terms = query_terms.len(), hits = hits.len(), "Knowledge search");
        Ok(hits)
    }
}
