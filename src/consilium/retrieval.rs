//! Semantic retrieval over a pre-indexed corpus.
//!
//! The corpus and its vector index are external collaborators; the engine
//! embeds the question with the shared [`EmbedderService`] and asks the index
//! for the nearest snippets. Only provenance (count + source ids) enters the
//! analysis state — the snippet texts travel to the agent invoker through an
//! opaque shared handle and are never re-read by the core.
//!
//! Retrieval failure is non-fatal by design: any error yields an empty
//! context with a warning and the pipeline proceeds.

use crate::consilium::embedder::EmbedderService;
use crate::consilium::state::Query;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::error::Error;
use std::fmt;
use std::sync::Arc;

/// One retrieved corpus snippet.
#[derive(Debug, Clone, PartialEq)]
pub struct Snippet {
    /// Stable corpus/source id for provenance.
    pub source_id: String,
    pub text: String,
    /// Similarity to the query in `[0, 1]`.
    pub score: f32,
}

/// Error raised by the vector index.
#[derive(Debug, Clone)]
pub struct IndexError(pub String);

impl fmt::Display for IndexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vector index error: {}", self.0)
    }
}

impl Error for IndexError {}

/// A pre-built vector index over the document corpus.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Nearest snippets to `embedding`, at most `limit`, all scoring at or
    /// above `floor`.
    async fn search(
        &self,
        embedding: &[f32],
        limit: usize,
        floor: f32,
    ) -> Result<Vec<Snippet>, IndexError>;
}

/// Provenance record of the retrieval stage. The snippets themselves are
/// consumed only by the agent invoker.
#[derive(Debug, Clone, Default)]
pub struct RetrievalContext {
    pub snippet_count: usize,
    pub source_ids: BTreeSet<String>,
    /// Present when retrieval degraded and the context is empty or partial.
    pub warning: Option<String>,
}

/// The retrieval stage.
pub struct Retriever {
    index: Option<Arc<dyn VectorIndex>>,
    embedder: Arc<EmbedderService>,
    limit: usize,
    floor: f32,
}

impl Retriever {
    pub fn new(
        index: Option<Arc<dyn VectorIndex>>,
        embedder: Arc<EmbedderService>,
        limit: usize,
        floor: f32,
    ) -> Self {
        Self {
            index,
            embedder,
            limit,
            floor,
        }
    }

    /// Look up snippets for the query. Never fails: any error produces an
    /// empty context carrying the warning.
    pub async fn retrieve(&self, query: &Query) -> (RetrievalContext, Arc<Vec<Snippet>>) {
        let index = match &self.index {
            Some(index) => Arc::clone(index),
            None => {
                return (
                    RetrievalContext {
                        warning: Some("no vector index configured".to_string()),
                        ..Default::default()
                    },
                    Arc::new(Vec::new()),
                )
            }
        };

        let texts = vec![query.question.clone()];
        let embedding = match self.embedder.embed(&texts).await {
            Ok(mut vectors) if !vectors.is_empty() => vectors.remove(0),
            Ok(_) => {
                return degraded("embedder returned no vector for the query");
            }
            Err(e) => {
                return degraded(&format!("query embedding failed: {}", e));
            }
        };

        match index.search(&embedding, self.limit, self.floor).await {
            Ok(snippets) => {
                let source_ids: BTreeSet<String> =
                    snippets.iter().map(|s| s.source_id.clone()).collect();
                let context = RetrievalContext {
                    snippet_count: snippets.len(),
                    source_ids,
                    warning: None,
                };
                (context, Arc::new(snippets))
            }
            Err(e) => degraded(&format!("index search failed: {}", e)),
        }
    }
}

fn degraded(warning: &str) -> (RetrievalContext, Arc<Vec<Snippet>>) {
    log::warn!("retrieval degraded: {}", warning);
    (
        RetrievalContext {
            snippet_count: 0,
            source_ids: BTreeSet::new(),
            warning: Some(warning.to_string()),
        },
        Arc::new(Vec::new()),
    )
}
