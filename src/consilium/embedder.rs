//! Shared embedding service.
//!
//! The embedder is the one process-wide collaborator several stages share:
//! retrieval embeds the query, the debate orchestrator scores consensus
//! similarity, and the synthesizer clusters recommendations. It is wrapped in
//! an explicit [`EmbedderService`] with an idempotent, single-flight warm-up
//! instead of a module-level global, and injected into the stages that need
//! it. When no embedder is configured (or warm-up keeps failing) callers fall
//! back to the lexical [`jaccard_similarity`] measure.

use async_trait::async_trait;
use std::collections::HashSet;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use tokio::sync::OnceCell;

/// Errors surfaced by the embedding layer.
#[derive(Debug, Clone)]
pub enum EmbedderError {
    /// No embedder was configured on the engine.
    Unavailable,
    /// The underlying model failed to initialise or embed.
    Backend(String),
}

impl fmt::Display for EmbedderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmbedderError::Unavailable => write!(f, "no embedder configured"),
            EmbedderError::Backend(msg) => write!(f, "embedder backend error: {}", msg),
        }
    }
}

impl Error for EmbedderError {}

/// External embedding model.
///
/// Implementations may suspend on network or model I/O. The engine only ever
/// talks to the model through [`EmbedderService`], so implementations do not
/// need their own warm-up or synchronization.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a batch of texts, one vector per input, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedderError>;

    /// Dimensionality of the produced vectors.
    fn dimension(&self) -> usize;

    /// Identifier for logs.
    fn model_name(&self) -> &str;
}

/// Process-wide embedding service with lazy, single-flight warm-up.
///
/// The first caller triggers the warm-up probe; concurrent callers await the
/// same in-flight initialisation rather than racing their own. A failed
/// warm-up leaves the cell empty so the next call retries.
pub struct EmbedderService {
    inner: Option<Arc<dyn Embedder>>,
    warmed: OnceCell<()>,
}

impl EmbedderService {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            inner: Some(embedder),
            warmed: OnceCell::new(),
        }
    }

    /// A service with no backing model; every call degrades to the lexical
    /// fallback path.
    pub fn disabled() -> Self {
        Self {
            inner: None,
            warmed: OnceCell::new(),
        }
    }

    /// Whether a backing model is configured at all.
    pub fn is_available(&self) -> bool {
        self.inner.is_some()
    }

    /// Idempotent warm-up. Embeds a single probe text so the first real
    /// request does not pay the model's cold-start latency.
    pub async fn warm(&self) -> Result<(), EmbedderError> {
        let embedder = match &self.inner {
            Some(e) => Arc::clone(e),
            None => return Err(EmbedderError::Unavailable),
        };
        self.warmed
            .get_or_try_init(|| async move {
                let probe = vec!["warm-up probe".to_string()];
                embedder.embed(&probe).await.map(|_| ())
            })
            .await
            .map(|_| ())
    }

    /// Embed a batch, warming first if necessary.
    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedderError> {
        self.warm().await?;
        match &self.inner {
            Some(e) => e.embed(texts).await,
            None => Err(EmbedderError::Unavailable),
        }
    }

    /// Semantic similarity of two texts in `[0, 1]`, or `None` when the
    /// embedder is unavailable and the caller should use its lexical
    /// fallback.
    pub async fn similarity(&self, a: &str, b: &str) -> Option<f32> {
        let texts = vec![a.to_string(), b.to_string()];
        match self.embed(&texts).await {
            Ok(vectors) if vectors.len() == 2 => {
                Some(normalized_cosine(&vectors[0], &vectors[1]))
            }
            Ok(_) => None,
            Err(e) => {
                log::debug!("similarity fell back to lexical: {}", e);
                None
            }
        }
    }
}

/// Cosine similarity mapped onto `[0, 1]` (0.5 = orthogonal). Zero-length or
/// mismatched vectors score 0.
pub fn normalized_cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for i in 0..a.len() {
        dot += a[i] * b[i];
        norm_a += a[i] * a[i];
        norm_b += b[i] * b[i];
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    let cosine = dot / (norm_a.sqrt() * norm_b.sqrt());
    (cosine + 1.0) / 2.0
}

/// Jaccard similarity between two texts based on word sets.
///
/// The lexical fallback when no embedder is available. Tokenization: lowercase,
/// drop words of three characters or fewer after trimming non-alphanumerics.
pub fn jaccard_similarity(text1: &str, text2: &str) -> f32 {
    let words1 = word_set(text1);
    let words2 = word_set(text2);

    if words1.is_empty() && words2.is_empty() {
        return 1.0;
    }
    if words1.is_empty() || words2.is_empty() {
        return 0.0;
    }

    let intersection_size = words1.intersection(&words2).count();
    let union_size = words1.union(&words2).count();

    intersection_size as f32 / union_size as f32
}

fn word_set(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split_whitespace()
        .filter(|w| w.len() > 2)
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_string())
        .filter(|w| !w.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Deterministic toy embedder: counts character histogram buckets.
    pub struct HashEmbedder {
        pub calls: AtomicUsize,
    }

    impl HashEmbedder {
        pub fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Embedder for HashEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(texts
                .iter()
                .map(|t| {
                    let mut v = vec![0.0f32; 16];
                    for b in t.to_lowercase().bytes() {
                        v[(b % 16) as usize] += 1.0;
                    }
                    v
                })
                .collect())
        }

        fn dimension(&self) -> usize {
            16
        }

        fn model_name(&self) -> &str {
            "hash-test"
        }
    }

    #[tokio::test]
    async fn warm_is_single_flight_and_idempotent() {
        let embedder = Arc::new(HashEmbedder::new());
        let service = Arc::new(EmbedderService::new(embedder.clone()));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let service = Arc::clone(&service);
            handles.push(tokio::spawn(async move { service.warm().await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        // One probe call no matter how many concurrent warmers raced.
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 1);

        service.warm().await.unwrap();
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn disabled_service_reports_unavailable() {
        let service = EmbedderService::disabled();
        assert!(!service.is_available());
        assert!(service.similarity("a", "b").await.is_none());
    }

    #[test]
    fn identical_vectors_score_one() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((normalized_cosine(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn opposite_vectors_score_zero() {
        let a = vec![1.0, 0.0];
        let b = vec![-1.0, 0.0];
        assert!(normalized_cosine(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn jaccard_handles_empty_and_partial_overlap() {
        assert!((jaccard_similarity("", "") - 1.0).abs() < f32::EPSILON);
        assert_eq!(jaccard_similarity("hello world", ""), 0.0);
        let s = jaccard_similarity(
            "raise the participation rate",
            "raise the participation rate",
        );
        assert!((s - 1.0).abs() < f32::EPSILON);
        let partial = jaccard_similarity("increase sector investment", "decrease sector spending");
        assert!(partial > 0.0 && partial < 1.0);
    }
}
