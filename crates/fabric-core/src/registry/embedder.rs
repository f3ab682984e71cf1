//! Optional semantic-search collaborator for the registries.
//!
//! Neither registry implements embedding itself -- a caller may supply an
//! [`Embedder`] collaborator (itself resolver-like: a thin trait backed by
//! whatever model client the host process wires up). Absent one, semantic
//! search falls back to a deterministic token-overlap score, which is
//! non-semantic but keeps the operation total rather than failing outright
//! (an Open Question resolved in the project's design notes).

/// Produces a fixed-size embedding vector for a piece of text.
pub trait Embedder: Send + Sync {
    fn embed(&self, text: &str) -> Vec<f32>;
}

/// Cosine similarity between two equal-length vectors. Returns 0.0 for
/// mismatched lengths or zero vectors rather than panicking.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

/// Deterministic, non-semantic fallback: fraction of query tokens that
/// appear (case-insensitively) in the candidate text.
pub fn substring_overlap_score(query: &str, candidate: &str) -> f32 {
    let query = query.to_lowercase();
    let candidate = candidate.to_lowercase();
    let tokens: Vec<&str> = query.split_whitespace().collect();
    if tokens.is_empty() {
        return 0.0;
    }
    let hits = tokens.iter().filter(|t| candidate.contains(*t)).count();
    hits as f32 / tokens.len() as f32
}
