//! Identity matching against the face library.
//!
//! A person may have many enrolled samples; only their best sample counts.
//! Acceptance needs both an absolute similarity threshold and a margin over
//! the runner-up name, which keeps look-alikes from being merged.

use crate::config::MatchConfig;
use crate::types::{Candidate, Embedding, LibraryEntry, MatchResult};
use std::cmp::Ordering;
use std::collections::HashMap;

/// Slack on the margin comparison so a gap of exactly `margin` survives f32 rounding.
const MARGIN_TOLERANCE: f64 = 1e-6;

/// Strategy for comparing a probe embedding against the face library.
pub trait Matcher {
    fn compare(&self, probe: &Embedding, library: &[LibraryEntry]) -> MatchResult;
}

/// Cosine matcher with threshold + margin-over-runner-up acceptance.
#[derive(Debug, Clone)]
pub struct MarginMatcher {
    pub threshold: f32,
    pub margin: f32,
    /// Candidates reported for diagnostics.
    pub top_k: usize,
}

impl MarginMatcher {
    pub fn new(config: &MatchConfig) -> Self {
        Self {
            threshold: config.threshold,
            margin: config.margin,
            top_k: config.top_k,
        }
    }
}

impl Default for MarginMatcher {
    fn default() -> Self {
        Self::new(&MatchConfig::default())
    }
}

/// Best similarity per name, sorted descending (ties by name for stable output).
fn rank_names(probe: &Embedding, library: &[LibraryEntry]) -> Vec<Candidate> {
    let mut best: HashMap<&str, f32> = HashMap::new();

    // Every entry is scored; no early exit
    for entry in library {
        let sim = probe.similarity(&entry.embedding);
        if !sim.is_finite() {
            continue;
        }
        best.entry(entry.name.as_str())
            .and_modify(|s| *s = s.max(sim))
            .or_insert(sim);
    }

    let mut ranked: Vec<Candidate> = best
        .into_iter()
        .map(|(name, similarity)| Candidate {
            name: name.to_string(),
            similarity,
        })
        .collect();
    ranked.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.name.cmp(&b.name))
    });
    ranked
}

impl Matcher for MarginMatcher {
    fn compare(&self, probe: &Embedding, library: &[LibraryEntry]) -> MatchResult {
        let mut ranked = rank_names(probe, library);

        let Some(top) = ranked.first() else {
            return MatchResult::unknown();
        };

        let clears_threshold = top.similarity > self.threshold;
        let clears_margin = match ranked.get(1) {
            Some(second) => {
                f64::from(top.similarity) - f64::from(second.similarity) >= f64::from(self.margin) - MARGIN_TOLERANCE
            }
            None => true,
        };
        let accepted = clears_threshold && clears_margin;

        tracing::trace!(
            top = %top.name,
            similarity = top.similarity,
            runner_up = ranked.get(1).map(|c| c.similarity),
            accepted,
            "match ranked"
        );

        let name = accepted.then(|| top.name.clone());
        let similarity = top.similarity;
        ranked.truncate(self.top_k);

        MatchResult {
            name,
            similarity,
            accepted,
            candidates: ranked,
        }
    }
}
