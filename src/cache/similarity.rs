//! Text similarity scoring for the semantic cache fallback
//!
//! Scores are in [0, 1]; a candidate becomes a semantic hit only when its
//! score strictly exceeds the configured threshold.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Available similarity algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SimilarityAlgorithm {
    /// Cosine over word-frequency vectors from whitespace tokenization
    Cosine,
    /// Jaccard over word sets
    Jaccard,
    /// Normalized Levenshtein: 1 − distance / max(len₁, len₂)
    Levenshtein,
}

impl Default for SimilarityAlgorithm {
    fn default() -> Self {
        SimilarityAlgorithm::Cosine
    }
}

/// Score two normalized prompts with the given algorithm
pub fn score(algorithm: SimilarityAlgorithm, a: &str, b: &str) -> f64 {
    match algorithm {
        SimilarityAlgorithm::Cosine => cosine(a, b),
        SimilarityAlgorithm::Jaccard => jaccard(a, b),
        SimilarityAlgorithm::Levenshtein => levenshtein_normalized(a, b),
    }
}

fn word_frequencies(text: &str) -> HashMap<&str, u32> {
    let mut frequencies = HashMap::new();
    for word in text.split_whitespace() {
        *frequencies.entry(word).or_insert(0) += 1;
    }
    frequencies
}

fn cosine(a: &str, b: &str) -> f64 {
    let fa = word_frequencies(a);
    let fb = word_frequencies(b);
    if fa.is_empty() || fb.is_empty() {
        return if fa.is_empty() && fb.is_empty() { 1.0 } else { 0.0 };
    }

    let dot: f64 = fa
        .iter()
        .filter_map(|(word, ca)| fb.get(word).map(|cb| (*ca as f64) * (*cb as f64)))
        .sum();
    let norm_a: f64 = fa.values().map(|c| (*c as f64).powi(2)).sum::<f64>().sqrt();
    let norm_b: f64 = fb.values().map(|c| (*c as f64).powi(2)).sum::<f64>().sqrt();

    dot / (norm_a * norm_b)
}

fn jaccard(a: &str, b: &str) -> f64 {
    let sa: HashSet<&str> = a.split_whitespace().collect();
    let sb: HashSet<&str> = b.split_whitespace().collect();
    if sa.is_empty() && sb.is_empty() {
        return 1.0;
    }

    let intersection = sa.intersection(&sb).count();
    let union = sa.union(&sb).count();
    intersection as f64 / union as f64
}

fn levenshtein_normalized(a: &str, b: &str) -> f64 {
    let ca: Vec<char> = a.chars().collect();
    let cb: Vec<char> = b.chars().collect();
    let max_len = ca.len().max(cb.len());
    if max_len == 0 {
        return 1.0;
    }

    1.0 - levenshtein(&ca, &cb) as f64 / max_len as f64
}

fn levenshtein(a: &[char], b: &[char]) -> usize {
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0usize; b.len() + 1];

    for (i, ch_a) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, ch_b) in b.iter().enumerate() {
            let substitution = previous[j] + usize::from(ch_a != ch_b);
            current[j + 1] = substitution.min(previous[j + 1] + 1).min(current[j] + 1);
        }
        std::mem::swap(&mut previous, &mut current);
    }

    previous[b.len()]
}
