//! Lexical prompt similarity
//!
//! Every metric returns a score in `[0.0, 1.0]` over already-normalized
//! prompts, 1.0 meaning identical.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Scores how alike two prompts are
pub trait SimilarityMetric: Send + Sync {
    fn name(&self) -> &'static str;

    fn similarity(&self, a: &str, b: &str) -> f64;
}

/// Built-in metrics, selectable from configuration
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SimilarityAlgorithm {
    #[default]
    Cosine,
    Jaccard,
    Levenshtein,
}

impl SimilarityAlgorithm {
    #[must_use]
    pub fn metric(self) -> Box<dyn SimilarityMetric> {
        match self {
            Self::Cosine => Box::new(Cosine),
            Self::Jaccard => Box::new(Jaccard),
            Self::Levenshtein => Box::new(Levenshtein),
        }
    }
}

impl FromStr for SimilarityAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cosine" => Ok(Self::Cosine),
            "jaccard" => Ok(Self::Jaccard),
            "levenshtein" | "edit" => Ok(Self::Levenshtein),
            other => Err(format!("unknown similarity algorithm '{other}'")),
        }
    }
}

impl fmt::Display for SimilarityAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Cosine => "cosine",
            Self::Jaccard => "jaccard",
            Self::Levenshtein => "levenshtein",
        })
    }
}

/// Cosine over term-frequency vectors
#[derive(Debug, Default, Clone, Copy)]
pub struct Cosine;

impl SimilarityMetric for Cosine {
    fn name(&self) -> &'static str {
        "cosine"
    }

    fn similarity(&self, a: &str, b: &str) -> f64 {
        if a == b {
            return 1.0;
        }
        let tf_a = term_frequencies(a);
        let tf_b = term_frequencies(b);
        if tf_a.is_empty() || tf_b.is_empty() {
            return 0.0;
        }

        let dot: f64 = tf_a
            .iter()
            .filter_map(|(term, &x)| tf_b.get(term).map(|&y| x * y))
            .sum();
        let norm_a = tf_a.values().map(|x| x * x).sum::<f64>().sqrt();
        let norm_b = tf_b.values().map(|y| y * y).sum::<f64>().sqrt();

        (dot / (norm_a * norm_b)).clamp(0.0, 1.0)
    }
}

fn term_frequencies(text: &str) -> HashMap<&str, f64> {
    let mut tf = HashMap::new();
    for term in text.split_whitespace() {
        *tf.entry(term).or_insert(0.0) += 1.0;
    }
    tf
}

/// Jaccard index over word sets
#[derive(Debug, Default, Clone, Copy)]
pub struct Jaccard;

impl SimilarityMetric for Jaccard {
    fn name(&self) -> &'static str {
        "jaccard"
    }

    fn similarity(&self, a: &str, b: &str) -> f64 {
        if a == b {
            return 1.0;
        }
        let set_a: HashSet<&str> = a.split_whitespace().collect();
        let set_b: HashSet<&str> = b.split_whitespace().collect();
        let union = set_a.union(&set_b).count();
        if union == 0 {
            return 0.0;
        }
        set_a.intersection(&set_b).count() as f64 / union as f64
    }
}

/// `1 - edit_distance / max_len` over characters
#[derive(Debug, Default, Clone, Copy)]
pub struct Levenshtein;

impl SimilarityMetric for Levenshtein {
    fn name(&self) -> &'static str {
        "levenshtein"
    }

    fn similarity(&self, a: &str, b: &str) -> f64 {
        if a == b {
            return 1.0;
        }
        let a: Vec<char> = a.chars().collect();
        let b: Vec<char> = b.chars().collect();
        let longest = a.len().max(b.len());
        if longest == 0 {
            return 1.0;
        }
        1.0 - edit_distance(&a, &b) as f64 / longest as f64
    }
}

fn edit_distance(a: &[char], b: &[char]) -> usize {
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = prev[j] + usize::from(ca != cb);
            curr[j + 1] = substitution.min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}
