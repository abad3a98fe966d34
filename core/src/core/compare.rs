//! Fuzzy response comparison.
//!
//! Full-body edit distance is slow and noisy (timestamps, CSRF tokens,
//! counters), so [`Metric::average_similarity`] first applies cheap length and
//! containment rules and only runs the metric on text that actually diverges.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::ComparisonError;

/// Length difference at which two bodies are assumed structurally different.
pub const LENGTH_DELTA_CUTOFF: usize = 100;

/// Length difference at or below which two bodies are accepted as equal.
pub const LENGTH_DELTA_EQUAL: usize = 1;

/// Upper bound on Levenshtein matrix cells after prefix/suffix stripping.
pub const MAX_EDIT_CELLS: usize = 25_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Metric {
    #[default]
    Levenshtein,
    Jaccard,
}

impl Metric {
    pub const ALL: [Metric; 2] = [Metric::Levenshtein, Metric::Jaccard];

    /// Direct similarity in `[0, 1]`. Inputs the metric refuses to score count
    /// as completely different.
    pub fn similarity(&self, a: &str, b: &str) -> f64 {
        self.try_similarity(a, b).unwrap_or(0.0)
    }

    pub fn try_similarity(&self, a: &str, b: &str) -> Result<f64, ComparisonError> {
        match self {
            Metric::Levenshtein => levenshtein_ratio(a, b),
            Metric::Jaccard => Ok(jaccard(a, b)),
        }
    }

    /// Similarity with the length, containment and payload-echo policies
    /// applied before the metric runs.
    ///
    /// `pocs` are the literal payloads injected into `a` and `b`; with
    /// `html_aware` set they are removed from the differing cores so a body
    /// that only echoes the payload back scores as identical.
    pub fn average_similarity(
        &self,
        a: &str,
        b: &str,
        pocs: Option<(&str, &str)>,
        html_aware: bool,
    ) -> Result<f64, ComparisonError> {
        let len_a = a.chars().count();
        let len_b = b.chars().count();
        let delta = len_a.abs_diff(len_b);

        if delta >= LENGTH_DELTA_CUTOFF {
            return Ok(0.0);
        }
        if delta <= LENGTH_DELTA_EQUAL {
            return Ok(1.0);
        }

        let (core_a, core_b) = upgrade_str(a, b);
        let (short, long, short_core) = if len_a <= len_b {
            (a, b, &core_a)
        } else {
            (b, a, &core_b)
        };
        if short_core.is_empty() && (long.starts_with(short) || long.ends_with(short)) {
            // containment with nothing diverging inside counts as different
            return Ok(0.0);
        }

        if html_aware {
            if let Some((poc_a, poc_b)) = pocs {
                let residue_a = strip_literal(&core_a, poc_a);
                let residue_b = strip_literal(&core_b, poc_b);
                if residue_a.is_empty() && residue_b.is_empty() {
                    return Ok(1.0);
                }
                return self.try_similarity(&residue_a, &residue_b);
            }
        }

        self.try_similarity(a, b)
    }
}

/// Scores a pair with every metric, in [`Metric::ALL`] order.
pub fn average_similarity_all(
    a: &str,
    b: &str,
    pocs: Option<(&str, &str)>,
    html_aware: bool,
) -> Vec<f64> {
    Metric::ALL
        .iter()
        .map(|m| m.average_similarity(a, b, pocs, html_aware).unwrap_or(0.0))
        .collect()
}

fn strip_literal(text: &str, literal: &str) -> String {
    if literal.is_empty() {
        text.to_string()
    } else {
        text.replace(literal, "")
    }
}

fn common_affixes(a: &[char], b: &[char]) -> (usize, usize) {
    let prefix = a.iter().zip(b).take_while(|(x, y)| x == y).count();
    let limit = a.len().min(b.len()) - prefix;
    let suffix = a
        .iter()
        .rev()
        .zip(b.iter().rev())
        .take(limit)
        .take_while(|(x, y)| x == y)
        .count();
    (prefix, suffix)
}

/// Strips the longest common prefix and suffix, returning the differing cores.
pub fn upgrade_str(a: &str, b: &str) -> (String, String) {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let (prefix, suffix) = common_affixes(&a, &b);
    (
        a[prefix..a.len() - suffix].iter().collect(),
        b[prefix..b.len() - suffix].iter().collect(),
    )
}

/// `1 - distance / max_len`. Common affixes do not change the distance, so
/// only the cores go through the matrix.
fn levenshtein_ratio(a: &str, b: &str) -> Result<f64, ComparisonError> {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let max_len = a.len().max(b.len());
    if max_len == 0 {
        return Ok(1.0);
    }

    let (prefix, suffix) = common_affixes(&a, &b);
    let core_a = &a[prefix..a.len() - suffix];
    let core_b = &b[prefix..b.len() - suffix];

    let cells = core_a.len().saturating_mul(core_b.len());
    if cells > MAX_EDIT_CELLS {
        return Err(ComparisonError::Oversized(cells));
    }

    let distance = edit_distance(core_a, core_b);
    Ok(1.0 - distance as f64 / max_len as f64)
}

fn edit_distance(a: &[char], b: &[char]) -> usize {
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

fn tokens(text: &str) -> HashSet<&str> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect()
}

fn jaccard(a: &str, b: &str) -> f64 {
    if a == b {
        return 1.0;
    }
    let ta = tokens(a);
    let tb = tokens(b);
    if ta.is_empty() && tb.is_empty() {
        // only punctuation/whitespace on both sides
        return if a.trim() == b.trim() { 1.0 } else { 0.0 };
    }
    let intersection = ta.intersection(&tb).count();
    let union = ta.union(&tb).count();
    intersection as f64 / union as f64
}

/// `0.8754` → `"87.54%"`.
pub fn format_percent(ratio: f64) -> String {
    format!("{:.2}%", ratio * 100.0)
}

/// `1234567` → `"1,234,567"`.
pub fn format_number(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}
