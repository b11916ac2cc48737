// Corpus-level text similarity between generated and reference answers
//
// BLEU-1..4 (cumulative, uniform weights, brevity penalty), ROUGE-L F-measure
// and Jaccard word overlap. Word-level, lowercase, punctuation stripped.

use std::collections::{BTreeMap, HashMap, HashSet};

pub const METRIC_NAMES: [&str; 6] = ["bleu_1", "bleu_2", "bleu_3", "bleu_4", "rouge_l", "jaccard"];

/// Normalize text into words
fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()))
        .filter(|w| !w.is_empty())
        .map(String::from)
        .collect()
}

fn ngram_counts(words: &[String], n: usize) -> HashMap<&[String], usize> {
    let mut counts = HashMap::new();
    if words.len() >= n {
        for gram in words.windows(n) {
            *counts.entry(gram).or_insert(0) += 1;
        }
    }
    counts
}

/// Jaccard similarity: |A ∩ B| / |A ∪ B| over word sets (two empty texts are identical)
pub fn jaccard(text1: &str, text2: &str) -> f64 {
    let words1: HashSet<String> = tokenize(text1).into_iter().collect();
    let words2: HashSet<String> = tokenize(text2).into_iter().collect();

    if words1.is_empty() && words2.is_empty() {
        return 1.0;
    }

    let intersection = words1.intersection(&words2).count();
    let union = words1.union(&words2).count();
    intersection as f64 / union as f64
}

fn lcs_len(a: &[String], b: &[String]) -> usize {
    let mut prev = vec![0usize; b.len() + 1];
    for x in a {
        let mut cur = vec![0usize; b.len() + 1];
        for (j, y) in b.iter().enumerate() {
            cur[j + 1] = if x == y {
                prev[j] + 1
            } else {
                cur[j].max(prev[j + 1])
            };
        }
        prev = cur;
    }
    prev[b.len()]
}

/// ROUGE-L F1 for one pair
pub fn rouge_l(candidate: &str, reference: &str) -> f64 {
    let cand = tokenize(candidate);
    let refr = tokenize(reference);
    if cand.is_empty() || refr.is_empty() {
        return 0.0;
    }
    let lcs = lcs_len(&cand, &refr) as f64;
    if lcs == 0.0 {
        return 0.0;
    }
    let precision = lcs / cand.len() as f64;
    let recall = lcs / refr.len() as f64;
    2.0 * precision * recall / (precision + recall)
}

#[derive(Debug, Default, Clone)]
pub struct MetricCalculator;

impl MetricCalculator {
    pub fn new() -> Self {
        Self
    }

    /// Score `predictions` against `references` pairwise; empty input gives zeros
    pub fn compute(&self, predictions: &[String], references: &[String]) -> BTreeMap<String, f64> {
        let mut scores: BTreeMap<String, f64> =
            METRIC_NAMES.iter().map(|name| (name.to_string(), 0.0)).collect();

        let pairs = predictions.len().min(references.len());
        if predictions.len() != references.len() {
            tracing::warn!(
                predictions = predictions.len(),
                references = references.len(),
                "Prediction/reference count mismatch; scoring the common prefix"
            );
        }
        if pairs == 0 {
            return scores;
        }

        let cands: Vec<Vec<String>> = predictions[..pairs].iter().map(|p| tokenize(p)).collect();
        let refs: Vec<Vec<String>> = references[..pairs].iter().map(|r| tokenize(r)).collect();

        for (n, score) in corpus_bleu(&cands, &refs).into_iter().enumerate() {
            scores.insert(format!("bleu_{}", n + 1), score);
        }

        let rouge: f64 = predictions[..pairs]
            .iter()
            .zip(&references[..pairs])
            .map(|(p, r)| rouge_l(p, r))
            .sum();
        scores.insert("rouge_l".to_string(), rouge / pairs as f64);

        let overlap: f64 = predictions[..pairs]
            .iter()
            .zip(&references[..pairs])
            .map(|(p, r)| jaccard(p, r))
            .sum();
        scores.insert("jaccard".to_string(), overlap / pairs as f64);

        scores
    }
}

/// Cumulative corpus BLEU-1..4
fn corpus_bleu(cands: &[Vec<String>], refs: &[Vec<String>]) -> [f64; 4] {
    let mut matches = [0usize; 4];
    let mut totals = [0usize; 4];
    let (mut cand_len, mut ref_len) = (0usize, 0usize);

    for (cand, refr) in cands.iter().zip(refs) {
        cand_len += cand.len();
        ref_len += refr.len();
        for n in 1..=4 {
            let cand_counts = ngram_counts(cand, n);
            let ref_counts = ngram_counts(refr, n);
            // Clipped counts
            matches[n - 1] += cand_counts
                .iter()
                .map(|(gram, &c)| c.min(ref_counts.get(gram).copied().unwrap_or(0)))
                .sum::<usize>();
            totals[n - 1] += cand.len().saturating_sub(n - 1);
        }
    }

    if cand_len == 0 {
        return [0.0; 4];
    }
    let brevity = if cand_len >= ref_len {
        1.0
    } else {
        (1.0 - ref_len as f64 / cand_len as f64).exp()
    };

    let mut out = [0.0; 4];
    let mut log_sum = 0.0;
    for n in 0..4 {
        if matches[n] == 0 || totals[n] == 0 {
            // Every higher order is zero too
            break;
        }
        log_sum += (matches[n] as f64 / totals[n] as f64).ln();
        out[n] = brevity * (log_sum / (n + 1) as f64).exp();
    }
    out
}
