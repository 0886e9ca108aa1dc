//! Derived quality metrics
//!
//! None of these are stored on a [`BenchmarkResult`]; they are computed on
//! demand from the generated texts, references and log-probabilities.

use std::collections::HashMap;

use crate::types::BenchmarkResult;

const MAX_NGRAM: usize = 4;

/// `exp(-mean(logprob))` over all tokens; `None` without tokens
pub fn perplexity(logprobs: &[f32]) -> Option<f64> {
    let finite: Vec<f64> = logprobs
        .iter()
        .copied()
        .filter(|lp| lp.is_finite())
        .map(f64::from)
        .collect();
    if finite.is_empty() {
        return None;
    }
    let mean = finite.iter().sum::<f64>() / finite.len() as f64;
    Some((-mean).exp())
}

fn words(text: &str) -> Vec<String> {
    text.split_whitespace().map(|w| w.to_lowercase()).collect()
}

fn ngram_counts(tokens: &[String], n: usize) -> HashMap<&[String], usize> {
    let mut counts = HashMap::new();
    if tokens.len() >= n {
        for gram in tokens.windows(n) {
            *counts.entry(gram).or_insert(0) += 1;
        }
    }
    counts
}

/// Sentence-level BLEU with up to 4-grams.
///
/// Unigram precision is unsmoothed; higher orders use add-one smoothing so a
/// short candidate without 4-gram matches does not collapse to zero. The
/// brevity penalty applies when the candidate is shorter than the reference.
pub fn bleu(candidate: &str, reference: &str) -> f64 {
    let cand = words(candidate);
    let refs = words(reference);
    if cand.is_empty() || refs.is_empty() {
        return 0.0;
    }

    let mut log_precision_sum = 0.0;
    for n in 1..=MAX_NGRAM {
        let cand_counts = ngram_counts(&cand, n);
        let ref_counts = ngram_counts(&refs, n);
        let total: usize = cand_counts.values().sum();
        let matched: usize = cand_counts
            .iter()
            .map(|(gram, count)| (*count).min(ref_counts.get(gram).copied().unwrap_or(0)))
            .sum();

        let precision = if n == 1 {
            if matched == 0 {
                return 0.0;
            }
            matched as f64 / total as f64
        } else {
            (matched as f64 + 1.0) / (total as f64 + 1.0)
        };
        log_precision_sum += precision.ln();
    }

    let c = cand.len() as f64;
    let r = refs.len() as f64;
    let brevity_penalty = if c >= r { 1.0 } else { (1.0 - r / c).exp() };

    (brevity_penalty * (log_precision_sum / MAX_NGRAM as f64).exp()).clamp(0.0, 1.0)
}

/// Candidate length over reference length, in words
pub fn length_ratio(candidate: &str, reference: &str) -> Option<f64> {
    let r = reference.split_whitespace().count();
    if r == 0 {
        return None;
    }
    Some(candidate.split_whitespace().count() as f64 / r as f64)
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values.fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    (count > 0).then(|| sum / count as f64)
}

impl BenchmarkResult {
    /// Perplexity over every saved token of every run
    pub fn perplexity(&self) -> Option<f64> {
        let all: Vec<f32> = self.logprobs.as_ref()?.iter().flatten().copied().collect();
        perplexity(&all)
    }

    /// Mean BLEU of the generated texts against the reference
    pub fn bleu_score(&self) -> Option<f64> {
        let reference = self.reference_text.as_deref()?;
        mean(self.generated_texts.iter().map(|t| bleu(t, reference)))
    }

    /// Mean response length relative to the reference
    pub fn length_ratio(&self) -> Option<f64> {
        let reference = self.reference_text.as_deref()?;
        mean(
            self.generated_texts
                .iter()
                .filter_map(|t| length_ratio(t, reference)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_perplexity_of_uniform_distribution() {
        let lp = (0.25f32).ln();
        let ppl = perplexity(&[lp, lp, lp]).unwrap();
        assert!((ppl - 4.0).abs() < 1e-4);
        assert!(perplexity(&[]).is_none());
        assert!(perplexity(&[f32::NEG_INFINITY]).is_none());
    }

    #[test]
    fn test_bleu_identical_is_one() {
        let s = "the quick brown fox jumps over the lazy dog";
        assert!((bleu(s, s) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_bleu_disjoint_is_zero() {
        assert_eq!(bleu("alpha beta", "gamma delta"), 0.0);
        assert_eq!(bleu("", "gamma"), 0.0);
    }

    #[test]
    fn test_bleu_penalizes_brevity() {
        let reference = "the cat sat on the mat today";
        let full = bleu("the cat sat on the mat today", reference);
        let short = bleu("the cat sat", reference);
        assert!(short > 0.0);
        assert!(short < full);
    }

    #[test]
    fn test_length_ratio() {
        assert_eq!(length_ratio("a b c d", "a b"), Some(2.0));
        assert_eq!(length_ratio("a", ""), None);
    }
}
