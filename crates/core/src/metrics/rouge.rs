//! ROUGE-N and ROUGE-L scoring

use rust_stemmers::{Algorithm, Stemmer};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use sumtune_utils::{alphanumeric_tokens, split_lines};

/// Supported ROUGE variants
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RougeType {
    /// Unigram overlap
    Rouge1,
    /// Bigram overlap
    Rouge2,
    /// Longest common subsequence over the whole text
    RougeL,
    /// Summary-level LCS over newline-separated sentences
    RougeLsum,
}

impl RougeType {
    /// All variants in reporting order
    pub const ALL: [RougeType; 4] = [
        RougeType::Rouge1,
        RougeType::Rouge2,
        RougeType::RougeL,
        RougeType::RougeLsum,
    ];

    /// Metric key
    pub fn name(&self) -> &'static str {
        match self {
            Self::Rouge1 => "rouge1",
            Self::Rouge2 => "rouge2",
            Self::RougeL => "rougeL",
            Self::RougeLsum => "rougeLsum",
        }
    }
}

impl fmt::Display for RougeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Precision, recall and F-measure of one comparison
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Score {
    /// Matched units over prediction units
    pub precision: f64,
    /// Matched units over reference units
    pub recall: f64,
    /// Harmonic mean of precision and recall
    pub fmeasure: f64,
}

impl Score {
    fn from_counts(hits: usize, prediction_len: usize, reference_len: usize) -> Self {
        let precision = hits as f64 / prediction_len.max(1) as f64;
        let recall = hits as f64 / reference_len.max(1) as f64;
        let fmeasure = if precision + recall > 0.0 {
            2.0 * precision * recall / (precision + recall)
        } else {
            0.0
        };
        Self {
            precision,
            recall,
            fmeasure,
        }
    }
}

/// ROUGE scorer.
///
/// Text is lowercased and split on anything that is not `[a-z0-9]`. With
/// stemming enabled, tokens longer than three characters are reduced with the
/// English Snowball stemmer.
pub struct RougeScorer {
    types: Vec<RougeType>,
    stemmer: Option<Stemmer>,
}

impl RougeScorer {
    /// Create a scorer for the given variants
    pub fn new(types: &[RougeType], use_stemmer: bool) -> Self {
        Self {
            types: types.to_vec(),
            stemmer: use_stemmer.then(|| Stemmer::create(Algorithm::English)),
        }
    }

    /// Variants this scorer reports
    pub fn types(&self) -> &[RougeType] {
        &self.types
    }

    /// Tokenize text the way every variant sees it
    pub fn tokenize(&self, text: &str) -> Vec<String> {
        alphanumeric_tokens(text)
            .into_iter()
            .map(|token| match &self.stemmer {
                Some(stemmer) if token.chars().count() > 3 => stemmer.stem(&token).into_owned(),
                _ => token,
            })
            .collect()
    }

    /// Score one prediction against one reference
    pub fn score(&self, prediction: &str, reference: &str) -> HashMap<RougeType, Score> {
        let pred_tokens = self.tokenize(prediction);
        let ref_tokens = self.tokenize(reference);

        self.types
            .iter()
            .map(|&ty| {
                let score = match ty {
                    RougeType::Rouge1 => rouge_n(&pred_tokens, &ref_tokens, 1),
                    RougeType::Rouge2 => rouge_n(&pred_tokens, &ref_tokens, 2),
                    RougeType::RougeL => rouge_l(&pred_tokens, &ref_tokens),
                    RougeType::RougeLsum => {
                        let pred_sents = self.sentences(prediction);
                        let ref_sents = self.sentences(reference);
                        rouge_lsum(&pred_sents, &ref_sents)
                    }
                };
                (ty, score)
            })
            .collect()
    }

    /// Mean F-measure per variant over aligned prediction/reference pairs
    pub fn mean_fmeasure(&self, predictions: &[String], references: &[String]) -> HashMap<RougeType, f64> {
        let mut totals: HashMap<RougeType, f64> = self.types.iter().map(|&t| (t, 0.0)).collect();
        let n = predictions.len().min(references.len());

        for (prediction, reference) in predictions.iter().zip(references) {
            for (ty, score) in self.score(prediction, reference) {
                *totals.entry(ty).or_insert(0.0) += score.fmeasure;
            }
        }

        if n > 0 {
            for value in totals.values_mut() {
                *value /= n as f64;
            }
        }
        totals
    }

    fn sentences(&self, text: &str) -> Vec<Vec<String>> {
        split_lines(text)
            .into_iter()
            .map(|line| self.tokenize(line))
            .collect()
    }
}

impl fmt::Debug for RougeScorer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RougeScorer")
            .field("types", &self.types)
            .field("use_stemmer", &self.stemmer.is_some())
            .finish()
    }
}

/// Extract n-gram counts
pub fn ngram_counts(tokens: &[String], n: usize) -> HashMap<&[String], usize> {
    let mut counts = HashMap::new();
    if n == 0 || tokens.len() < n {
        return counts;
    }
    for window in tokens.windows(n) {
        *counts.entry(window).or_insert(0) += 1;
    }
    counts
}

/// ROUGE-N over clipped n-gram counts
pub fn rouge_n(prediction: &[String], reference: &[String], n: usize) -> Score {
    let pred = ngram_counts(prediction, n);
    let refs = ngram_counts(reference, n);

    let hits: usize = refs
        .iter()
        .map(|(gram, &count)| count.min(pred.get(gram).copied().unwrap_or(0)))
        .sum();

    Score::from_counts(hits, pred.values().sum(), refs.values().sum())
}

/// ROUGE-L over whole token sequences
pub fn rouge_l(prediction: &[String], reference: &[String]) -> Score {
    if prediction.is_empty() || reference.is_empty() {
        return Score::default();
    }
    let lcs = lcs_table(reference, prediction)[reference.len()][prediction.len()];
    Score::from_counts(lcs, prediction.len(), reference.len())
}

/// Summary-level ROUGE-L: for every reference sentence, the union of its LCS
/// with each predicted sentence counts as hits, clipped by token frequencies.
pub fn rouge_lsum(prediction: &[Vec<String>], reference: &[Vec<String>]) -> Score {
    let m: usize = reference.iter().map(Vec::len).sum();
    let n: usize = prediction.iter().map(Vec::len).sum();
    if m == 0 || n == 0 {
        return Score::default();
    }

    let mut ref_counts: HashMap<&str, usize> = HashMap::new();
    let mut pred_counts: HashMap<&str, usize> = HashMap::new();
    for token in reference.iter().flatten() {
        *ref_counts.entry(token.as_str()).or_insert(0) += 1;
    }
    for token in prediction.iter().flatten() {
        *pred_counts.entry(token.as_str()).or_insert(0) += 1;
    }

    let mut hits = 0;
    for ref_sentence in reference {
        for token in union_lcs(ref_sentence, prediction) {
            let r = ref_counts.entry(token).or_insert(0);
            let p = pred_counts.entry(token).or_insert(0);
            if *r > 0 && *p > 0 {
                hits += 1;
                *r -= 1;
                *p -= 1;
            }
        }
    }

    Score::from_counts(hits, n, m)
}

fn union_lcs<'a>(reference: &'a [String], candidates: &[Vec<String>]) -> Vec<&'a str> {
    let mut indices: Vec<usize> = candidates
        .iter()
        .flat_map(|candidate| lcs_indices(reference, candidate))
        .collect();
    indices.sort_unstable();
    indices.dedup();
    indices.into_iter().map(|i| reference[i].as_str()).collect()
}

fn lcs_table(a: &[String], b: &[String]) -> Vec<Vec<usize>> {
    let mut table = vec![vec![0usize; b.len() + 1]; a.len() + 1];
    for i in 1..=a.len() {
        for j in 1..=b.len() {
            table[i][j] = if a[i - 1] == b[j - 1] {
                table[i - 1][j - 1] + 1
            } else {
                table[i - 1][j].max(table[i][j - 1])
            };
        }
    }
    table
}

/// Indices into `reference` of one longest common subsequence with `candidate`
fn lcs_indices(reference: &[String], candidate: &[String]) -> Vec<usize> {
    let table = lcs_table(reference, candidate);
    let (mut i, mut j) = (reference.len(), candidate.len());
    let mut indices = Vec::new();
    while i > 0 && j > 0 {
        if reference[i - 1] == candidate[j - 1] {
            indices.push(i - 1);
            i -= 1;
            j -= 1;
        } else if table[i][j - 1] > table[i - 1][j] {
            j -= 1;
        } else {
            i -= 1;
        }
    }
    indices.reverse();
    indices
}
