//! Evaluation metrics over generated token ids

use crate::error::{Error, Result};
use crate::metrics::rouge::{RougeScorer, RougeType};
use crate::traits::TokenizerTrait;
use std::collections::BTreeMap;

/// Label value that marks positions excluded from the loss
pub const IGNORE_INDEX: i64 = -100;

/// Key of the mean generated length
pub const GEN_LEN: &str = "gen_len";

/// Round to four decimals
pub fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

/// Replace ignored label positions with `pad_id` and convert to token ids
pub fn restore_labels(labels: &[Vec<i64>], pad_id: u32) -> Result<Vec<Vec<u32>>> {
    labels
        .iter()
        .map(|row| {
            row.iter()
                .map(|&id| {
                    if id == IGNORE_INDEX {
                        Ok(pad_id)
                    } else {
                        u32::try_from(id)
                            .map_err(|_| Error::Metrics(format!("invalid label id {}", id)))
                    }
                })
                .collect()
        })
        .collect()
}

/// Mean number of non-padding ids per prediction
pub fn mean_generated_length(predictions: &[Vec<u32>], pad_id: u32) -> f64 {
    if predictions.is_empty() {
        return 0.0;
    }
    let total: usize = predictions
        .iter()
        .map(|p| p.iter().filter(|&&id| id != pad_id).count())
        .sum();
    total as f64 / predictions.len() as f64
}

/// Summarization metrics for generated predictions.
///
/// Predictions and labels are decoded without special tokens, labels have
/// their ignored positions restored to padding first. Returns `rouge1`,
/// `rouge2`, `rougeL`, `rougeLsum` (mean F-measure, stemmed) and `gen_len`,
/// each rounded to four decimals.
pub fn compute_summarization_metrics(
    tokenizer: &dyn TokenizerTrait,
    predictions: &[Vec<u32>],
    labels: &[Vec<i64>],
) -> Result<BTreeMap<String, f64>> {
    if predictions.len() != labels.len() {
        return Err(Error::Metrics(format!(
            "{} predictions but {} labels",
            predictions.len(),
            labels.len()
        )));
    }

    let pad_id = tokenizer.pad_token_id();
    let decoded_preds = tokenizer.decode_batch(predictions, true)?;
    let decoded_labels = tokenizer.decode_batch(&restore_labels(labels, pad_id)?, true)?;

    let scorer = RougeScorer::new(&RougeType::ALL, true);
    let mut result: BTreeMap<String, f64> = scorer
        .mean_fmeasure(&decoded_preds, &decoded_labels)
        .into_iter()
        .map(|(ty, value)| (ty.name().to_string(), value))
        .collect();
    result.insert(GEN_LEN.to_string(), mean_generated_length(predictions, pad_id));

    Ok(result.into_iter().map(|(k, v)| (k, round4(v))).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::WhitespaceTokenizer;

    fn tokenizer() -> WhitespaceTokenizer {
        WhitespaceTokenizer::from_corpus(["wind power grew fast in norway this year"])
    }

    #[test]
    fn test_round4() {
        assert_eq!(round4(0.123456), 0.1235);
        assert_eq!(round4(2.0), 2.0);
    }

    #[test]
    fn test_restore_labels() {
        let restored = restore_labels(&[vec![5, -100, -100]], 0).unwrap();
        assert_eq!(restored, vec![vec![5, 0, 0]]);
        assert!(restore_labels(&[vec![-3]], 0).is_err());
    }

    #[test]
    fn test_identical_predictions_score_one() {
        let tok = tokenizer();
        let ids = tok.encode("wind power grew fast", false).unwrap();
        let labels: Vec<i64> = ids.iter().map(|&i| i as i64).collect();

        let metrics =
            compute_summarization_metrics(&tok, &[ids.clone(), ids.clone()], &[labels.clone(), labels])
                .unwrap();

        for key in ["rouge1", "rouge2", "rougeL", "rougeLsum"] {
            assert_eq!(metrics[key], 1.0, "{}", key);
        }
        assert_eq!(metrics[GEN_LEN], 4.0);
    }

    #[test]
    fn test_ignored_labels_are_padding() {
        let tok = tokenizer();
        let ids = tok.encode("power grew", false).unwrap();
        let mut labels: Vec<i64> = ids.iter().map(|&i| i as i64).collect();
        labels.extend([IGNORE_INDEX, IGNORE_INDEX]);
        let mut prediction = ids.clone();
        prediction.push(0);

        let metrics = compute_summarization_metrics(&tok, &[prediction], &[labels]).unwrap();
        assert_eq!(metrics["rouge1"], 1.0);
        assert_eq!(metrics[GEN_LEN], 2.0);
    }

    #[test]
    fn test_length_mismatch() {
        let tok = tokenizer();
        assert!(compute_summarization_metrics(&tok, &[vec![2]], &[]).is_err());
    }
}
