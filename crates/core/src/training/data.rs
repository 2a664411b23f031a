//! Tokenized datasets and train/test splitting

use crate::data::table::Example;
use crate::error::{Error, Result};
use crate::traits::TokenizerTrait;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

/// Upper bound on prompt and label lengths, in tokens
pub const MAX_SEQUENCE_LENGTH: usize = 4096;

/// A prompt/summary pair after tokenization
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenizedExample {
    /// Prompt token ids
    pub input_ids: Vec<u32>,

    /// 1 for every prompt token
    pub attention_mask: Vec<u32>,

    /// Summary token ids
    pub labels: Vec<i64>,
}

impl TokenizedExample {
    /// Build an example with a full attention mask
    pub fn new(input_ids: Vec<u32>, labels: Vec<i64>) -> Self {
        let attention_mask = vec![1; input_ids.len()];
        Self {
            input_ids,
            attention_mask,
            labels,
        }
    }

    /// Tokenize a prompt and its target, truncating both at `max_len`
    pub fn encode(
        tokenizer: &dyn TokenizerTrait,
        prompt: &str,
        target: &str,
        max_len: usize,
    ) -> Result<Self> {
        let input_ids = tokenizer.encode_truncated(prompt, max_len)?;
        let labels = tokenizer
            .encode_truncated(target, max_len)?
            .into_iter()
            .map(i64::from)
            .collect();
        Ok(Self::new(input_ids, labels))
    }
}

/// Ordered collection of tokenized examples
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenizedDataset {
    examples: Vec<TokenizedExample>,
}

impl TokenizedDataset {
    /// Create a new empty dataset
    pub fn new() -> Self {
        Self::default()
    }

    /// Tokenize `(prompt, example)` pairs
    pub fn from_prompts<'a>(
        tokenizer: &dyn TokenizerTrait,
        rows: impl IntoIterator<Item = (&'a str, &'a Example)>,
        max_len: usize,
    ) -> Result<Self> {
        let examples = rows
            .into_iter()
            .map(|(prompt, example)| {
                TokenizedExample::encode(tokenizer, prompt, &example.reference_summary, max_len)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { examples })
    }

    /// Add an example to the dataset
    pub fn push(&mut self, example: TokenizedExample) {
        self.examples.push(example);
    }

    /// Examples in order
    pub fn examples(&self) -> &[TokenizedExample] {
        &self.examples
    }

    /// Get an example by index
    pub fn get(&self, index: usize) -> Option<&TokenizedExample> {
        self.examples.get(index)
    }

    /// Iterate over the examples
    pub fn iter(&self) -> std::slice::Iter<'_, TokenizedExample> {
        self.examples.iter()
    }

    /// Check if dataset is empty
    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    /// Get number of examples
    pub fn len(&self) -> usize {
        self.examples.len()
    }

    /// Split into train and test partitions.
    ///
    /// `ceil(test_size * len)` examples go to the test side, the rest to the
    /// train side; both sides must end up non-empty. Without a seed the
    /// permutation is drawn from the thread rng and is not reproducible.
    pub fn train_test_split(&self, test_size: f64, seed: Option<u64>) -> Result<DatasetSplit> {
        if test_size.is_nan() || test_size <= 0.0 || test_size >= 1.0 {
            return Err(Error::Validation(format!(
                "test_size must be in (0, 1), got {}",
                test_size
            )));
        }

        let n = self.examples.len();
        let n_test = (test_size * n as f64).ceil() as usize;
        let n_train = n.saturating_sub(n_test);
        if n_test == 0 || n_train == 0 {
            return Err(Error::Validation(format!(
                "With n_samples={} and test_size={}, the train or test split would be empty",
                n, test_size
            )));
        }

        let mut indices: Vec<usize> = (0..n).collect();
        match seed {
            Some(seed) => indices.shuffle(&mut StdRng::seed_from_u64(seed)),
            None => indices.shuffle(&mut rand::thread_rng()),
        }

        let pick = |ids: &[usize]| TokenizedDataset {
            examples: ids.iter().map(|&i| self.examples[i].clone()).collect(),
        };

        Ok(DatasetSplit {
            train: pick(&indices[n_test..]),
            test: pick(&indices[..n_test]),
        })
    }
}

impl FromIterator<TokenizedExample> for TokenizedDataset {
    fn from_iter<I: IntoIterator<Item = TokenizedExample>>(iter: I) -> Self {
        Self {
            examples: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a TokenizedDataset {
    type Item = &'a TokenizedExample;
    type IntoIter = std::slice::Iter<'a, TokenizedExample>;

    fn into_iter(self) -> Self::IntoIter {
        self.examples.iter()
    }
}

/// Train and test partitions
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DatasetSplit {
    /// Training partition
    pub train: TokenizedDataset,

    /// Held-out partition
    pub test: TokenizedDataset,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::WhitespaceTokenizer;

    fn dataset(n: usize) -> TokenizedDataset {
        (0..n)
            .map(|i| TokenizedExample::new(vec![i as u32 + 2], vec![i as i64 + 2]))
            .collect()
    }

    #[test]
    fn test_example_attention_mask() {
        let example = TokenizedExample::new(vec![4, 5, 6], vec![7]);
        assert_eq!(example.attention_mask, vec![1, 1, 1]);
    }

    #[test]
    fn test_encode_truncates() {
        let tokenizer = WhitespaceTokenizer::from_corpus(["a b c d e"]);
        let example = TokenizedExample::encode(&tokenizer, "a b c d e", "a b", 3).unwrap();
        assert_eq!(example.input_ids.len(), 3);
        assert_eq!(example.labels.len(), 2);
    }

    #[test]
    fn test_split_sizes() {
        let split = dataset(10).train_test_split(0.2, Some(42)).unwrap();
        assert_eq!(split.train.len(), 8);
        assert_eq!(split.test.len(), 2);

        let split = dataset(7).train_test_split(0.2, Some(42)).unwrap();
        assert_eq!(split.test.len(), 2);
        assert_eq!(split.train.len(), 5);
    }

    #[test]
    fn test_split_is_a_partition() {
        let data = dataset(10);
        let split = data.train_test_split(0.3, None).unwrap();

        let mut ids: Vec<u32> = split
            .train
            .iter()
            .chain(split.test.iter())
            .map(|e| e.input_ids[0])
            .collect();
        ids.sort();
        assert_eq!(ids, (2..12).collect::<Vec<u32>>());
    }

    #[test]
    fn test_split_seeded_is_reproducible() {
        let data = dataset(20);
        let a = data.train_test_split(0.2, Some(3)).unwrap();
        let b = data.train_test_split(0.2, Some(3)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_split_rejects_empty_sides() {
        assert!(dataset(1).train_test_split(0.2, None).is_err());
        assert!(dataset(0).train_test_split(0.2, None).is_err());
        assert!(dataset(10).train_test_split(0.0, None).is_err());
        assert!(dataset(10).train_test_split(1.0, None).is_err());
    }
}
