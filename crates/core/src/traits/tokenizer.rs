//! Tokenizer trait

use crate::error::{Error, Result};
use std::collections::HashMap;

/// Tokenizer trait
///
/// This trait defines the interface that tokenizers must provide
/// to take part in preprocessing and metric computation.
pub trait TokenizerTrait: Send + Sync {
    /// Encode text to token IDs
    fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<u32>>;

    /// Decode token IDs to text
    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String>;

    /// Get vocabulary size
    fn vocab_size(&self) -> usize;

    /// Get the token for a given ID
    fn id_to_token(&self, id: u32) -> Option<String>;

    /// Get the ID for a given token
    fn token_to_id(&self, token: &str) -> Option<u32>;

    /// Id of the padding token
    fn pad_token_id(&self) -> u32;

    /// Encode with special tokens, shortening the text so the result fits in
    /// `max_len` ids. Tokenizers that add special tokens should keep them.
    fn encode_truncated(&self, text: &str, max_len: usize) -> Result<Vec<u32>> {
        let mut ids = self.encode(text, true)?;
        ids.truncate(max_len);
        Ok(ids)
    }

    /// Decode batch of token IDs
    fn decode_batch(&self, batch: &[Vec<u32>], skip_special_tokens: bool) -> Result<Vec<String>> {
        batch
            .iter()
            .map(|ids| self.decode(ids, skip_special_tokens))
            .collect()
    }
}

/// Whitespace tokenizer over a fixed vocabulary, for tests and tooling.
///
/// Id 0 is `<pad>`, id 1 is `<unk>`; unknown words encode to `<unk>`.
#[derive(Debug, Clone)]
pub struct WhitespaceTokenizer {
    vocab: HashMap<String, u32>,
    inverse: Vec<String>,
}

impl WhitespaceTokenizer {
    /// Padding token
    pub const PAD: &'static str = "<pad>";
    /// Unknown token
    pub const UNK: &'static str = "<unk>";

    /// Build from the words of a corpus, in order of first appearance
    pub fn from_corpus<'a>(texts: impl IntoIterator<Item = &'a str>) -> Self {
        let mut tokenizer = Self {
            vocab: HashMap::new(),
            inverse: Vec::new(),
        };
        tokenizer.insert(Self::PAD);
        tokenizer.insert(Self::UNK);
        for text in texts {
            for word in text.split_whitespace() {
                tokenizer.insert(word);
            }
        }
        tokenizer
    }

    fn insert(&mut self, word: &str) {
        if !self.vocab.contains_key(word) {
            self.vocab.insert(word.to_string(), self.inverse.len() as u32);
            self.inverse.push(word.to_string());
        }
    }

    fn is_special(&self, id: u32) -> bool {
        id <= 1
    }
}

impl TokenizerTrait for WhitespaceTokenizer {
    fn encode(&self, text: &str, _add_special_tokens: bool) -> Result<Vec<u32>> {
        Ok(text
            .split_whitespace()
            .map(|w| self.vocab.get(w).copied().unwrap_or(1))
            .collect())
    }

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
        let mut words = Vec::with_capacity(ids.len());
        for &id in ids {
            if skip_special_tokens && self.is_special(id) {
                continue;
            }
            let word = self
                .inverse
                .get(id as usize)
                .ok_or_else(|| Error::Tokenization(format!("id {} out of vocabulary", id)))?;
            words.push(word.as_str());
        }
        Ok(words.join(" "))
    }

    fn vocab_size(&self) -> usize {
        self.inverse.len()
    }

    fn id_to_token(&self, id: u32) -> Option<String> {
        self.inverse.get(id as usize).cloned()
    }

    fn token_to_id(&self, token: &str) -> Option<u32> {
        self.vocab.get(token).copied()
    }

    fn pad_token_id(&self) -> u32 {
        0
    }
}
