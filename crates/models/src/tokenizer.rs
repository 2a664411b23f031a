//! Tokenizer integration using the tokenizers crate

use std::path::Path;
use std::sync::Arc;
use sumtune_core::error::{Error, Result};
use sumtune_core::traits::tokenizer::TokenizerTrait;
use tokenizers::{PostProcessor, Tokenizer as HFTokenizer, TruncationDirection};

/// Tokenizer file inside a model directory
pub const TOKENIZER_FILE: &str = "tokenizer.json";

const PAD_CANDIDATES: [&str; 3] = ["<pad>", "[PAD]", "<|pad|>"];

/// Hugging Face tokenizer wrapper
#[derive(Clone, Debug)]
pub struct HFTokenizerWrapper {
    inner: Arc<HFTokenizer>,
    pad_id: u32,
}

impl HFTokenizerWrapper {
    /// Wrap a tokenizer, resolving its padding token.
    ///
    /// The padding id comes from the tokenizer's padding settings, then from a
    /// well-known pad token in the vocabulary, then from `fallback_pad_id`.
    pub fn new(tokenizer: HFTokenizer, fallback_pad_id: Option<u32>) -> Result<Self> {
        let pad_id = tokenizer
            .get_padding()
            .map(|p| p.pad_id)
            .or_else(|| PAD_CANDIDATES.iter().find_map(|t| tokenizer.token_to_id(t)))
            .or(fallback_pad_id)
            .ok_or_else(|| Error::Tokenization("tokenizer has no padding token".to_string()))?;

        Ok(Self {
            inner: Arc::new(tokenizer),
            pad_id,
        })
    }

    /// Load a `tokenizer.json` file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let tokenizer = HFTokenizer::from_file(path).map_err(|e| {
            Error::Tokenization(format!("Failed to load tokenizer from {}: {}", path.display(), e))
        })?;
        Self::new(tokenizer, None)
    }

    /// Load from the bytes of a `tokenizer.json`
    pub fn from_bytes(bytes: impl AsRef<[u8]>) -> Result<Self> {
        let tokenizer = HFTokenizer::from_bytes(bytes)
            .map_err(|e| Error::Tokenization(format!("Failed to parse tokenizer: {}", e)))?;
        Self::new(tokenizer, None)
    }

    /// Load from a local model directory or download from the hub
    pub fn from_pretrained(identifier: &str, token: Option<String>) -> Result<Self> {
        let local = Path::new(identifier);
        if local.is_dir() {
            return Self::from_file(local.join(TOKENIZER_FILE));
        }

        let api = hf_hub::api::sync::ApiBuilder::new()
            .with_token(token)
            .build()
            .map_err(|e| Error::Tokenization(format!("Failed to create HF API: {}", e)))?;
        let path = api
            .model(identifier.to_string())
            .get(TOKENIZER_FILE)
            .map_err(|e| {
                Error::Tokenization(format!("Failed to get tokenizer for {}: {}", identifier, e))
            })?;
        Self::from_file(path)
    }

    /// Write `tokenizer.json` into `dir`
    pub fn save_pretrained(&self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        self.inner
            .save(dir.join(TOKENIZER_FILE), true)
            .map_err(|e| Error::Tokenization(format!("Failed to save tokenizer: {}", e)))?;
        Ok(())
    }

    /// Get the underlying tokenizer
    pub fn inner(&self) -> &HFTokenizer {
        &self.inner
    }
}

impl TokenizerTrait for HFTokenizerWrapper {
    fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, add_special_tokens)
            .map_err(|e| Error::Tokenization(format!("Encoding failed: {}", e)))?;

        Ok(encoding.get_ids().to_vec())
    }

    fn encode_truncated(&self, text: &str, max_len: usize) -> Result<Vec<u32>> {
        let added = self
            .inner
            .get_post_processor()
            .map_or(0, |p| p.added_tokens(false));
        let mut encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| Error::Tokenization(format!("Encoding failed: {}", e)))?;
        encoding.truncate(max_len.saturating_sub(added), 0, TruncationDirection::Right);

        let encoding = self
            .inner
            .post_process(encoding, None, true)
            .map_err(|e| Error::Tokenization(format!("Post-processing failed: {}", e)))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
        self.inner
            .decode(ids, skip_special_tokens)
            .map_err(|e| Error::Tokenization(format!("Decoding failed: {}", e)))
    }

    fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    fn id_to_token(&self, id: u32) -> Option<String> {
        self.inner.id_to_token(id)
    }

    fn token_to_id(&self, token: &str) -> Option<u32> {
        self.inner.token_to_id(token)
    }

    fn pad_token_id(&self) -> u32 {
        self.pad_id
    }
}

/// Minimal word-level `tokenizer.json` with BART-style special tokens
/// (`<s>`=0, `<pad>`=1, `</s>`=2, `<unk>`=3) followed by `words`.
///
/// Encoding wraps the text in `<s> ... </s>`. Useful for tests and smoke runs.
pub fn word_level_tokenizer_json(words: &[&str]) -> String {
    let specials = ["<s>", "<pad>", "</s>", "<unk>"];
    let mut vocab = serde_json::Map::new();
    for (i, token) in specials.iter().chain(words.iter()).enumerate() {
        vocab.entry(token.to_string()).or_insert(serde_json::json!(i));
    }
    let added_tokens: Vec<serde_json::Value> = specials
        .iter()
        .enumerate()
        .map(|(id, content)| {
            serde_json::json!({
                "id": id,
                "content": content,
                "single_word": false,
                "lstrip": false,
                "rstrip": false,
                "normalized": false,
                "special": true
            })
        })
        .collect();

    serde_json::json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": added_tokens,
        "normalizer": null,
        "pre_tokenizer": { "type": "Whitespace" },
        "post_processor": {
            "type": "TemplateProcessing",
            "single": [
                { "SpecialToken": { "id": "<s>", "type_id": 0 } },
                { "Sequence": { "id": "A", "type_id": 0 } },
                { "SpecialToken": { "id": "</s>", "type_id": 0 } }
            ],
            "pair": [
                { "SpecialToken": { "id": "<s>", "type_id": 0 } },
                { "Sequence": { "id": "A", "type_id": 0 } },
                { "SpecialToken": { "id": "</s>", "type_id": 0 } },
                { "Sequence": { "id": "B", "type_id": 1 } },
                { "SpecialToken": { "id": "</s>", "type_id": 1 } }
            ],
            "special_tokens": {
                "<s>": { "id": "<s>", "ids": [0], "tokens": ["<s>"] },
                "</s>": { "id": "</s>", "ids": [2], "tokens": ["</s>"] }
            }
        },
        "decoder": null,
        "model": {
            "type": "WordLevel",
            "vocab": vocab,
            "unk_token": "<unk>"
        }
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokenizer() -> HFTokenizerWrapper {
        HFTokenizerWrapper::from_bytes(word_level_tokenizer_json(&["wind", "power", "grew"])).unwrap()
    }

    #[test]
    fn test_tokenizer_wrapper_send_sync() {
        fn is_send_sync<T: Send + Sync>() {}
        is_send_sync::<HFTokenizerWrapper>();
    }

    #[test]
    fn test_encode_adds_special_tokens() {
        let tok = tokenizer();
        assert_eq!(tok.encode("wind power", true).unwrap(), vec![0, 4, 5, 2]);
        assert_eq!(tok.encode("wind power", false).unwrap(), vec![4, 5]);
        assert_eq!(tok.encode("solar", false).unwrap(), vec![3]);
    }

    #[test]
    fn test_truncation_keeps_special_tokens() {
        let tok = tokenizer();
        let ids = tok.encode_truncated("wind power grew wind power", 4).unwrap();
        assert_eq!(ids, vec![0, 4, 5, 2]);
        assert_eq!(
            tok.encode_truncated("wind power", 10).unwrap(),
            tok.encode("wind power", true).unwrap()
        );
    }

    #[test]
    fn test_decode_skips_special_tokens() {
        let tok = tokenizer();
        assert_eq!(tok.decode(&[0, 4, 6, 2, 1, 1], true).unwrap(), "wind grew");
    }

    #[test]
    fn test_pad_resolution() {
        let tok = tokenizer();
        assert_eq!(tok.pad_token_id(), 1);
        assert_eq!(tok.token_to_id("power"), Some(5));
        assert_eq!(tok.id_to_token(6).as_deref(), Some("grew"));
        assert_eq!(tok.vocab_size(), 7);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let tok = tokenizer();
        tok.save_pretrained(dir.path()).unwrap();

        let reloaded = HFTokenizerWrapper::from_file(dir.path().join(TOKENIZER_FILE)).unwrap();
        assert_eq!(
            reloaded.encode("power grew", true).unwrap(),
            tok.encode("power grew", true).unwrap()
        );
    }

    #[test]
    fn test_missing_file() {
        assert!(HFTokenizerWrapper::from_file("/nonexistent/tokenizer.json").is_err());
    }
}
