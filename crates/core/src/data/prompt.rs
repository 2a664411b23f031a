//! Prompt construction for summarization fine-tuning

use serde::{Deserialize, Serialize};

/// Default text placed before the article
pub const DEFAULT_PROMPT_PREFIX: &str = "Summarize the following article: \n<article>";

/// Default text placed after the article
pub const DEFAULT_PROMPT_SUFFIX: &str = "</article>";

/// Wraps article text with a fixed prefix and suffix
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptTemplate {
    /// Text before the article
    pub prefix: String,

    /// Text after the article
    pub suffix: String,
}

impl PromptTemplate {
    /// Create a template
    pub fn new(prefix: impl Into<String>, suffix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            suffix: suffix.into(),
        }
    }

    /// Build the prompt for one article
    pub fn render(&self, content: &str) -> String {
        let mut prompt = String::with_capacity(self.prefix.len() + content.len() + self.suffix.len());
        prompt.push_str(&self.prefix);
        prompt.push_str(content);
        prompt.push_str(&self.suffix);
        prompt
    }
}

impl Default for PromptTemplate {
    fn default() -> Self {
        Self::new(DEFAULT_PROMPT_PREFIX, DEFAULT_PROMPT_SUFFIX)
    }
}
