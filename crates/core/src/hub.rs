//! Hub credentials and repository naming

use crate::error::{Error, Result};

/// Env var holding the write token
pub const WRITE_TOKEN_ENV: &str = "HUGGING_FACE_ACCESS_TOKEN";
/// Env var holding the read token
pub const READ_TOKEN_ENV: &str = "HUGGING_FACE_READ_TOKEN";
/// Env var overriding the hub base URL
pub const ENDPOINT_ENV: &str = "HF_ENDPOINT";
/// Public hub
pub const DEFAULT_ENDPOINT: &str = "https://huggingface.co";

/// Tokens and endpoint for talking to the model hub
#[derive(Clone, Default, PartialEq, Eq)]
pub struct HubCredentials {
    /// Token used to download gated or private checkpoints
    pub read_token: Option<String>,
    /// Token used to publish
    pub write_token: Option<String>,
    /// Base URL of the hub
    pub endpoint: String,
}

impl HubCredentials {
    /// Resolve tokens and endpoint from the environment.
    ///
    /// Only the presence of each token is logged.
    pub fn from_env() -> Self {
        let creds = Self {
            read_token: non_empty_var(READ_TOKEN_ENV),
            write_token: non_empty_var(WRITE_TOKEN_ENV),
            endpoint: resolve_endpoint(),
        };

        if creds.write_token.is_none() {
            tracing::warn!("{} is not set, publishing will fail", WRITE_TOKEN_ENV);
        } else {
            tracing::info!("{} is set", WRITE_TOKEN_ENV);
        }
        if creds.read_token.is_none() {
            tracing::debug!("{} is not set, downloads are anonymous", READ_TOKEN_ENV);
        }
        creds
    }

    /// Write token or a hub error naming the missing variable
    pub fn require_write_token(&self) -> Result<&str> {
        self.write_token
            .as_deref()
            .ok_or_else(|| Error::Hub(format!("no write token, set {}", WRITE_TOKEN_ENV)))
    }
}

impl std::fmt::Debug for HubCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubCredentials")
            .field("read_token", &self.read_token.as_ref().map(|_| "<set>"))
            .field("write_token", &self.write_token.as_ref().map(|_| "<set>"))
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Hub base URL from `HF_ENDPOINT`, without a trailing slash
pub fn resolve_endpoint() -> String {
    non_empty_var(ENDPOINT_ENV)
        .map(|e| e.trim_end_matches('/').to_string())
        .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string())
}

/// Name of a published fine-tune: `{org}/{model_name}_{version}_trained_on_{count}`,
/// where `model_name` is the part of the checkpoint after its owner.
pub fn fine_tuned_repo_name(
    org: &str,
    checkpoint: &str,
    version: &str,
    article_count: usize,
) -> Result<String> {
    let model_name = match checkpoint.split_once('/') {
        Some((_, name)) => name,
        None => checkpoint,
    };
    let model_name = model_name.trim_end_matches('/');
    if model_name.is_empty() || model_name.contains('/') {
        return Err(Error::Validation(format!(
            "cannot derive a model name from checkpoint '{}'",
            checkpoint
        )));
    }
    Ok(format!(
        "{}/{}_{}_trained_on_{}",
        org, model_name, version, article_count
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fine_tuned_repo_name() {
        let name = fine_tuned_repo_name("relu-ntnu", "facebook/bart-large-cnn", "v4", 250).unwrap();
        assert_eq!(name, "relu-ntnu/bart-large-cnn_v4_trained_on_250");
    }

    #[test]
    fn test_fine_tuned_repo_name_without_owner() {
        let name = fine_tuned_repo_name("org", "t5-small", "v1", 10).unwrap();
        assert_eq!(name, "org/t5-small_v1_trained_on_10");
    }

    #[test]
    fn test_fine_tuned_repo_name_rejects_paths() {
        assert!(fine_tuned_repo_name("org", "a/b/c", "v1", 10).is_err());
        assert!(fine_tuned_repo_name("org", "a/", "v1", 10).is_err());
    }

    #[test]
    fn test_debug_hides_tokens() {
        let creds = HubCredentials {
            read_token: Some("hf_secret".to_string()),
            write_token: None,
            endpoint: DEFAULT_ENDPOINT.to_string(),
        };
        let shown = format!("{:?}", creds);
        assert!(!shown.contains("hf_secret"));
        assert!(shown.contains("<set>"));
    }

    #[test]
    fn test_require_write_token() {
        let creds = HubCredentials::default();
        assert!(matches!(creds.require_write_token(), Err(Error::Hub(_))));
    }
}
