//! Publishing model and tokenizer files to the Hugging Face Hub

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde_json::json;
use std::path::Path;
use sumtune_core::error::{Error, Result};
use sumtune_utils::{format_bytes, list_files};

/// Branch that receives commits
pub const DEFAULT_REVISION: &str = "main";

/// A file to place in a hub repository
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HubFile {
    /// Path inside the repository
    pub path_in_repo: String,
    /// File contents
    pub content: Vec<u8>,
}

impl HubFile {
    /// Read a local file
    pub fn from_path(local: impl AsRef<Path>, path_in_repo: impl Into<String>) -> Result<Self> {
        Ok(Self {
            path_in_repo: path_in_repo.into(),
            content: std::fs::read(local.as_ref())?,
        })
    }
}

/// Every regular file directly inside `dir`, named by its file name
pub fn collect_folder(dir: impl AsRef<Path>) -> Result<Vec<HubFile>> {
    let dir = dir.as_ref();
    list_files(dir)?
        .into_iter()
        .map(|path| {
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| Error::Hub(format!("unusable file name in {}", dir.display())))?
                .to_string();
            HubFile::from_path(&path, name)
        })
        .collect()
}

/// Split `owner/name` into its parts
pub fn split_repo_id(repo_id: &str) -> Result<(&str, &str)> {
    match repo_id.split_once('/') {
        Some((owner, name)) if !owner.is_empty() && !name.is_empty() && !name.contains('/') => {
            Ok((owner, name))
        }
        _ => Err(Error::Hub(format!(
            "repository id '{}' is not of the form owner/name",
            repo_id
        ))),
    }
}

/// Newline-delimited JSON body of a commit: a header line, then one line per file
pub fn commit_body(summary: &str, files: &[HubFile]) -> Result<String> {
    let mut lines = vec![serde_json::to_string(&json!({
        "key": "header",
        "value": { "summary": summary, "description": "" }
    }))?];
    for file in files {
        lines.push(serde_json::to_string(&json!({
            "key": "file",
            "value": {
                "path": file.path_in_repo,
                "content": BASE64.encode(&file.content),
                "encoding": "base64"
            }
        }))?);
    }
    Ok(lines.join("\n"))
}

/// Blocking client for repository creation and commits
#[derive(Clone)]
pub struct HubPublisher {
    client: Client,
    endpoint: String,
    token: String,
}

impl HubPublisher {
    /// Create a publisher for `endpoint` authenticated with `token`
    pub fn new(endpoint: impl Into<String>, token: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("sumtune/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Hub(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    /// Hub base URL
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// URL receiving commits for `repo_id`
    pub fn commit_url(&self, repo_id: &str) -> String {
        format!(
            "{}/api/models/{}/commit/{}",
            self.endpoint, repo_id, DEFAULT_REVISION
        )
    }

    /// Create a model repository; an existing repository is accepted
    pub fn create_repo(&self, repo_id: &str) -> Result<()> {
        let (owner, name) = split_repo_id(repo_id)?;
        let response = self
            .client
            .post(format!("{}/api/repos/create", self.endpoint))
            .bearer_auth(&self.token)
            .json(&json!({
                "type": "model",
                "name": name,
                "organization": owner,
                "private": false
            }))
            .send()
            .map_err(|e| Error::Hub(format!("Failed to create {}: {}", repo_id, e)))?;

        match response.status() {
            status if status.is_success() => {
                tracing::info!("Created repository {}", repo_id);
                Ok(())
            }
            StatusCode::CONFLICT => {
                tracing::debug!("Repository {} already exists", repo_id);
                Ok(())
            }
            status => Err(Error::Hub(format!(
                "Creating {} failed with {}: {}",
                repo_id,
                status,
                response.text().unwrap_or_default()
            ))),
        }
    }

    /// Upload `files` to `repo_id` in a single commit
    pub fn commit(&self, repo_id: &str, summary: &str, files: &[HubFile]) -> Result<()> {
        if files.is_empty() {
            return Err(Error::Hub(format!("nothing to commit to {}", repo_id)));
        }
        let size: usize = files.iter().map(|f| f.content.len()).sum();
        tracing::info!(
            "Committing {} files ({}) to {}",
            files.len(),
            format_bytes(size as u64),
            repo_id
        );

        let response = self
            .client
            .post(self.commit_url(repo_id))
            .bearer_auth(&self.token)
            .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
            .body(commit_body(summary, files)?)
            .send()
            .map_err(|e| Error::Hub(format!("Commit to {} failed: {}", repo_id, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Hub(format!(
                "Commit to {} failed with {}: {}",
                repo_id,
                status,
                response.text().unwrap_or_default()
            )));
        }
        Ok(())
    }

    /// Upload every file directly inside `dir` in a single commit
    pub fn upload_folder(&self, repo_id: &str, dir: impl AsRef<Path>, summary: &str) -> Result<usize> {
        let files = collect_folder(dir)?;
        self.commit(repo_id, summary, &files)?;
        Ok(files.len())
    }
}

impl std::fmt::Debug for HubPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubPublisher")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_body_lines() {
        let files = vec![
            HubFile {
                path_in_repo: "adapter_config.json".to_string(),
                content: b"{}".to_vec(),
            },
            HubFile {
                path_in_repo: "adapter_model.safetensors".to_string(),
                content: vec![0, 1, 2, 255],
            },
        ];
        let body = commit_body("Upload model", &files).unwrap();
        let lines: Vec<serde_json::Value> = body
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();

        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["key"], "header");
        assert_eq!(lines[0]["value"]["summary"], "Upload model");
        assert_eq!(lines[1]["value"]["path"], "adapter_config.json");
        assert_eq!(lines[1]["value"]["content"], "e30=");
        assert_eq!(lines[2]["value"]["encoding"], "base64");
        assert_eq!(
            BASE64.decode(lines[2]["value"]["content"].as_str().unwrap()).unwrap(),
            vec![0, 1, 2, 255]
        );
    }

    #[test]
    fn test_split_repo_id() {
        assert_eq!(
            split_repo_id("relu-ntnu/bart-large-cnn_v4_trained_on_250").unwrap(),
            ("relu-ntnu", "bart-large-cnn_v4_trained_on_250")
        );
        assert!(split_repo_id("no-owner").is_err());
        assert!(split_repo_id("a/b/c").is_err());
        assert!(split_repo_id("/name").is_err());
    }

    #[test]
    fn test_commit_url() {
        let publisher = HubPublisher::new("https://hub.example/", "hf_token").unwrap();
        assert_eq!(publisher.endpoint(), "https://hub.example");
        assert_eq!(
            publisher.commit_url("org/model"),
            "https://hub.example/api/models/org/model/commit/main"
        );
        assert!(!format!("{:?}", publisher).contains("hf_token"));
    }

    #[test]
    fn test_collect_folder() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.json"), "{}").unwrap();
        std::fs::write(dir.path().join("a.txt"), "x").unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();

        let files = collect_folder(dir.path()).unwrap();
        let names: Vec<&str> = files.iter().map(|f| f.path_in_repo.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "b.json"]);
    }

    #[test]
    fn test_empty_commit_is_rejected() {
        let publisher = HubPublisher::new("http://127.0.0.1:9", "t").unwrap();
        assert!(publisher.commit("org/model", "empty", &[]).is_err());
    }
}
