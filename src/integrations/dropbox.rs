//! Cloud store backed by the Dropbox HTTP API

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use super::{CloudStore, SyncReport};
use crate::config::CloudConfig;
use crate::error::{Error, Result};
use crate::util::walk_files;

const API_BASE: &str = "https://api.dropboxapi.com/2";
const CONTENT_BASE: &str = "https://content.dropboxapi.com/2";

/// Extensions uploaded during Cold replication
const UPLOAD_EXTENSIONS: [&str; 4] = ["md", "markdown", "txt", "jsonl"];

/// Dropbox client for search, download and upload
#[derive(Debug, Clone)]
pub struct DropboxStore {
    http: reqwest::Client,
    token: Option<String>,
    /// Folder searched during reverse lookup
    search_root: String,
    api_base: String,
    content_base: String,
}

/// A file found by `search_v2`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub name: String,
    pub path: String,
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    matches: Vec<SearchMatch>,
}

#[derive(Deserialize)]
struct SearchMatch {
    metadata: MatchMetadata,
}

#[derive(Deserialize)]
struct MatchMetadata {
    metadata: FileMetadata,
}

#[derive(Deserialize)]
struct FileMetadata {
    #[serde(rename = ".tag")]
    tag: String,
    name: String,
    #[serde(default)]
    path_display: Option<String>,
    #[serde(default)]
    path_lower: Option<String>,
}

impl DropboxStore {
    pub fn new(token: Option<String>, search_root: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            token,
            search_root: search_root.into(),
            api_base: API_BASE.to_string(),
            content_base: CONTENT_BASE.to_string(),
        }
    }

    /// Token is read from the environment variable named in the config
    pub fn from_config(config: &CloudConfig) -> Self {
        let token = if config.enabled { config.token() } else { None };
        if config.enabled && token.is_none() {
            warn!(env = %config.token_env, "cloud store enabled but no token found");
        }
        Self::new(token, config.remote_folder.clone())
    }

    /// Builder: point at a different API host
    pub fn with_base_urls(mut self, api: impl Into<String>, content: impl Into<String>) -> Self {
        self.api_base = api.into();
        self.content_base = content.into();
        self
    }

    fn token(&self) -> Result<&str> {
        self.token
            .as_deref()
            .ok_or_else(|| Error::config("Dropbox access token is not configured"))
    }

    pub async fn search(&self, query: &str, max_results: usize) -> Result<Vec<RemoteFile>> {
        let body = json!({
            "query": query,
            "options": {
                "path": self.search_root,
                "max_results": max_results.max(1),
                "file_status": "active",
            }
        });

        let response = self
            .http
            .post(format!("{}/files/search_v2", self.api_base))
            .bearer_auth(self.token()?)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::remote("dropbox", format!("search status {}: {}", status, text)));
        }

        let parsed: SearchResponse = response.json().await?;
        Ok(files_from_matches(parsed, max_results))
    }

    pub async fn download(&self, remote_path: &str) -> Result<Vec<u8>> {
        let response = self
            .http
            .post(format!("{}/files/download", self.content_base))
            .bearer_auth(self.token()?)
            .header("Dropbox-API-Arg", json!({ "path": remote_path }).to_string())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::remote(
                "dropbox",
                format!("download {} status {}: {}", remote_path, status, text),
            ));
        }

        Ok(response.bytes().await?.to_vec())
    }

    /// Upload with overwrite semantics, so repeated uploads are idempotent
    pub async fn upload(&self, remote_path: &str, bytes: Vec<u8>) -> Result<()> {
        let arg = json!({
            "path": remote_path,
            "mode": "overwrite",
            "autorename": false,
            "mute": true,
        });

        let response = self
            .http
            .post(format!("{}/files/upload", self.content_base))
            .bearer_auth(self.token()?)
            .header("Dropbox-API-Arg", arg.to_string())
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(bytes)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::remote(
                "dropbox",
                format!("upload {} status {}: {}", remote_path, status, text),
            ));
        }
        Ok(())
    }
}

fn files_from_matches(response: SearchResponse, max_results: usize) -> Vec<RemoteFile> {
    response
        .matches
        .into_iter()
        .map(|m| m.metadata.metadata)
        .filter(|meta| meta.tag == "file")
        .filter_map(|meta| {
            let path = meta.path_display.or(meta.path_lower)?;
            Some(RemoteFile {
                name: meta.name,
                path,
            })
        })
        .take(max_results)
        .collect()
}

/// Remote path for a local file under `local_root`
fn remote_path_for(remote_folder: &str, local_root: &Path, file: &Path) -> Option<String> {
    let rel = file.strip_prefix(local_root).ok()?;
    let rel = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/");
    Some(format!("{}/{}", remote_folder.trim_end_matches('/'), rel))
}

fn is_uploadable(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .map_or(false, |ext| UPLOAD_EXTENSIONS.contains(&ext.as_str()))
}

#[async_trait]
impl CloudStore for DropboxStore {
    fn is_available(&self) -> bool {
        self.token.is_some()
    }

    async fn reverse_lookup(
        &self,
        query: &str,
        dest: &Path,
        max_results: usize,
    ) -> Result<Vec<PathBuf>> {
        let files = self.search(query, max_results).await?;
        if files.is_empty() {
            return Ok(Vec::new());
        }

        std::fs::create_dir_all(dest)?;
        let mut downloaded = Vec::new();
        for file in files {
            let target = dest.join(&file.name);
            if target.exists() {
                continue;
            }
            match self.download(&file.path).await {
                Ok(bytes) => {
                    std::fs::write(&target, bytes)?;
                    downloaded.push(target);
                }
                Err(e) => warn!(path = %file.path, error = %e, "dropbox download failed"),
            }
        }

        debug!(query, downloaded = downloaded.len(), "dropbox reverse lookup");
        Ok(downloaded)
    }

    async fn sync_folder(&self, local: &Path, remote_folder: &str) -> Result<SyncReport> {
        let mut report = SyncReport::default();

        for file in walk_files(local)? {
            if !is_uploadable(&file) {
                continue;
            }
            let Some(remote) = remote_path_for(remote_folder, local, &file) else {
                continue;
            };
            let bytes = std::fs::read(&file)?;
            match self.upload(&remote, bytes).await {
                Ok(()) => report.total_synced += 1,
                Err(e) => {
                    warn!(path = %file.display(), error = %e, "dropbox upload failed");
                    report.failed += 1;
                }
            }
        }

        debug!(
            from = %local.display(),
            to = remote_folder,
            synced = report.total_synced,
            failed = report.failed,
            "dropbox sync"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_response_keeps_only_files() {
        let raw = r#"{
            "matches": [
                {"metadata": {".tag": "metadata", "metadata": {".tag": "folder", "name": "notes", "path_display": "/OC-Memory/notes"}}},
                {"metadata": {".tag": "metadata", "metadata": {".tag": "file", "name": "k8s.md", "path_display": "/OC-Memory/notes/k8s.md"}}},
                {"metadata": {".tag": "metadata", "metadata": {".tag": "file", "name": "b.md", "path_lower": "/oc-memory/b.md"}}}
            ],
            "has_more": false
        }"#;
        let parsed: SearchResponse = serde_json::from_str(raw).unwrap();
        let files = files_from_matches(parsed, 3);

        assert_eq!(
            files,
            vec![
                RemoteFile {
                    name: "k8s.md".into(),
                    path: "/OC-Memory/notes/k8s.md".into()
                },
                RemoteFile {
                    name: "b.md".into(),
                    path: "/oc-memory/b.md".into()
                },
            ]
        );
    }

    #[test]
    fn remote_paths_use_forward_slashes() {
        let root = Path::new("/mem/hot");
        let file = Path::new("/mem/hot/notes/a.md");
        assert_eq!(
            remote_path_for("/OC-Memory/", root, file).as_deref(),
            Some("/OC-Memory/notes/a.md")
        );
        assert!(is_uploadable(file));
        assert!(!is_uploadable(Path::new("/mem/catalog.db")));
    }

    #[test]
    fn missing_token_means_unavailable() {
        let store = DropboxStore::new(None, "/OC-Memory");
        assert!(!store.is_available());
        assert!(DropboxStore::new(Some("t".into()), "/x").is_available());
    }
}
