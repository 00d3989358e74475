//! Note vault backed by a plain directory of Markdown notes

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use super::{NoteVault, VaultNote};
use crate::error::Result;
use crate::util::{keywords, walk_files};

/// Obsidian-style vault: a folder tree of `.md` files
#[derive(Debug, Clone)]
pub struct FsVault {
    root: PathBuf,
}

impl FsVault {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn base(&self, folder: Option<&str>) -> PathBuf {
        match folder {
            Some(f) if !f.is_empty() => self.root.join(f.trim_matches('/')),
            _ => self.root.clone(),
        }
    }
}

fn is_markdown(path: &Path) -> bool {
    path.extension()
        .map_or(false, |ext| ext.eq_ignore_ascii_case("md") || ext.eq_ignore_ascii_case("markdown"))
}

/// Copy `src` to `dest` unless `dest` already has identical bytes
fn mirror_file(src: &Path, dest: &Path) -> Result<bool> {
    let bytes = std::fs::read(src)?;
    if std::fs::read(dest).map_or(false, |existing| existing == bytes) {
        return Ok(false);
    }
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(dest, bytes)?;
    Ok(true)
}

#[async_trait]
impl NoteVault for FsVault {
    async fn search(
        &self,
        query: &str,
        folder: Option<&str>,
        max_results: usize,
    ) -> Result<Vec<VaultNote>> {
        let words = keywords(query);
        if words.is_empty() || max_results == 0 {
            return Ok(Vec::new());
        }

        let mut scored = Vec::new();
        for path in walk_files(&self.base(folder))? {
            if !is_markdown(&path) {
                continue;
            }
            let Ok(text) = std::fs::read_to_string(&path) else {
                continue;
            };
            let title = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            let haystack = format!("{}\n{}", title, text).to_lowercase();

            let score = words.iter().filter(|w| haystack.contains(w.as_str())).count();
            if score * 2 >= words.len() && score > 0 {
                scored.push((score, VaultNote { path, title }));
            }
        }

        scored.sort_by(|a, b| b.0.cmp(&a.0));
        debug!(query, hits = scored.len(), "vault search");
        Ok(scored.into_iter().take(max_results).map(|(_, n)| n).collect())
    }

    async fn sync_dir(&self, local: &Path, folder: &str) -> Result<usize> {
        let target = self.base(Some(folder));
        let mut written = 0;

        for path in walk_files(local)? {
            let Ok(rel) = path.strip_prefix(local) else {
                continue;
            };
            if mirror_file(&path, &target.join(rel))? {
                written += 1;
            }
        }

        debug!(from = %local.display(), to = %target.display(), written, "vault sync");
        Ok(written)
    }

    async fn sync_file(&self, local: &Path, folder: &str) -> Result<bool> {
        let Some(name) = local.file_name() else {
            return Ok(false);
        };
        mirror_file(local, &self.base(Some(folder)).join(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn search_scopes_to_folder_and_ranks() {
        let dir = TempDir::new().unwrap();
        let vault = FsVault::new(dir.path());
        let folder = dir.path().join("OC-Memory");
        std::fs::create_dir_all(&folder).unwrap();
        std::fs::write(folder.join("kubernetes.md"), "Cluster upgrade runbook").unwrap();
        std::fs::write(folder.join("garden.md"), "tomatoes").unwrap();
        std::fs::write(dir.path().join("outside.md"), "kubernetes cluster upgrade").unwrap();

        let hits = vault
            .search("kubernetes cluster upgrade", Some("OC-Memory"), 5)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].title, "kubernetes");

        let everywhere = vault.search("kubernetes cluster upgrade", None, 5).await.unwrap();
        assert_eq!(everywhere.len(), 2);
    }

    #[tokio::test]
    async fn sync_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let local = dir.path().join("hot");
        std::fs::create_dir_all(local.join("notes")).unwrap();
        std::fs::write(local.join("notes/a.md"), "alpha").unwrap();

        let vault = FsVault::new(dir.path().join("vault"));
        assert_eq!(vault.sync_dir(&local, "OC-Memory/hot").await.unwrap(), 1);
        assert_eq!(vault.sync_dir(&local, "OC-Memory/hot").await.unwrap(), 0);
        assert!(dir.path().join("vault/OC-Memory/hot/notes/a.md").exists());

        std::fs::write(local.join("notes/a.md"), "beta").unwrap();
        assert_eq!(vault.sync_dir(&local, "OC-Memory/hot").await.unwrap(), 1);
    }
}
