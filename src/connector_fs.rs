use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::{Component, Path};
use walkdir::WalkDir;

use crate::config::FilesystemSourceConfig;
use crate::sources::DocumentSource;

/// Local directory of intake forms. Filenames are paths relative to `root`
/// with `/` separators, so they stay stable across runs and platforms.
pub struct FilesystemSource {
    config: FilesystemSourceConfig,
}

impl FilesystemSource {
    pub fn new(config: FilesystemSourceConfig) -> Self {
        Self { config }
    }

    fn scan(&self) -> Result<Vec<String>> {
        let root = &self.config.root;
        if !root.exists() {
            bail!("Filesystem source root does not exist: {}", root.display());
        }

        let include_set = build_globset(&self.config.include_globs)?;

        let mut default_excludes = vec![
            "**/.git/**".to_string(),
            "**/target/**".to_string(),
            "**/node_modules/**".to_string(),
        ];
        default_excludes.extend(self.config.exclude_globs.clone());
        let exclude_set = build_globset(&default_excludes)?;

        let mut files = Vec::new();

        let walker = WalkDir::new(root).follow_links(self.config.follow_symlinks);
        for entry in walker {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            let relative = path.strip_prefix(root).unwrap_or(path);
            let rel_str = relative_name(relative);

            if exclude_set.is_match(&rel_str) {
                continue;
            }
            if !include_set.is_match(&rel_str) {
                continue;
            }

            files.push(rel_str);
        }

        files.sort();
        Ok(files)
    }
}

#[async_trait]
impl DocumentSource for FilesystemSource {
    fn name(&self) -> &str {
        "filesystem"
    }

    async fn list(&self) -> Result<Vec<String>> {
        self.scan()
    }

    async fn fetch(&self, filename: &str) -> Result<Vec<u8>> {
        let relative = Path::new(filename);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            bail!("refusing to read outside the source root: {}", filename);
        }
        let path = self.config.root.join(relative);
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))
    }
}

fn relative_name(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn source_for(root: &Path, include: &[&str], exclude: &[&str]) -> FilesystemSource {
        FilesystemSource::new(FilesystemSourceConfig {
            root: root.to_path_buf(),
            include_globs: include.iter().map(|s| s.to_string()).collect(),
            exclude_globs: exclude.iter().map(|s| s.to_string()).collect(),
            follow_symlinks: false,
        })
    }

    #[tokio::test]
    async fn lists_matching_files_sorted_and_relative() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("clinic/2024")).unwrap();
        fs::create_dir_all(tmp.path().join(".git")).unwrap();
        fs::write(tmp.path().join("b.pdf"), b"%PDF").unwrap();
        fs::write(tmp.path().join("clinic/2024/a.pdf"), b"%PDF").unwrap();
        fs::write(tmp.path().join("notes.log"), b"skip").unwrap();
        fs::write(tmp.path().join(".git/x.pdf"), b"skip").unwrap();
        fs::write(tmp.path().join("draft.pdf"), b"skip").unwrap();

        let source = source_for(tmp.path(), &["**/*.pdf"], &["draft.pdf"]);
        let files = source.list().await.unwrap();
        assert_eq!(files, vec!["b.pdf", "clinic/2024/a.pdf"]);

        let content = source.fetch("clinic/2024/a.pdf").await.unwrap();
        assert_eq!(content, b"%PDF");
    }

    #[tokio::test]
    async fn missing_root_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let source = source_for(&tmp.path().join("nope"), &["**/*"], &[]);
        assert!(source.list().await.is_err());
    }

    #[tokio::test]
    async fn fetch_rejects_parent_traversal() {
        let tmp = TempDir::new().unwrap();
        let source = source_for(tmp.path(), &["**/*"], &[]);
        assert!(source.fetch("../secret.txt").await.is_err());
    }
}
