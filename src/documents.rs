//! Knowledge directory scanning and document loading.
//!
//! Walks the knowledge directory with `walkdir`, filters paths through
//! include/exclude glob sets, and reads every eligible file as UTF-8 text.
//! Paths are reported relative to the knowledge directory and sorted, so
//! every run sees files in the same order.

use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::error::SyncError;

const DEFAULT_EXCLUDES: &[&str] = &["**/.git/**", "**/node_modules/**"];

/// A knowledge file read into memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    /// Path relative to the knowledge directory.
    pub source: String,
    pub text: String,
}

/// Result of a load pass. `documents` may be empty; that is not an error.
#[derive(Debug, Clone, Default)]
pub struct DocumentSet {
    pub documents: Vec<Document>,
    /// `(source, reason)` for each eligible file that could not be read.
    pub unreadable: Vec<(String, String)>,
}

impl DocumentSet {
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

/// Eligible file under the knowledge directory.
#[derive(Debug, Clone)]
pub struct EligibleFile {
    pub path: PathBuf,
    pub relative: String,
}

/// List eligible files, sorted by relative path.
pub fn eligible_files(root: &Path, include_globs: &[String]) -> Result<Vec<EligibleFile>, SyncError> {
    if !root.is_dir() {
        return Err(SyncError::FileProcessing(format!(
            "knowledge directory does not exist: {}",
            root.display()
        )));
    }

    let include_set = build_globset(include_globs)?;
    let excludes: Vec<String> = DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect();
    let exclude_set = build_globset(&excludes)?;

    let mut files = Vec::new();
    for entry in WalkDir::new(root) {
        let entry = entry.map_err(|e| {
            SyncError::FileProcessing(format!("cannot walk {}: {}", root.display(), e))
        })?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative.to_string_lossy().replace('\\', "/");

        if exclude_set.is_match(&rel_str) || !include_set.is_match(&rel_str) {
            continue;
        }

        files.push(EligibleFile {
            path: path.to_path_buf(),
            relative: rel_str,
        });
    }

    files.sort_by(|a, b| a.relative.cmp(&b.relative));
    Ok(files)
}

/// Load every eligible file.
///
/// Returns `Err` when the directory cannot be walked or when every eligible
/// file failed to read; individual failures otherwise land in
/// [`DocumentSet::unreadable`].
pub fn load_documents(root: &Path, include_globs: &[String]) -> Result<DocumentSet, SyncError> {
    let files = eligible_files(root, include_globs)?;
    let mut set = DocumentSet::default();

    for file in &files {
        match std::fs::read_to_string(&file.path) {
            Ok(text) => set.documents.push(Document {
                source: file.relative.clone(),
                text,
            }),
            Err(e) => {
                tracing::error!(file = %file.relative, "failed to read document: {}", e);
                set.unreadable.push((file.relative.clone(), e.to_string()));
            }
        }
    }

    if !files.is_empty() && set.documents.is_empty() {
        return Err(SyncError::FileProcessing(format!(
            "failed to read all {} documents in {}",
            files.len(),
            root.display()
        )));
    }
    if set.documents.is_empty() {
        tracing::warn!(dir = %root.display(), "no documents found");
    } else {
        tracing::info!(
            documents = set.documents.len(),
            unreadable = set.unreadable.len(),
            "loaded documents"
        );
    }
    Ok(set)
}

/// Load a single document by its relative path.
pub fn load_document(root: &Path, source: &str) -> Result<Document, SyncError> {
    let text = std::fs::read_to_string(root.join(source))
        .map_err(|e| SyncError::FileProcessing(format!("{}: {}", source, e)))?;
    Ok(Document {
        source: source.to_string(),
        text,
    })
}

fn build_globset(patterns: &[String]) -> Result<GlobSet, SyncError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| SyncError::Configuration(format!("invalid glob '{}': {}", pattern, e)))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| SyncError::Configuration(format!("invalid glob set: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn txt() -> Vec<String> {
        vec!["**/*.txt".to_string()]
    }

    #[test]
    fn test_loads_matching_files_sorted() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("slab.txt"), "Trust your feet.").unwrap();
        std::fs::create_dir(dir.path().join("holds")).unwrap();
        std::fs::write(dir.path().join("holds/crimp.txt"), "Half crimp first.").unwrap();
        std::fs::write(dir.path().join("notes.md"), "ignored").unwrap();

        let set = load_documents(dir.path(), &txt()).unwrap();
        let sources: Vec<&str> = set.documents.iter().map(|d| d.source.as_str()).collect();
        assert_eq!(sources, vec!["holds/crimp.txt", "slab.txt"]);
        assert!(set.unreadable.is_empty());
    }

    #[test]
    fn test_empty_directory_is_not_an_error() {
        let dir = TempDir::new().unwrap();
        let set = load_documents(dir.path(), &txt()).unwrap();
        assert!(set.is_empty());
    }

    #[test]
    fn test_missing_directory_is_an_error() {
        let dir = TempDir::new().unwrap();
        let err = load_documents(&dir.path().join("nope"), &txt()).unwrap_err();
        assert!(matches!(err, SyncError::FileProcessing(_)));
    }

    #[test]
    fn test_all_unreadable_is_an_error() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("binary.txt"), [0xff, 0xfe, 0x00, 0xc3]).unwrap();
        let err = load_documents(dir.path(), &txt()).unwrap_err();
        assert!(err.to_string().contains("failed to read all 1"));
    }

    #[test]
    fn test_some_unreadable_are_listed() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("ok.txt"), "Drop knee.").unwrap();
        std::fs::write(dir.path().join("bad.txt"), [0xff, 0xfe]).unwrap();
        let set = load_documents(dir.path(), &txt()).unwrap();
        assert_eq!(set.documents.len(), 1);
        assert_eq!(set.unreadable.len(), 1);
        assert_eq!(set.unreadable[0].0, "bad.txt");
    }

    #[test]
    fn test_invalid_glob_is_configuration_error() {
        let dir = TempDir::new().unwrap();
        let err = eligible_files(dir.path(), &["[".to_string()]).unwrap_err();
        assert!(matches!(err, SyncError::Configuration(_)));
    }
}
