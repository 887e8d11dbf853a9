//! Knowledge file change detection.
//!
//! [`ChangeDetector::detect`] fingerprints every eligible file (SHA-256 of
//! the raw bytes, mtime and size), diffs the result against the snapshot
//! persisted by the previous pass, and then overwrites that snapshot. The
//! overwrite happens whether or not the caller acts on the changes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::documents::eligible_files;
use crate::error::SyncError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileFingerprint {
    pub hash: String,
    /// Seconds since the Unix epoch.
    pub mtime: f64,
    pub size: u64,
}

/// Persisted baseline, rewritten on every detection pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetadataFile {
    #[serde(default)]
    pub file_hashes: BTreeMap<String, FileFingerprint>,
    #[serde(default)]
    pub last_file_check: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    New,
    Modified,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeRecord {
    pub filename: String,
    pub kind: ChangeKind,
    pub current: Option<FileFingerprint>,
    pub previous: Option<FileFingerprint>,
}

pub struct ChangeDetector {
    root: PathBuf,
    include_globs: Vec<String>,
    metadata_path: PathBuf,
}

impl ChangeDetector {
    pub fn new(root: &Path, include_globs: &[String], metadata_path: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            include_globs: include_globs.to_vec(),
            metadata_path: metadata_path.to_path_buf(),
        }
    }

    /// Compare against the stored snapshot, then store the new one.
    pub fn detect(&self) -> Result<Vec<ChangeRecord>, SyncError> {
        let (changes, current) = self.compare()?;

        let new = changes.iter().filter(|c| c.kind == ChangeKind::New).count();
        let modified = changes.iter().filter(|c| c.kind == ChangeKind::Modified).count();
        let deleted = changes.iter().filter(|c| c.kind == ChangeKind::Deleted).count();
        tracing::info!(new, modified, deleted, files = current.len(), "change detection complete");

        let metadata = MetadataFile {
            file_hashes: current,
            last_file_check: Some(Utc::now()),
        };
        if let Err(e) = self.persist(&metadata) {
            tracing::error!(path = %self.metadata_path.display(), "failed to save metadata: {}", e);
        }

        Ok(changes)
    }

    /// Same comparison as [`detect`](Self::detect) but leaves the metadata file untouched.
    pub fn preview(&self) -> Result<Vec<ChangeRecord>, SyncError> {
        Ok(self.compare()?.0)
    }

    fn compare(&self) -> Result<(Vec<ChangeRecord>, BTreeMap<String, FileFingerprint>), SyncError> {
        let previous = self.load_previous();
        let current = self.snapshot(&previous.file_hashes)?;
        Ok((diff(&previous.file_hashes, &current), current))
    }

    /// Fingerprint all eligible files. A file that cannot be read keeps its
    /// previous fingerprint, if it had one.
    pub fn snapshot(
        &self,
        previous: &BTreeMap<String, FileFingerprint>,
    ) -> Result<BTreeMap<String, FileFingerprint>, SyncError> {
        let mut current = BTreeMap::new();
        for file in eligible_files(&self.root, &self.include_globs)? {
            match fingerprint(&file.path) {
                Ok(fp) => {
                    current.insert(file.relative, fp);
                }
                Err(e) => {
                    tracing::warn!(file = %file.relative, "cannot fingerprint: {}", e);
                    if let Some(fp) = previous.get(&file.relative) {
                        current.insert(file.relative, fp.clone());
                    }
                }
            }
        }
        Ok(current)
    }

    pub fn load_previous(&self) -> MetadataFile {
        let raw = match std::fs::read_to_string(&self.metadata_path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return MetadataFile::default(),
            Err(e) => {
                tracing::warn!(path = %self.metadata_path.display(), "cannot read metadata: {}", e);
                return MetadataFile::default();
            }
        };
        serde_json::from_str(&raw).unwrap_or_else(|e| {
            tracing::warn!(path = %self.metadata_path.display(), "corrupt metadata, starting fresh: {}", e);
            MetadataFile::default()
        })
    }

    fn persist(&self, metadata: &MetadataFile) -> Result<(), SyncError> {
        if let Some(parent) = self.metadata_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let body = serde_json::to_string_pretty(metadata)?;
        std::fs::write(&self.metadata_path, body)?;
        Ok(())
    }
}

pub fn fingerprint(path: &Path) -> Result<FileFingerprint, SyncError> {
    let bytes = std::fs::read(path)?;
    let meta = std::fs::metadata(path)?;
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs_f64())
        .unwrap_or_default();

    let mut hasher = Sha256::new();
    hasher.update(&bytes);

    Ok(FileFingerprint {
        hash: format!("{:x}", hasher.finalize()),
        mtime,
        size: meta.len(),
    })
}

/// Classify every filename present in either snapshot. Unchanged hashes yield nothing.
pub fn diff(
    previous: &BTreeMap<String, FileFingerprint>,
    current: &BTreeMap<String, FileFingerprint>,
) -> Vec<ChangeRecord> {
    let mut changes = Vec::new();

    for (name, fp) in current {
        match previous.get(name) {
            None => changes.push(ChangeRecord {
                filename: name.clone(),
                kind: ChangeKind::New,
                current: Some(fp.clone()),
                previous: None,
            }),
            Some(old) if old.hash != fp.hash => changes.push(ChangeRecord {
                filename: name.clone(),
                kind: ChangeKind::Modified,
                current: Some(fp.clone()),
                previous: Some(old.clone()),
            }),
            Some(_) => {}
        }
    }

    for (name, old) in previous {
        if !current.contains_key(name) {
            changes.push(ChangeRecord {
                filename: name.clone(),
                kind: ChangeKind::Deleted,
                current: None,
                previous: Some(old.clone()),
            });
        }
    }

    changes
}
