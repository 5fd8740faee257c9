//! The artifact store: everything the pipeline persists between runs.
//!
//! ```text
//! {data_dir}/
//!   documents/{h[0..2]}/{h}.bin      raw bytes, content-addressed
//!   artifacts/{kind}/{key}.json      stage outputs, keyed by upstream hash
//!   geocode-cache.jsonl              see crate::pipeline::resolve::GeocodeCache
//!   manifest.json                    the current generation
//!   published/routes.json            dataset consumed by the map page
//!   reports/runs.jsonl               append-only run log
//! ```
//!
//! Content-addressed writes are idempotent: the same key always maps to the
//! same value, so a second writer for an existing key does nothing. Files that
//! are overwritten (manifest, published dataset) go through a temp file and a
//! rename so readers never see a half-written file.

use crate::error::PipelineError;
use crate::model::{RawDocument, Source};
use crate::report::RunReport;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// SHA-256 of `bytes`, lowercase hex.
pub fn compute_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Stable key derived from several parts (NUL-separated before hashing).
pub fn artifact_key(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            hasher.update([0u8]);
        }
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Stage outputs kept under `artifacts/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Extracted,
    Structured,
    Resolved,
    Validation,
}

impl ArtifactKind {
    fn dir_name(self) -> &'static str {
        match self {
            ArtifactKind::Extracted => "extracted",
            ArtifactKind::Structured => "structured",
            ArtifactKind::Resolved => "resolved",
            ArtifactKind::Validation => "validation",
        }
    }
}

/// A cached stage result: either the artifact or the deterministic failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum Recorded<T, E> {
    Ok(T),
    Failed(E),
}

/// The generation of artifacts the orchestrator currently considers valid.
///
/// `None` means the stage has never completed; `Some(vec![])` means it
/// completed with no output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub generation: u64,
    pub updated_at: Option<DateTime<Utc>>,
    pub sources: Option<Vec<Source>>,
    pub fetched: Option<Vec<RawDocument>>,
    pub extracted: Option<Vec<String>>,
    pub structured: Option<Vec<String>>,
    pub resolved: Option<Vec<String>>,
    pub validation: Option<String>,
}

impl Manifest {
    /// Previous fetch record for a URL, used for conditional requests.
    pub fn fetched_for(&self, url: &str) -> Option<&RawDocument> {
        self.fetched
            .as_ref()
            .and_then(|docs| docs.iter().find(|d| d.source.url == url))
    }
}

/// Handle to the on-disk store. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, PipelineError> {
        let root = root.into();
        for sub in ["documents", "artifacts", "published", "reports"] {
            let dir = root.join(sub);
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| PipelineError::store(&dir, e))?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn published_path(&self) -> PathBuf {
        self.root.join("published").join("routes.json")
    }

    pub fn reports_path(&self) -> PathBuf {
        self.root.join("reports").join("runs.jsonl")
    }

    pub fn geocode_cache_path(&self) -> PathBuf {
        self.root.join("geocode-cache.jsonl")
    }

    fn manifest_path(&self) -> PathBuf {
        self.root.join("manifest.json")
    }

    fn document_path(&self, hash: &str) -> PathBuf {
        let prefix = hash.get(..2).unwrap_or("00");
        self.root
            .join("documents")
            .join(prefix)
            .join(format!("{hash}.bin"))
    }

    fn artifact_path(&self, kind: ArtifactKind, key: &str) -> PathBuf {
        self.root
            .join("artifacts")
            .join(kind.dir_name())
            .join(format!("{key}.json"))
    }

    // ── Documents ────────────────────────────────────────────────────────

    /// Store raw bytes under their content hash. Returns the hash and whether
    /// anything was written.
    pub async fn put_document(&self, bytes: &[u8]) -> Result<(String, bool), PipelineError> {
        let hash = compute_hash(bytes);
        let written = write_once(self.document_path(&hash), bytes.to_vec()).await?;
        Ok((hash, written))
    }

    pub async fn get_document(&self, hash: &str) -> Result<Vec<u8>, PipelineError> {
        let path = self.document_path(hash);
        tokio::fs::read(&path)
            .await
            .map_err(|e| PipelineError::store(path, e))
    }

    pub async fn has_document(&self, hash: &str) -> bool {
        tokio::fs::try_exists(self.document_path(hash))
            .await
            .unwrap_or(false)
    }

    // ── Stage artifacts ──────────────────────────────────────────────────

    /// Persist an artifact unless one already exists under `key`.
    pub async fn put_artifact<T: Serialize>(
        &self,
        kind: ArtifactKind,
        key: &str,
        value: &T,
    ) -> Result<bool, PipelineError> {
        let path = self.artifact_path(kind, key);
        let json = serde_json::to_vec_pretty(value).map_err(|e| PipelineError::Serialization {
            path: path.clone(),
            detail: e.to_string(),
        })?;
        write_once(path, json).await
    }

    pub async fn get_artifact<T: DeserializeOwned>(
        &self,
        kind: ArtifactKind,
        key: &str,
    ) -> Result<Option<T>, PipelineError> {
        let path = self.artifact_path(kind, key);
        read_json(&path).await
    }

    // ── Manifest ─────────────────────────────────────────────────────────

    pub async fn load_manifest(&self) -> Result<Manifest, PipelineError> {
        Ok(read_json(&self.manifest_path()).await?.unwrap_or_default())
    }

    pub async fn save_manifest(&self, manifest: &Manifest) -> Result<(), PipelineError> {
        let path = self.manifest_path();
        let json = serde_json::to_vec_pretty(manifest).map_err(|e| PipelineError::Serialization {
            path: path.clone(),
            detail: e.to_string(),
        })?;
        write_atomic(&path, &json).await
    }

    // ── Published dataset ────────────────────────────────────────────────

    /// Hash of the currently published dataset, if there is one.
    pub async fn published_hash(&self) -> Result<Option<String>, PipelineError> {
        let path = self.published_path();
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(compute_hash(&bytes))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PipelineError::store(path, e)),
        }
    }

    pub async fn write_published(&self, bytes: &[u8]) -> Result<(), PipelineError> {
        write_atomic(&self.published_path(), bytes).await
    }

    // ── Run log ──────────────────────────────────────────────────────────

    /// Append one report as a single JSON line.
    pub async fn append_report(&self, report: &RunReport) -> Result<(), PipelineError> {
        let path = self.reports_path();
        let mut line = serde_json::to_vec(report).map_err(|e| PipelineError::Serialization {
            path: path.clone(),
            detail: e.to_string(),
        })?;
        line.push(b'\n');
        append_line(&path, &line).await
    }

    /// Every report in the log, oldest first.
    pub async fn read_reports(&self) -> Result<Vec<RunReport>, PipelineError> {
        let path = self.reports_path();
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(PipelineError::store(path, e)),
        };
        text.lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| {
                serde_json::from_str(l).map_err(|e| PipelineError::Serialization {
                    path: path.clone(),
                    detail: e.to_string(),
                })
            })
            .collect()
    }
}

// ── Internal helpers ─────────────────────────────────────────────────────────

/// Write `bytes` to `path` only if nothing is there yet.
///
/// Runs on the blocking pool: the temp file is persisted with
/// `persist_noclobber`, so two concurrent writers of the same key leave
/// exactly one file and neither fails.
async fn write_once(path: PathBuf, bytes: Vec<u8>) -> Result<bool, PipelineError> {
    tokio::task::spawn_blocking(move || {
        if path.exists() {
            return Ok(false);
        }
        let parent = path
            .parent()
            .ok_or_else(|| PipelineError::Internal(format!("no parent for {}", path.display())))?;
        std::fs::create_dir_all(parent).map_err(|e| PipelineError::store(parent, e))?;

        let mut tmp =
            tempfile::NamedTempFile::new_in(parent).map_err(|e| PipelineError::store(parent, e))?;
        tmp.write_all(&bytes)
            .map_err(|e| PipelineError::store(tmp.path(), e))?;

        match tmp.persist_noclobber(&path) {
            Ok(_) => {
                debug!("Stored {} ({} bytes)", path.display(), bytes.len());
                Ok(true)
            }
            Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(PipelineError::store(&path, e.error)),
        }
    })
    .await
    .map_err(|e| PipelineError::Internal(format!("store task panicked: {e}")))?
}

/// Atomic overwrite through a uniquely named sibling temp file, so
/// concurrent writers never share a partial file. The last rename wins.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), PipelineError> {
    let path = path.to_path_buf();
    let bytes = bytes.to_vec();
    tokio::task::spawn_blocking(move || {
        let parent = path
            .parent()
            .ok_or_else(|| PipelineError::Internal(format!("no parent for {}", path.display())))?;
        std::fs::create_dir_all(parent).map_err(|e| PipelineError::store(parent, e))?;

        let mut tmp =
            tempfile::NamedTempFile::new_in(parent).map_err(|e| PipelineError::store(parent, e))?;
        tmp.write_all(&bytes)
            .map_err(|e| PipelineError::store(tmp.path(), e))?;
        tmp.persist(&path)
            .map_err(|e| PipelineError::store(&path, e.error))?;
        debug!("Replaced {} ({} bytes)", path.display(), bytes.len());
        Ok(())
    })
    .await
    .map_err(|e| PipelineError::Internal(format!("store task panicked: {e}")))?
}

pub(crate) async fn append_line(path: &Path, line: &[u8]) -> Result<(), PipelineError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| PipelineError::store(parent, e))?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|e| PipelineError::store(path, e))?;
    file.write_all(line)
        .await
        .map_err(|e| PipelineError::store(path, e))?;
    file.flush().await.map_err(|e| PipelineError::store(path, e))
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, PipelineError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(PipelineError::store(path, e)),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| PipelineError::Serialization {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn hash_is_sha256_hex() {
        assert_eq!(
            compute_hash(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn artifact_key_separates_parts() {
        assert_ne!(artifact_key(&["ab", "c"]), artifact_key(&["a", "bc"]));
        assert_eq!(artifact_key(&["x", "y"]), artifact_key(&["x", "y"]));
    }

    #[tokio::test]
    async fn documents_are_content_addressed() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(dir.path()).await.unwrap();

        let (h1, first) = store.put_document(b"402 shuttle").await.unwrap();
        let (h2, second) = store.put_document(b"402 shuttle").await.unwrap();
        assert_eq!(h1, h2);
        assert!(first);
        assert!(!second, "second write of the same content is a no-op");
        assert!(store.has_document(&h1).await);
        assert_eq!(store.get_document(&h1).await.unwrap(), b"402 shuttle");
    }

    #[tokio::test]
    async fn concurrent_overwrites_leave_one_complete_file() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(dir.path()).await.unwrap();
        let a = vec![b'a'; 256 * 1024];
        let b = vec![b'b'; 128 * 1024];

        let mut writes = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            let bytes = if i % 2 == 0 { a.clone() } else { b.clone() };
            writes.push(tokio::spawn(async move { store.write_published(&bytes).await }));
        }
        for w in writes {
            w.await.unwrap().unwrap();
        }

        let published = tokio::fs::read(store.published_path()).await.unwrap();
        assert!(published == a || published == b, "mixed {} bytes", published.len());
        let leftovers: Vec<_> = std::fs::read_dir(store.published_path().parent().unwrap())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.path() != store.published_path())
            .collect();
        assert!(leftovers.is_empty(), "temp files left behind: {leftovers:?}");
    }

    #[tokio::test]
    async fn artifacts_are_write_once() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(dir.path()).await.unwrap();

        assert!(store
            .put_artifact(ArtifactKind::Structured, "k", &vec![1, 2, 3])
            .await
            .unwrap());
        assert!(!store
            .put_artifact(ArtifactKind::Structured, "k", &vec![9])
            .await
            .unwrap());
        let read: Option<Vec<i32>> = store.get_artifact(ArtifactKind::Structured, "k").await.unwrap();
        assert_eq!(read, Some(vec![1, 2, 3]));
        let missing: Option<Vec<i32>> = store.get_artifact(ArtifactKind::Resolved, "k").await.unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn manifest_defaults_when_absent() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(dir.path()).await.unwrap();
        let m = store.load_manifest().await.unwrap();
        assert_eq!(m.generation, 0);
        assert!(m.sources.is_none());

        let updated = Manifest {
            generation: 1,
            extracted: Some(vec!["a".into()]),
            ..Manifest::default()
        };
        store.save_manifest(&updated).await.unwrap();
        assert_eq!(store.load_manifest().await.unwrap(), updated);
    }

    #[tokio::test]
    async fn published_hash_tracks_content() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(dir.path()).await.unwrap();
        assert_eq!(store.published_hash().await.unwrap(), None);
        store.write_published(b"[]").await.unwrap();
        assert_eq!(store.published_hash().await.unwrap(), Some(compute_hash(b"[]")));
    }

    #[test]
    fn recorded_round_trips_failures() {
        let rec: Recorded<String, crate::error::ExtractionError> =
            Recorded::Failed(crate::error::ExtractionError::Empty);
        let json = serde_json::to_string(&rec).unwrap();
        let back: Recorded<String, crate::error::ExtractionError> =
            serde_json::from_str(&json).unwrap();
        assert_eq!(back, rec);
    }
}
