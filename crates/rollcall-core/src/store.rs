//! Durable embedding store.
//!
//! Holds the ordered (embedding, label) pairs in memory and rewrites the
//! whole file after every append. Writes go to a temporary file in the
//! same directory which is fsynced and atomically renamed over the store,
//! so a crash mid-write leaves the previous file loadable.

use crate::types::{clean_label, Embedding};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

const STORE_FORMAT_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("embedding store {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("embedding has {actual} dimensions, store holds {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("embedding is empty or has non-finite components")]
    MalformedEmbedding,
    #[error("label is empty")]
    EmptyLabel,
    #[error("store I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("store serialization: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("store replace failed: {0}")]
    Persist(#[from] tempfile::PersistError),
}

/// On-disk layout: two same-length ordered sequences plus integrity data.
#[derive(Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    dimension: Option<usize>,
    embeddings: Vec<Embedding>,
    labels: Vec<String>,
    checksum: String,
}

/// Ordered, append-only collection of labeled face embeddings.
#[derive(Debug)]
pub struct EmbeddingStore {
    path: PathBuf,
    embeddings: Vec<Embedding>,
    labels: Vec<String>,
}

impl EmbeddingStore {
    /// Load the store at `path`, or start empty if no file exists.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if !path.exists() {
            tracing::info!(path = %path.display(), "no embedding store on disk; starting empty");
            return Ok(Self {
                path,
                embeddings: Vec::new(),
                labels: Vec::new(),
            });
        }

        // Raw bytes: a non-UTF-8 file is corrupt, not an I/O failure.
        let raw = std::fs::read(&path)?;
        let file: StoreFile = serde_json::from_slice(&raw).map_err(|e| StoreError::Corrupt {
            path: path.clone(),
            reason: format!("parse failed: {e}"),
        })?;
        validate(&path, &file)?;

        tracing::info!(
            path = %path.display(),
            embeddings = file.embeddings.len(),
            dimension = ?file.dimension,
            "embedding store loaded"
        );

        Ok(Self {
            path,
            embeddings: file.embeddings,
            labels: file.labels,
        })
    }

    /// Append one pair and durably persist the whole store.
    ///
    /// On a failed write the pair is removed again, so memory never runs
    /// ahead of the file.
    pub fn append(&mut self, embedding: Embedding, label: &str) -> Result<(), StoreError> {
        if !embedding.is_well_formed() {
            return Err(StoreError::MalformedEmbedding);
        }
        let label = clean_label(label).ok_or(StoreError::EmptyLabel)?;
        if let Some(expected) = self.dimension() {
            if embedding.dimension() != expected {
                return Err(StoreError::DimensionMismatch {
                    expected,
                    actual: embedding.dimension(),
                });
            }
        }

        self.embeddings.push(embedding);
        self.labels.push(label);

        if let Err(e) = self.persist() {
            self.embeddings.pop();
            self.labels.pop();
            tracing::error!(path = %self.path.display(), error = %e, "embedding store write failed");
            return Err(e);
        }

        tracing::debug!(
            path = %self.path.display(),
            embeddings = self.embeddings.len(),
            "embedding store persisted"
        );
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.embeddings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.embeddings.is_empty()
    }

    /// Dimension fixed by the first stored embedding.
    pub fn dimension(&self) -> Option<usize> {
        self.embeddings.first().map(Embedding::dimension)
    }

    /// Distinct labels, sorted.
    pub fn distinct_labels(&self) -> BTreeSet<&str> {
        self.labels.iter().map(String::as_str).collect()
    }

    pub fn embeddings(&self) -> &[Embedding] {
        &self.embeddings
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// Pairs in insertion order.
    pub fn entries(&self) -> impl Iterator<Item = (&Embedding, &str)> {
        self.embeddings
            .iter()
            .zip(self.labels.iter().map(String::as_str))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self) -> Result<(), StoreError> {
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)?;

        let file = StoreFile {
            version: STORE_FORMAT_VERSION,
            dimension: self.dimension(),
            embeddings: self.embeddings.clone(),
            labels: self.labels.clone(),
            checksum: checksum(&self.embeddings, &self.labels),
        };

        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        serde_json::to_writer(&mut tmp, &file)?;
        tmp.flush()?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path)?;

        // Make the rename itself durable.
        File::open(&dir)?.sync_all()?;
        Ok(())
    }
}

fn validate(path: &Path, file: &StoreFile) -> Result<(), StoreError> {
    let corrupt = |reason: String| StoreError::Corrupt {
        path: path.to_path_buf(),
        reason,
    };

    if file.version != STORE_FORMAT_VERSION {
        return Err(corrupt(format!("unsupported format version {}", file.version)));
    }
    if file.embeddings.len() != file.labels.len() {
        return Err(corrupt(format!(
            "{} embeddings but {} labels",
            file.embeddings.len(),
            file.labels.len()
        )));
    }
    let dimension = file.embeddings.first().map(Embedding::dimension);
    if dimension != file.dimension {
        return Err(corrupt(format!(
            "declared dimension {:?}, data has {:?}",
            file.dimension, dimension
        )));
    }
    for (i, (embedding, label)) in file.embeddings.iter().zip(&file.labels).enumerate() {
        if Some(embedding.dimension()) != dimension || !embedding.is_well_formed() {
            return Err(corrupt(format!("embedding {i} is malformed")));
        }
        if label.trim().is_empty() {
            return Err(corrupt(format!("label {i} is empty")));
        }
    }
    if checksum(&file.embeddings, &file.labels) != file.checksum {
        return Err(corrupt("checksum mismatch".into()));
    }
    Ok(())
}

/// SHA-256 over each label followed by its embedding's little-endian bytes.
fn checksum(embeddings: &[Embedding], labels: &[String]) -> String {
    let mut hasher = Sha256::new();
    for (embedding, label) in embeddings.iter().zip(labels) {
        hasher.update((label.len() as u64).to_le_bytes());
        hasher.update(label.as_bytes());
        for v in &embedding.values {
            hasher.update(v.to_le_bytes());
        }
    }
    format!("{:x}", hasher.finalize())
}
