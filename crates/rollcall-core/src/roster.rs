//! The enrolled-identity roster: embedding store and classifier held as
//! one unit behind a single lock.

use crate::classifier::{ClassifierError, ClassifierState};
use crate::store::{EmbeddingStore, StoreError};
use crate::types::{Embedding, Prediction};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum MatchError {
    #[error("no identities enrolled")]
    NoEnrolledIdentities,
    #[error(transparent)]
    Classifier(#[from] ClassifierError),
}

/// Snapshot of the roster for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RosterStatus {
    pub embeddings: usize,
    pub identities: usize,
    pub dimension: Option<usize>,
    pub trained: bool,
}

struct RosterInner {
    store: EmbeddingStore,
    classifier: ClassifierState,
    /// Set while an append is in flight; cleared once the classifier caught up.
    dirty: bool,
}

/// Store + classifier. The classifier never reflects an older store than
/// the one on disk: appends and retrains happen under the same lock.
pub struct Roster {
    inner: Mutex<RosterInner>,
}

impl Roster {
    /// Load the store at `path` and train on its contents.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        Ok(Self::from_store(EmbeddingStore::load(path)?))
    }

    pub fn from_store(store: EmbeddingStore) -> Self {
        let classifier = ClassifierState::retrain(&store);
        Self {
            inner: Mutex::new(RosterInner { store, classifier, dirty: false }),
        }
    }

    // The poison flag stays set for the life of the mutex. Only a guard
    // dropped mid-enroll leaves `dirty` behind, so later acquisitions of a
    // poisoned lock retrain at most once.
    fn lock(&self) -> MutexGuard<'_, RosterInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            let mut inner = poisoned.into_inner();
            if inner.dirty {
                tracing::warn!("roster lock poisoned during enroll; retraining from store");
                inner.classifier = ClassifierState::retrain(&inner.store);
                inner.dirty = false;
            }
            inner
        })
    }

    /// Append one labeled embedding, persist, and retrain before returning.
    pub fn enroll(&self, embedding: Embedding, label: &str) -> Result<RosterStatus, StoreError> {
        let mut inner = self.lock();
        inner.dirty = true;
        let appended = inner.store.append(embedding, label);
        if appended.is_ok() {
            inner.classifier = ClassifierState::retrain(&inner.store);
        }
        inner.dirty = false;
        appended?;
        Ok(status_of(&inner))
    }

    pub fn predict(&self, embedding: &Embedding) -> Result<Prediction, MatchError> {
        let inner = self.lock();
        if inner.store.is_empty() {
            return Err(MatchError::NoEnrolledIdentities);
        }
        Ok(inner.classifier.predict(embedding)?)
    }

    pub fn status(&self) -> RosterStatus {
        status_of(&self.lock())
    }

    pub fn len(&self) -> usize {
        self.lock().store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().store.is_empty()
    }

    /// Sorted distinct labels currently enrolled.
    pub fn identities(&self) -> Vec<String> {
        self.lock()
            .store
            .distinct_labels()
            .into_iter()
            .map(str::to_string)
            .collect()
    }
}

fn status_of(inner: &RosterInner) -> RosterStatus {
    RosterStatus {
        embeddings: inner.store.len(),
        identities: inner.store.distinct_labels().len(),
        dimension: inner.store.dimension(),
        trained: inner.classifier.is_trained(),
    }
}
