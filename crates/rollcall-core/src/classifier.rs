//! Identity classifier rebuilt from the embedding store.
//!
//! A fitted standard scaler, a sorted label encoder and a multinomial
//! logistic regression form one [`TrainedModel`]. Training is full-batch
//! gradient descent from zero weights, so the same store always yields
//! the same model.

use crate::store::EmbeddingStore;
use crate::types::{Embedding, Prediction};
use ndarray::{Array1, Array2, ArrayView1, Axis};
use thiserror::Error;

// --- Training hyperparameters ---
const TRAIN_EPOCHS: usize = 400;
const LEARNING_RATE: f32 = 0.5;
const L2_PENALTY: f32 = 1e-3;
/// Minimum number of distinct identities for a multiclass model.
pub const MIN_CLASSES: usize = 2;

#[derive(Error, Debug, PartialEq)]
pub enum ClassifierError {
    #[error("classifier not trained, at least 2 distinct identities must be enrolled")]
    ModelNotReady,
    #[error("probe has {actual} dimensions, model expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("probe contains non-finite values")]
    MalformedEmbedding,
}

/// Per-dimension zero-mean, unit-variance normalizer.
#[derive(Debug, Clone)]
pub struct StandardScaler {
    mean: Array1<f32>,
    scale: Array1<f32>,
}

impl StandardScaler {
    pub fn fit(x: &Array2<f32>) -> Self {
        let n = x.nrows().max(1) as f32;
        let mean = x.sum_axis(Axis(0)) / n;
        let centered = x - &mean;
        let variance = centered.mapv(|v| v * v).sum_axis(Axis(0)) / n;
        // Constant dimensions keep their centered value of zero.
        let scale = variance.mapv(|v| {
            let sd = v.sqrt();
            if sd > f32::EPSILON { sd } else { 1.0 }
        });
        Self { mean, scale }
    }

    pub fn dimension(&self) -> usize {
        self.mean.len()
    }

    pub fn transform(&self, x: &Array2<f32>) -> Array2<f32> {
        (x - &self.mean) / &self.scale
    }

    pub fn transform_one(&self, v: ArrayView1<f32>) -> Array1<f32> {
        (&v - &self.mean) / &self.scale
    }
}

/// Deterministic label <-> class index mapping (sorted order).
#[derive(Debug, Clone)]
pub struct LabelEncoder {
    classes: Vec<String>,
}

impl LabelEncoder {
    pub fn fit<'a>(labels: impl IntoIterator<Item = &'a str>) -> Self {
        let mut classes: Vec<String> = labels.into_iter().map(str::to_string).collect();
        classes.sort();
        classes.dedup();
        Self { classes }
    }

    pub fn encode(&self, label: &str) -> Option<usize> {
        self.classes.binary_search_by(|c| c.as_str().cmp(label)).ok()
    }

    pub fn decode(&self, index: usize) -> Option<&str> {
        self.classes.get(index).map(String::as_str)
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }
}

/// Linear softmax classifier: `p = softmax(W x + b)`.
#[derive(Debug, Clone)]
pub struct SoftmaxRegression {
    weights: Array2<f32>,
    bias: Array1<f32>,
}

impl SoftmaxRegression {
    /// Fit on rows of `x` against class indices `y` in `0..n_classes`.
    pub fn fit(x: &Array2<f32>, y: &[usize], n_classes: usize) -> Self {
        let (n, dim) = x.dim();
        let mut weights = Array2::<f32>::zeros((n_classes, dim));
        let mut bias = Array1::<f32>::zeros(n_classes);

        let mut targets = Array2::<f32>::zeros((n, n_classes));
        for (row, &class) in y.iter().enumerate() {
            targets[[row, class]] = 1.0;
        }
        let inv_n = 1.0 / n.max(1) as f32;

        for _ in 0..TRAIN_EPOCHS {
            let mut probs = x.dot(&weights.t()) + &bias;
            for row in probs.rows_mut() {
                softmax_in_place(row);
            }
            let residual = (probs - &targets) * inv_n;
            let grad_w = residual.t().dot(x) + &weights * L2_PENALTY;
            let grad_b = residual.sum_axis(Axis(0));
            weights.scaled_add(-LEARNING_RATE, &grad_w);
            bias.scaled_add(-LEARNING_RATE, &grad_b);
        }

        Self { weights, bias }
    }

    pub fn predict_proba(&self, x: ArrayView1<f32>) -> Array1<f32> {
        let mut logits = self.weights.dot(&x) + &self.bias;
        softmax_in_place(logits.view_mut());
        logits
    }
}

fn softmax_in_place(mut row: ndarray::ArrayViewMut1<f32>) {
    let max = row.fold(f32::NEG_INFINITY, |acc, &v| acc.max(v));
    row.mapv_inplace(|v| (v - max).exp());
    let sum = row.sum();
    if sum > 0.0 {
        row.mapv_inplace(|v| v / sum);
    }
}

/// Fitted normalizer, mapping and model, replaced together.
#[derive(Debug, Clone)]
pub struct TrainedModel {
    scaler: StandardScaler,
    encoder: LabelEncoder,
    model: SoftmaxRegression,
}

/// Classifier state derived from the store contents.
#[derive(Debug, Clone, Default)]
pub enum ClassifierState {
    #[default]
    Untrained,
    Trained(TrainedModel),
}

impl ClassifierState {
    /// Rebuild from the entire store.
    pub fn retrain(store: &EmbeddingStore) -> Self {
        let distinct = store.distinct_labels();
        if store.is_empty() || distinct.len() < MIN_CLASSES {
            tracing::info!(
                embeddings = store.len(),
                identities = distinct.len(),
                required = MIN_CLASSES,
                "not enough distinct identities to train"
            );
            return Self::Untrained;
        }

        let dim = store.dimension().unwrap_or(0);
        let embeddings = store.embeddings();
        let x = Array2::from_shape_fn((embeddings.len(), dim), |(i, j)| embeddings[i].values[j]);

        let encoder = LabelEncoder::fit(distinct.iter().copied());
        let y: Vec<usize> = store
            .labels()
            .iter()
            .filter_map(|label| encoder.encode(label))
            .collect();

        let scaler = StandardScaler::fit(&x);
        let model = SoftmaxRegression::fit(&scaler.transform(&x), &y, encoder.classes().len());

        tracing::info!(
            embeddings = store.len(),
            identities = encoder.classes().len(),
            dimension = dim,
            "classifier retrained"
        );

        Self::Trained(TrainedModel {
            scaler,
            encoder,
            model,
        })
    }

    pub fn is_trained(&self) -> bool {
        matches!(self, Self::Trained(_))
    }

    /// Labels the model can return (empty when untrained).
    pub fn classes(&self) -> &[String] {
        match self {
            Self::Untrained => &[],
            Self::Trained(m) => m.encoder.classes(),
        }
    }

    /// Classify a probe. Always returns the best-matching known identity.
    pub fn predict(&self, embedding: &Embedding) -> Result<Prediction, ClassifierError> {
        let Self::Trained(trained) = self else {
            return Err(ClassifierError::ModelNotReady);
        };

        let expected = trained.scaler.dimension();
        if embedding.dimension() != expected {
            return Err(ClassifierError::DimensionMismatch {
                expected,
                actual: embedding.dimension(),
            });
        }
        if !embedding.is_well_formed() {
            return Err(ClassifierError::MalformedEmbedding);
        }

        let scaled = trained
            .scaler
            .transform_one(ArrayView1::from(embedding.values.as_slice()));
        let probs = trained.model.predict_proba(scaled.view());

        let mut best_idx = 0usize;
        let mut best_prob = f32::NEG_INFINITY;
        for (i, &p) in probs.iter().enumerate() {
            if p > best_prob {
                best_prob = p;
                best_idx = i;
            }
        }

        let label = trained
            .encoder
            .decode(best_idx)
            .ok_or(ClassifierError::ModelNotReady)?
            .to_string();

        Ok(Prediction {
            label,
            confidence: best_prob,
        })
    }
}
