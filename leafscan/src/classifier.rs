//! Calibrated classifier adapter.
//!
//! A [`Backbone`] turns a preprocessed NCHW batch into raw class scores. The
//! adapter divides those scores by per-class temperatures, softmaxes each view
//! and averages the views into one [`ClassProbability`].

use anyhow::Result;
use image::imageops::FilterType;
use image::RgbImage;
use ndarray::{Array2, Array4};
use serde::Serialize;

use crate::calibration::TemperatureTable;
use crate::classes::ClassVocabulary;
use crate::error::ClassifyError;
use crate::probability::ClassProbability;

pub const INPUT_SIZE: u32 = 224;
const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Raw scoring network. Implementations must be safe to share across
/// concurrent requests.
pub trait Backbone: Send + Sync {
    fn name(&self) -> &str;

    /// Pre-softmax scores, shape `[batch, classes]`.
    fn logits(&self, batch: &Array4<f32>) -> Result<Array2<f32>>;
}

/// Which network produced an output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ModelRole {
    Light,
    Heavy,
    Specialist,
    /// Heavy output after the specialist blend.
    Blend,
}

impl std::fmt::Display for ModelRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ModelRole::Light => "light",
            ModelRole::Heavy => "heavy",
            ModelRole::Specialist => "specialist",
            ModelRole::Blend => "heavy+specialist",
        };
        f.write_str(s)
    }
}

/// Resize each view to the network input and normalize into one NCHW batch.
pub fn preprocess_views(views: &[RgbImage]) -> Array4<f32> {
    let size = INPUT_SIZE as usize;
    let mut batch = Array4::<f32>::zeros((views.len(), 3, size, size));
    for (n, view) in views.iter().enumerate() {
        let resized = image::imageops::resize(view, INPUT_SIZE, INPUT_SIZE, FilterType::Triangle);
        for (x, y, pixel) in resized.enumerate_pixels() {
            for c in 0..3 {
                let value = pixel[c] as f32 / 255.0;
                batch[[n, c, y as usize, x as usize]] = (value - IMAGENET_MEAN[c]) / IMAGENET_STD[c];
            }
        }
    }
    batch
}

/// One model's verdict on a view set. Never mutated; refinement builds a new one.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifierOutput {
    pub probabilities: ClassProbability,
    pub top1_index: usize,
    pub top1_label: String,
    pub top1_confidence: f32,
    /// Top-1 minus top-2
    pub margin: f32,
    pub source_model: ModelRole,
}

impl ClassifierOutput {
    pub fn from_probabilities(
        probabilities: ClassProbability,
        vocab: &ClassVocabulary,
        source_model: ModelRole,
    ) -> Self {
        let top1_index = probabilities.argmax();
        Self {
            top1_label: vocab.label(top1_index).to_string(),
            top1_confidence: probabilities.confidence(),
            margin: probabilities.margin(),
            top1_index,
            probabilities,
            source_model,
        }
    }

    pub fn entropy(&self) -> f32 {
        self.probabilities.entropy()
    }
}

/// A backbone plus its calibration.
pub struct CalibratedClassifier {
    role: ModelRole,
    backbone: Box<dyn Backbone>,
    temperatures: TemperatureTable,
}

impl CalibratedClassifier {
    pub fn new(role: ModelRole, backbone: Box<dyn Backbone>, temperatures: TemperatureTable) -> Self {
        Self {
            role,
            backbone,
            temperatures,
        }
    }

    pub fn role(&self) -> ModelRole {
        self.role
    }

    pub fn name(&self) -> &str {
        self.backbone.name()
    }

    /// Mean calibrated probability vector over `views`.
    pub fn probabilities(&self, views: &[RgbImage]) -> Result<ClassProbability, ClassifyError> {
        if views.is_empty() {
            return Err(ClassifyError::internal("no views to classify"));
        }
        let batch = preprocess_views(views);
        let logits = self
            .backbone
            .logits(&batch)
            .map_err(|e| ClassifyError::internal(format!("{} inference failed: {e:#}", self.name())))?;

        let classes = self.temperatures.len();
        if logits.nrows() != views.len() || logits.ncols() != classes {
            return Err(ClassifyError::internal(format!(
                "{} returned shape {:?}, expected [{}, {classes}]",
                self.name(),
                logits.shape(),
                views.len()
            )));
        }

        let per_view: Vec<ClassProbability> = logits
            .rows()
            .into_iter()
            .map(|row| ClassProbability::from_logits(row, self.temperatures.values()))
            .collect();
        ClassProbability::mean(&per_view)
            .ok_or_else(|| ClassifyError::internal(format!("{} produced non-finite scores", self.name())))
    }

    pub fn infer(
        &self,
        views: &[RgbImage],
        vocab: &ClassVocabulary,
    ) -> Result<ClassifierOutput, ClassifyError> {
        let probabilities = self.probabilities(views)?;
        Ok(ClassifierOutput::from_probabilities(probabilities, vocab, self.role))
    }
}

/// Light and heavy outputs for the same view set.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelPair {
    pub light: ClassifierOutput,
    pub heavy: ClassifierOutput,
}

impl ModelPair {
    /// Equal-weight average the entropy checks look at.
    pub fn average(&self) -> ClassProbability {
        ClassProbability::average(&self.light.probabilities, &self.heavy.probabilities)
    }

    pub fn average_entropy(&self) -> f32 {
        self.average().entropy()
    }

    pub fn same_class(&self) -> bool {
        self.light.top1_index == self.heavy.top1_index
    }

    pub fn mean_confidence(&self) -> f32 {
        0.5 * (self.light.top1_confidence + self.heavy.top1_confidence)
    }

    pub fn min_margin(&self) -> f32 {
        self.light.margin.min(self.heavy.margin)
    }
}
