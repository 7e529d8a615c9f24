//! Specialist hybrid blend for one crop family.
//!
//! When the primary heavy model looks unsure inside the specialist's family,
//! the specialist's full-TTA probabilities are mixed into the heavy vector as
//! `(1-α)·heavy + α·specialist`. The heavy vector is replaced, never the
//! label alone, so entropy and consensus checks downstream see a continuous
//! distribution.

use serde::Serialize;

use crate::classes::ClassVocabulary;
use crate::classifier::{ClassifierOutput, ModelPair, ModelRole};
use crate::error::ClassifyError;
use crate::leaf_metrics::ImageMetrics;
use crate::probability::ClassProbability;
use crate::rule_params::SpecialistParams;
use crate::tta::Refiner;

/// Which trigger admitted the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SpecialistGate {
    /// Large green leaf, family in the ensemble top-k.
    Primary,
    /// Elongated leaf with a hesitant heavy model.
    Alternate,
}

#[derive(Debug, Clone, Copy)]
pub struct SpecialistInput<'a> {
    pub params: &'a SpecialistParams,
    pub metrics: &'a ImageMetrics,
    pub vocab: &'a ClassVocabulary,
    pub is_leaf: bool,
    pub base: &'a ModelPair,
    pub ensemble: &'a ClassProbability,
}

impl SpecialistInput<'_> {
    fn in_top_k(&self, probs: &ClassProbability, k: usize) -> bool {
        probs
            .top_k(k)
            .into_iter()
            .any(|i| self.vocab.in_family(i, &self.params.family))
    }

    fn heavy_in_family(&self) -> bool {
        self.vocab
            .in_family(self.base.heavy.top1_index, &self.params.family)
    }
}

/// Decide whether the specialist should run.
pub fn trigger(input: &SpecialistInput) -> Option<SpecialistGate> {
    let p = input.params;
    let m = input.metrics;
    let heavy = &input.base.heavy;

    let common = input.is_leaf
        && m.leaf_mask_greenness_ratio >= p.greenness_min
        && input.base.average_entropy() <= p.entropy_max
        && input.in_top_k(&input.base.light.probabilities, p.light_top_k)
        && m.water_like_ratio < p.water_veto_fraction;
    if !common {
        return None;
    }

    let primary = m.leaf_area_fraction >= p.area_min
        && (input.heavy_in_family() || input.in_top_k(input.ensemble, p.ensemble_top_k));
    if primary {
        return Some(SpecialistGate::Primary);
    }

    let alternate = m.leaf_area_fraction >= p.alt_area_min
        && m.bounding_box.aspect_ratio >= p.alt_aspect_min
        && heavy.margin <= p.alt_heavy_margin_max
        && heavy.top1_confidence <= p.alt_heavy_conf_max
        && (input.heavy_in_family() || input.in_top_k(input.ensemble, p.alt_ensemble_top_k));
    alternate.then_some(SpecialistGate::Alternate)
}

/// Heavy output after the blend.
pub fn blend(
    heavy: &ClassifierOutput,
    specialist: &ClassProbability,
    alpha: f32,
    vocab: &ClassVocabulary,
) -> ClassifierOutput {
    let alpha = alpha.clamp(0.0, 1.0);
    let mixed = heavy.probabilities.blend(specialist, alpha);
    ClassifierOutput::from_probabilities(mixed, vocab, ModelRole::Blend)
}

/// Run the trigger and, when it fires and a specialist is loaded, return the
/// blended heavy output.
pub fn apply(
    input: &SpecialistInput,
    refiner: &dyn Refiner,
) -> Result<Option<(SpecialistGate, ClassifierOutput)>, ClassifyError> {
    if !refiner.has_specialist() {
        return Ok(None);
    }
    let Some(gate) = trigger(input) else {
        return Ok(None);
    };
    let Some(specialist) = refiner.specialist()? else {
        return Ok(None);
    };
    if specialist.len() != input.base.heavy.probabilities.len() {
        return Err(ClassifyError::internal(format!(
            "specialist returned {} classes, expected {}",
            specialist.len(),
            input.base.heavy.probabilities.len()
        )));
    }
    let blended = blend(
        &input.base.heavy,
        &specialist,
        input.params.blend_alpha,
        input.vocab,
    );
    log::debug!(
        "🌾 Specialist blend via {gate:?}: {} {:.3} -> {} {:.3}",
        input.base.heavy.top1_label,
        input.base.heavy.top1_confidence,
        blended.top1_label,
        blended.top1_confidence
    );
    Ok(Some((gate, blended)))
}
