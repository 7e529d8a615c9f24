//! Leaf-presence gate and the rescue rules that can promote a borderline
//! image to "leaf detected".

use serde::Serialize;

use crate::class_rules::{self, guard_config};
use crate::classes::KnownClass;
use crate::classifier::ModelPair;
use crate::leaf_metrics::ImageMetrics;
use crate::rule_params::RuleParams;

/// Everything the pre-blend rules look at: base single-view outputs and the
/// image metrics.
#[derive(Debug, Clone, Copy)]
pub struct BaseEvidence<'a> {
    pub params: &'a RuleParams,
    pub metrics: &'a ImageMetrics,
    pub base: &'a ModelPair,
    pub light_class: Option<KnownClass>,
    pub heavy_class: Option<KnownClass>,
}

impl BaseEvidence<'_> {
    pub fn heavy_conf(&self) -> f32 {
        self.base.heavy.top1_confidence
    }

    pub fn heavy_margin(&self) -> f32 {
        self.base.heavy.margin
    }

    pub fn heavy_strong(&self) -> bool {
        let p = &self.params.heavy_rescue;
        self.heavy_conf() >= p.conf_min && self.heavy_margin() >= p.margin_min
    }

    pub fn red_dominated(&self) -> bool {
        let gate = &self.params.leaf_gate;
        self.metrics
            .red_dominated(gate.red_fraction_max, gate.red_exg_max)
    }
}

/// Why leaf presence holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LeafEvidence {
    Gate,
    Rescue(RescueRule),
}

/// Ordered promotions applied while leaf presence is still false.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RescueRule {
    /// Heavy model strongly confident, minimal color/edge support, not red-dominated.
    HeavyStrong,
    /// Necrosis-prone class with low chroma and corroborating edge or Lab signal.
    Necrosis,
    /// Powdery-mildew class with high confidence and edge support.
    Powdery,
    /// Small-leaf-tolerant healthy class with very high heavy confidence.
    SmallLeafHealthy,
}

/// Rescues evaluated before the leaf-scorch out-of-distribution check.
pub const EARLY_RESCUES: [RescueRule; 2] = [RescueRule::HeavyStrong, RescueRule::Necrosis];
/// Rescues evaluated after it.
pub const LATE_RESCUES: [RescueRule; 2] = [RescueRule::Powdery, RescueRule::SmallLeafHealthy];

impl RescueRule {
    pub fn applies(self, ev: &BaseEvidence) -> bool {
        let m = ev.metrics;
        let bb = &m.bounding_box;
        match self {
            RescueRule::HeavyStrong => {
                let p = &ev.params.heavy_rescue;
                ev.heavy_strong()
                    && m.leaf_mask_greenness_ratio >= p.greenness_min
                    && m.saturation_ratio >= p.saturation_min
                    && m.leaf_area_fraction >= p.area_min
                    && bb.edge_density_box >= p.edge_min
                    && bb.greenness_box >= p.exg_box_min
                    && !ev.red_dominated()
            }
            RescueRule::Necrosis => {
                let p = &ev.params.necrosis;
                if !p.enabled || !class_rules::is_member(&class_rules::NECROSIS_PRONE, ev.heavy_class)
                {
                    return false;
                }
                let relax = ev
                    .heavy_class
                    .and_then(guard_config)
                    .and_then(|cfg| cfg.necrosis_relax);
                let sat_max = relax.map_or(p.saturation_max, |r| r.saturation_max);
                let gy_max = relax.map_or(p.greenness_max, |r| r.greenness_max);

                let low_chroma = m.saturation_ratio <= sat_max && m.leaf_mask_greenness_ratio <= gy_max;
                let heavy_ok = ev.heavy_conf() >= p.heavy_conf_min && ev.heavy_margin() >= p.heavy_margin_min;
                let edge_ok = bb.edge_density_box >= p.edge_tau;
                let lab_ok = (p.lab_a_min..=p.lab_a_max).contains(&bb.lab_chroma_a)
                    && (p.lab_b_min..=p.lab_b_max).contains(&bb.lab_chroma_b);
                low_chroma && heavy_ok && (edge_ok || lab_ok)
            }
            RescueRule::Powdery => {
                let p = &ev.params.powdery;
                class_rules::is_member(&class_rules::POWDERY_MILDEW, ev.heavy_class)
                    && ev.heavy_conf() >= p.heavy_conf_min
                    && ev.heavy_margin() >= p.heavy_margin_min
                    && bb.edge_density_box >= p.edge_min
                    && bb.aspect_ratio <= p.max_aspect
            }
            RescueRule::SmallLeafHealthy => {
                let p = &ev.params.small_leaf;
                let healthy = class_rules::is_member(&class_rules::SMALL_LEAF_HEALTHY, ev.heavy_class)
                    || class_rules::is_member(&class_rules::SMALL_LEAF_HEALTHY, ev.light_class);
                healthy
                    && ev.heavy_conf() >= p.heavy_conf_min
                    && ev.heavy_margin() >= p.heavy_margin_min
                    && m.leaf_area_fraction >= p.area_min
                    && m.leaf_mask_greenness_ratio >= p.greenness_min
                    && m.saturation_ratio >= p.saturation_min
                    && bb.edge_density_box >= p.edge_min
                    && bb.greenness_box >= p.exg_box_min
            }
        }
    }
}

/// Leaf-presence state after one group of rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LeafPresence {
    pub is_leaf: bool,
    pub evidence: Option<LeafEvidence>,
}

impl LeafPresence {
    /// Metric gate only.
    pub fn gate(ev: &BaseEvidence) -> Self {
        let gate = &ev.params.leaf_gate;
        let is_leaf = ev.metrics.leaf_area_fraction >= gate.area_min
            && ev.metrics.mean_greenness_index >= gate.exg_min;
        Self {
            is_leaf,
            evidence: is_leaf.then_some(LeafEvidence::Gate),
        }
    }

    /// Apply `rules` in order until one promotes the image.
    pub fn rescue(self, ev: &BaseEvidence, rules: &[RescueRule]) -> Self {
        if self.is_leaf {
            return self;
        }
        match rules.iter().copied().find(|rule| rule.applies(ev)) {
            Some(rule) => {
                log::debug!("🌿 Leaf presence rescued by {rule:?}");
                Self {
                    is_leaf: true,
                    evidence: Some(LeafEvidence::Rescue(rule)),
                }
            }
            None => self,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::classes::ClassVocabulary;
    use crate::classifier::{ClassifierOutput, ModelRole};
    use crate::leaf_metrics::BoxMetrics;
    use crate::probability::ClassProbability;
    use ndarray::Array1;

    pub(crate) fn metrics(area: f32, gy: f32, sat: f32) -> ImageMetrics {
        ImageMetrics {
            leaf_area_fraction: area,
            mean_greenness_index: 0.0,
            leaf_mask_greenness_ratio: gy,
            bounding_box: BoxMetrics {
                greenness_box: 0.3,
                red_fraction_box: 0.0,
                edge_density_box: 0.05,
                lab_chroma_a: -20.0,
                lab_chroma_b: 30.0,
                aspect_ratio: 1.5,
                bounds: None,
            },
            saturation_ratio: sat,
            highlight_ratio: 0.0,
            water_like_ratio: 0.0,
        }
    }

    pub(crate) fn vocab() -> ClassVocabulary {
        ClassVocabulary::from_labels(vec![
            "Apple___healthy".into(),
            "Tomato___Late_blight".into(),
            "Cherry___Powdery_mildew".into(),
            "Strawberry___Leaf_scorch".into(),
            "Apple___Apple_scab".into(),
        ])
        .unwrap()
    }

    /// Output peaked on `index` with the given confidence; the rest is spread
    /// evenly.
    pub(crate) fn output(vocab: &ClassVocabulary, index: usize, conf: f32, role: ModelRole) -> ClassifierOutput {
        let n = vocab.len();
        let rest = (1.0 - conf) / (n - 1) as f32;
        let mut w = vec![rest; n];
        w[index] = conf;
        let p = ClassProbability::from_weights(Array1::from_vec(w)).unwrap();
        ClassifierOutput::from_probabilities(p, vocab, role)
    }

    pub(crate) fn pair(vocab: &ClassVocabulary, light: (usize, f32), heavy: (usize, f32)) -> ModelPair {
        ModelPair {
            light: output(vocab, light.0, light.1, ModelRole::Light),
            heavy: output(vocab, heavy.0, heavy.1, ModelRole::Heavy),
        }
    }

    fn evidence<'a>(
        params: &'a RuleParams,
        metrics: &'a ImageMetrics,
        base: &'a ModelPair,
        vocab: &ClassVocabulary,
    ) -> BaseEvidence<'a> {
        BaseEvidence {
            params,
            metrics,
            base,
            light_class: vocab.known(base.light.top1_index),
            heavy_class: vocab.known(base.heavy.top1_index),
        }
    }

    #[test]
    fn test_gate_requires_area_and_exg() {
        let params = RuleParams::default();
        let v = vocab();
        let base = pair(&v, (4, 0.5), (4, 0.5));
        let m = metrics(0.04, 0.2, 0.2);
        assert!(LeafPresence::gate(&evidence(&params, &m, &base, &v)).is_leaf);

        let mut low_exg = m;
        low_exg.mean_greenness_index = -0.5;
        assert!(!LeafPresence::gate(&evidence(&params, &low_exg, &base, &v)).is_leaf);

        let tiny = metrics(0.01, 0.2, 0.2);
        assert!(!LeafPresence::gate(&evidence(&params, &tiny, &base, &v)).is_leaf);
    }

    #[test]
    fn test_heavy_strong_rescue_blocked_by_red() {
        let params = RuleParams::default();
        let v = vocab();
        let base = pair(&v, (4, 0.5), (4, 0.90));
        let m = metrics(0.03, 0.10, 0.20);
        let ev = evidence(&params, &m, &base, &v);
        let presence = LeafPresence::gate(&ev).rescue(&ev, &EARLY_RESCUES);
        assert_eq!(
            presence.evidence,
            Some(LeafEvidence::Rescue(RescueRule::HeavyStrong))
        );

        let mut red = m;
        red.bounding_box.red_fraction_box = 0.5;
        red.bounding_box.greenness_box = -0.2;
        let ev = evidence(&params, &red, &base, &v);
        assert!(!LeafPresence::gate(&ev).rescue(&ev, &EARLY_RESCUES).is_leaf);
    }

    #[test]
    fn test_necrosis_rescue_uses_class_relax() {
        let params = RuleParams::default();
        let v = vocab();
        let base = pair(&v, (4, 0.5), (1, 0.85));
        // saturation 0.44 exceeds the generic 0.40 bound but not the 0.46 relax
        let mut m = metrics(0.01, 0.10, 0.44);
        m.bounding_box.edge_density_box = 0.0;
        m.bounding_box.lab_chroma_a = 5.0;
        m.bounding_box.lab_chroma_b = 20.0;
        let ev = evidence(&params, &m, &base, &v);
        assert!(RescueRule::Necrosis.applies(&ev));

        let base_other = pair(&v, (4, 0.5), (4, 0.85));
        let ev = evidence(&params, &m, &base_other, &v);
        assert!(!RescueRule::Necrosis.applies(&ev));
    }

    #[test]
    fn test_powdery_and_small_leaf_rescues() {
        let params = RuleParams::default();
        let v = vocab();
        let m = metrics(0.02, 0.07, 0.13);

        let powdery = pair(&v, (4, 0.5), (2, 0.95));
        let ev = evidence(&params, &m, &powdery, &v);
        assert!(RescueRule::Powdery.applies(&ev));

        let healthy = pair(&v, (0, 0.9), (0, 0.98));
        let ev = evidence(&params, &m, &healthy, &v);
        let presence = LeafPresence::gate(&ev).rescue(&ev, &LATE_RESCUES);
        assert_eq!(
            presence.evidence,
            Some(LeafEvidence::Rescue(RescueRule::SmallLeafHealthy))
        );
    }

    #[test]
    fn test_rescue_keeps_existing_leaf() {
        let params = RuleParams::default();
        let v = vocab();
        let base = pair(&v, (4, 0.5), (4, 0.5));
        let m = metrics(0.5, 0.5, 0.5);
        let ev = evidence(&params, &m, &base, &v);
        let presence = LeafPresence::gate(&ev).rescue(&ev, &EARLY_RESCUES);
        assert_eq!(presence.evidence, Some(LeafEvidence::Gate));
    }
}
