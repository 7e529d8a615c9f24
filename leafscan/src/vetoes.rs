//! Rules that reject an image outright.

use serde::Serialize;

use crate::class_rules::guard_config;
use crate::classes::{ClassVocabulary, KnownClass};
use crate::classifier::ClassifierOutput;
use crate::leaf_metrics::ImageMetrics;
use crate::probability::ClassProbability;
use crate::rule_params::RuleParams;
use crate::verdict::{Diagnostics, ReasonCode};

/// What a veto rule sees at the point it runs.
///
/// `heavy` is the base heavy output for presence vetoes and the blended one
/// for class vetoes.
#[derive(Debug, Clone, Copy)]
pub struct VetoInput<'a> {
    pub params: &'a RuleParams,
    pub metrics: &'a ImageMetrics,
    pub vocab: &'a ClassVocabulary,
    pub is_leaf: bool,
    pub light: &'a ClassifierOutput,
    pub heavy: &'a ClassifierOutput,
    pub ensemble: &'a ClassProbability,
}

impl VetoInput<'_> {
    fn heavy_class(&self) -> Option<KnownClass> {
        self.vocab.known(self.heavy.top1_index)
    }

    fn family_in_top_k(&self, probs: &ClassProbability, k: usize) -> bool {
        let family = &self.params.specialist.family;
        probs
            .top_k(k)
            .into_iter()
            .any(|i| self.vocab.in_family(i, family))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum VetoRule {
    /// Area and greenness both under the no-leaf floors, whatever else holds.
    ExtremeNoLeaf,
    /// Leaf-scorch prediction on something that does not look like a leaf.
    StrawberryOod,
    /// No leaf detected and at least one metric under its floor.
    NoLeaf,
    /// Water-like background while the specialist family is suspected.
    Water,
    /// Grass-like texture predicted as citrus greening.
    GrassPattern,
    /// Class that requires leaf evidence above its own hard floors.
    ClassHardFloor,
}

/// Checked before any rescue that could hide an empty frame.
pub const EXTREME_VETOES: [VetoRule; 1] = [VetoRule::ExtremeNoLeaf];
/// Checked between the early and late leaf rescues.
pub const EARLY_CLASS_VETOES: [VetoRule; 1] = [VetoRule::StrawberryOod];
/// Checked once leaf presence is final.
pub const PRESENCE_VETOES: [VetoRule; 2] = [VetoRule::NoLeaf, VetoRule::Water];
/// Checked on the blended heavy label.
pub const CLASS_VETOES: [VetoRule; 2] = [VetoRule::GrassPattern, VetoRule::ClassHardFloor];

/// A fired veto.
#[derive(Debug, Clone, PartialEq)]
pub struct Veto {
    pub rule: VetoRule,
    pub reason: ReasonCode,
    pub diagnostics: Diagnostics,
}

impl VetoRule {
    pub fn check(self, input: &VetoInput) -> Option<Veto> {
        let m = input.metrics;
        let bb = &m.bounding_box;
        let area = m.leaf_area_fraction;
        let gy = m.leaf_mask_greenness_ratio;
        let fire = |reason: ReasonCode, diagnostics: Diagnostics| {
            Some(Veto {
                rule: self,
                reason,
                diagnostics,
            })
        };

        match self {
            VetoRule::ExtremeNoLeaf => {
                let floors = &input.params.no_leaf;
                if !(area < floors.area && gy < floors.greenness) {
                    return None;
                }
                fire(ReasonCode::NoLeafVeto, Diagnostics::new().flag("extreme", true))
            }
            VetoRule::StrawberryOod => {
                if input.heavy_class() != Some(KnownClass::StrawberryLeafScorch) {
                    return None;
                }
                let p = &input.params.strawberry;
                let gate = &input.params.leaf_gate;
                let red = m.red_dominated(gate.red_fraction_max, gate.red_exg_max);
                let leafish = area >= p.leafish_area_min
                    && gy >= p.leafish_greenness_min
                    && bb.edge_density_box >= p.leafish_edge_min
                    && bb.greenness_box >= p.leafish_exg_box_min;
                let overrule = input.heavy.top1_confidence >= p.overrule_conf_min
                    && input.heavy.margin >= p.overrule_margin_min
                    && leafish
                    && !red;
                let weak = !input.is_leaf || area < p.area_min || gy < p.greenness_min;
                if overrule || !weak {
                    return None;
                }
                fire(
                    ReasonCode::OodVeto(KnownClass::StrawberryLeafScorch),
                    Diagnostics::new()
                        .flag("leafish", leafish)
                        .flag("red_dominated", red),
                )
            }
            VetoRule::NoLeaf => {
                let floors = &input.params.no_leaf;
                let weak = area < floors.area
                    || gy < floors.greenness
                    || m.saturation_ratio < floors.saturation;
                if input.is_leaf || !weak {
                    return None;
                }
                fire(ReasonCode::NoLeafVeto, Diagnostics::new())
            }
            VetoRule::Water => {
                let sp = &input.params.specialist;
                if m.water_like_ratio < sp.water_veto_fraction {
                    return None;
                }
                let suspected = input.vocab.in_family(input.heavy.top1_index, &sp.family)
                    || input.family_in_top_k(&input.light.probabilities, sp.water_top_k)
                    || input.family_in_top_k(input.ensemble, sp.water_top_k);
                if !suspected {
                    return None;
                }
                fire(
                    ReasonCode::WaterVeto,
                    Diagnostics::new().number("water_like_ratio", m.water_like_ratio),
                )
            }
            VetoRule::GrassPattern => {
                if input.heavy_class() != Some(KnownClass::OrangeHaunglongbing) {
                    return None;
                }
                let p = &input.params.grass;
                let grass = m.saturation_ratio >= p.saturation_min
                    && (p.greenness_lo..=p.greenness_hi).contains(&gy)
                    && area <= p.area_max;
                if !grass {
                    return None;
                }
                fire(
                    ReasonCode::OodVeto(KnownClass::OrangeHaunglongbing),
                    Diagnostics::new().text("pattern", "grass"),
                )
            }
            VetoRule::ClassHardFloor => {
                let class = input.heavy_class()?;
                let cfg = guard_config(class)?;
                if !cfg.hard_veto_hit(area, gy) {
                    return None;
                }
                fire(
                    ReasonCode::OodVeto(class),
                    Diagnostics::new().text("pattern", "hard_floor"),
                )
            }
        }
    }
}

/// First veto of `rules` that fires.
pub fn first_veto(rules: &[VetoRule], input: &VetoInput) -> Option<Veto> {
    let veto = rules.iter().find_map(|rule| rule.check(input))?;
    log::debug!("⛔ {:?} fired: {}", veto.rule, veto.reason);
    Some(veto)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::ModelRole;
    use crate::leaf_presence::tests::{metrics, output};

    fn vocab() -> ClassVocabulary {
        ClassVocabulary::from_labels(vec![
            "Apple___healthy".into(),
            "Strawberry___Leaf_scorch".into(),
            "Orange___Haunglongbing_(Citrus_greening)".into(),
            "Rice___Leaf_Blast".into(),
            "Rice___Brown_Spot".into(),
        ])
        .unwrap()
    }

    struct Fixture {
        params: RuleParams,
        vocab: ClassVocabulary,
        light: ClassifierOutput,
        heavy: ClassifierOutput,
    }

    impl Fixture {
        fn new(light: (usize, f32), heavy: (usize, f32)) -> Self {
            let vocab = vocab();
            Self {
                params: RuleParams::default(),
                light: output(&vocab, light.0, light.1, ModelRole::Light),
                heavy: output(&vocab, heavy.0, heavy.1, ModelRole::Heavy),
                vocab,
            }
        }

        fn check(&self, rule: VetoRule, metrics: &ImageMetrics, is_leaf: bool) -> Option<Veto> {
            let ensemble = ClassProbability::average(&self.light.probabilities, &self.heavy.probabilities);
            let input = VetoInput {
                params: &self.params,
                metrics,
                vocab: &self.vocab,
                is_leaf,
                light: &self.light,
                heavy: &self.heavy,
                ensemble: &ensemble,
            };
            rule.check(&input)
        }
    }

    #[test]
    fn test_extreme_no_leaf_ignores_leaf_flag() {
        let fx = Fixture::new((0, 0.99), (0, 0.99));
        let m = metrics(0.01, 0.02, 0.5);
        let veto = fx.check(VetoRule::ExtremeNoLeaf, &m, true).unwrap();
        assert_eq!(veto.reason, ReasonCode::NoLeafVeto);
        assert!(fx.check(VetoRule::ExtremeNoLeaf, &metrics(0.01, 0.2, 0.5), true).is_none());
    }

    #[test]
    fn test_no_leaf_needs_missing_leaf_and_a_weak_metric() {
        let fx = Fixture::new((0, 0.6), (0, 0.6));
        let low_sat = metrics(0.3, 0.3, 0.05);
        assert!(fx.check(VetoRule::NoLeaf, &low_sat, false).is_some());
        assert!(fx.check(VetoRule::NoLeaf, &low_sat, true).is_none());
        assert!(fx.check(VetoRule::NoLeaf, &metrics(0.3, 0.3, 0.3), false).is_none());
    }

    #[test]
    fn test_strawberry_veto_and_overrule() {
        let weak = Fixture::new((0, 0.6), (1, 0.80));
        let m = metrics(0.14, 0.20, 0.3);
        let veto = weak.check(VetoRule::StrawberryOod, &m, true).unwrap();
        assert_eq!(veto.reason.to_string(), "Strawberry_OOD_Veto");

        // confident heavy model on a leafish region overrules the veto
        let strong = Fixture::new((0, 0.6), (1, 0.97));
        assert!(strong.check(VetoRule::StrawberryOod, &m, true).is_none());

        // large green leaf is not vetoed even with a weaker model
        let big = metrics(0.40, 0.40, 0.3);
        assert!(weak.check(VetoRule::StrawberryOod, &big, true).is_none());
    }

    #[test]
    fn test_water_veto_when_family_suspected() {
        let mut m = metrics(0.4, 0.4, 0.4);
        m.water_like_ratio = 0.2;
        let rice = Fixture::new((0, 0.6), (3, 0.7));
        assert_eq!(
            rice.check(VetoRule::Water, &m, true).unwrap().reason,
            ReasonCode::WaterVeto
        );

        let apple = Fixture::new((0, 0.9), (0, 0.9));
        let mut dry = m;
        dry.water_like_ratio = 0.05;
        assert!(apple.check(VetoRule::Water, &dry, true).is_none());
    }

    #[test]
    fn test_grass_pattern_for_citrus_greening() {
        let fx = Fixture::new((0, 0.6), (2, 0.9));
        let grass = metrics(0.10, 0.18, 0.70);
        assert_eq!(
            fx.check(VetoRule::GrassPattern, &grass, true).unwrap().reason.to_string(),
            "Orange_OOD_Veto"
        );
        assert!(fx.check(VetoRule::GrassPattern, &metrics(0.30, 0.18, 0.70), true).is_none());
    }

    #[test]
    fn test_class_hard_floor() {
        let fx = Fixture::new((0, 0.6), (2, 0.9));
        assert!(fx.check(VetoRule::ClassHardFloor, &metrics(0.05, 0.3, 0.3), true).is_some());
        assert!(fx.check(VetoRule::ClassHardFloor, &metrics(0.30, 0.3, 0.3), true).is_none());

        let apple = Fixture::new((0, 0.6), (0, 0.9));
        assert!(apple.check(VetoRule::ClassHardFloor, &metrics(0.0, 0.0, 0.0), true).is_none());
    }

    #[test]
    fn test_first_veto_respects_order() {
        let fx = Fixture::new((0, 0.6), (3, 0.7));
        let mut m = metrics(0.01, 0.3, 0.3);
        m.water_like_ratio = 0.5;
        let ensemble = ClassProbability::average(&fx.light.probabilities, &fx.heavy.probabilities);
        let input = VetoInput {
            params: &fx.params,
            metrics: &m,
            vocab: &fx.vocab,
            is_leaf: false,
            light: &fx.light,
            heavy: &fx.heavy,
            ensemble: &ensemble,
        };
        let veto = first_veto(&PRESENCE_VETOES, &input).unwrap();
        assert_eq!(veto.rule, VetoRule::NoLeaf);
    }
}
