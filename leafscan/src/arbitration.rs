//! Final decision: every rule of the pipeline in its fixed precedence.
//!
//! 1. extreme no-leaf veto
//! 2. leaf presence (gate, early rescues), leaf-scorch OOD veto, late rescues
//! 3. no-leaf and water vetoes
//! 4. specialist blend
//! 5. class vetoes on the blended heavy label
//! 6. large-leaf heavy override
//! 7. entropy gate with TTA escalation
//! 8. consensus, then heavy-dominant acceptance
//! 9. light-dominance correction of the ensemble
//! 10. global guard, guard override
//! 11. ensemble arg-max

use serde::Serialize;

use crate::class_guard::{guard_override_blocker, ClassGuard, GuardInput, Opinion, OverrideInput};
use crate::classes::ClassVocabulary;
use crate::classifier::ModelPair;
use crate::entropy_gate::{effective_threshold, EntropyGate, GateOutcome, GateStage, ThresholdInput};
use crate::error::ClassifyError;
use crate::leaf_metrics::ImageMetrics;
use crate::leaf_presence::{BaseEvidence, LeafPresence, EARLY_RESCUES, LATE_RESCUES};
use crate::probability::{ensemble, ClassProbability};
use crate::rule_params::RuleParams;
use crate::specialist::{self, SpecialistGate, SpecialistInput};
use crate::tta::Refiner;
use crate::verdict::{Diagnostics, FinalVerdict, Provenance, ReasonCode, Signals};
use crate::vetoes::{
    first_veto, Veto, VetoInput, CLASS_VETOES, EARLY_CLASS_VETOES, EXTREME_VETOES, PRESENCE_VETOES,
};

/// Inputs of the acceptance rules.
#[derive(Debug, Clone, Copy)]
pub struct AcceptInput<'a> {
    pub params: &'a RuleParams,
    pub metrics: &'a ImageMetrics,
    pub vocab: &'a ClassVocabulary,
    pub is_leaf: bool,
    pub pair: &'a ModelPair,
}

impl AcceptInput<'_> {
    /// Both confidences sit at or under the guard floor and neither reaches
    /// the pick override. Only the guard may decide such images.
    fn under_guard_floor(&self) -> bool {
        let g = &self.params.guard;
        let cm = self.pair.light.top1_confidence;
        let cr = self.pair.heavy.top1_confidence;
        cm <= g.gate_min && cr <= g.gate_min && cm.max(cr) < g.pick_override
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AcceptRule {
    /// Large leaf with a reasonably confident heavy model.
    LeafOverride,
    /// Both models agree with supporting metrics.
    Consensus,
    /// Heavy model dominant outside the specialist family.
    HeavyDominant,
}

/// Checked before the entropy gate.
pub const PRE_GATE_ACCEPTS: [AcceptRule; 1] = [AcceptRule::LeafOverride];
/// Checked on the gated outputs.
pub const POST_GATE_ACCEPTS: [AcceptRule; 2] = [AcceptRule::Consensus, AcceptRule::HeavyDominant];

#[derive(Debug, Clone, PartialEq)]
pub struct Acceptance {
    pub rule: AcceptRule,
    pub label: String,
    pub confidence: f32,
    pub provenance: Provenance,
    pub reason: ReasonCode,
}

impl AcceptRule {
    pub fn check(self, input: &AcceptInput) -> Option<Acceptance> {
        let m = input.metrics;
        let bb = &m.bounding_box;
        let light = &input.pair.light;
        let heavy = &input.pair.heavy;

        match self {
            AcceptRule::LeafOverride => {
                let p = &input.params.leaf_override;
                let fires = input.is_leaf
                    && !input.under_guard_floor()
                    && m.leaf_area_fraction >= p.leaf_min
                    && heavy.top1_confidence >= p.heavy_min
                    && heavy.margin >= p.heavy_margin_min;
                fires.then(|| Acceptance {
                    rule: self,
                    label: heavy.top1_label.clone(),
                    confidence: heavy.top1_confidence,
                    provenance: Provenance::Heavy,
                    reason: ReasonCode::LeafOverride,
                })
            }
            AcceptRule::Consensus => {
                let p = &input.params.consensus;
                let fires = input.is_leaf
                    && input.pair.same_class()
                    && input.pair.mean_confidence() >= p.mean_conf_min
                    && input.pair.min_margin() >= p.min_margin_min
                    && input.pair.average_entropy() <= p.entropy_cap
                    && m.leaf_mask_greenness_ratio >= p.greenness_min
                    && bb.edge_density_box >= p.edge_min
                    && bb.aspect_ratio <= p.max_aspect;
                fires.then(|| Acceptance {
                    rule: self,
                    label: light.top1_label.clone(),
                    confidence: input.pair.mean_confidence(),
                    provenance: Provenance::Both,
                    reason: ReasonCode::Consensus,
                })
            }
            AcceptRule::HeavyDominant => {
                let p = &input.params.heavy_high;
                let family = &input.params.specialist.family;
                let supported = !input.vocab.in_family(heavy.top1_index, family)
                    && input.is_leaf
                    && !input.under_guard_floor()
                    && m.leaf_area_fraction >= p.leaf_min
                    && m.leaf_mask_greenness_ratio >= p.greenness_min
                    && m.saturation_ratio >= p.saturation_min
                    && bb.edge_density_box >= p.edge_min;
                let absolute =
                    heavy.top1_confidence >= p.abs_conf_min && heavy.margin >= p.abs_margin_min;
                let fires = supported
                    && (input.pair.same_class() || absolute)
                    && input.pair.average_entropy() <= p.entropy_cap;
                fires.then(|| Acceptance {
                    rule: self,
                    label: heavy.top1_label.clone(),
                    confidence: heavy.top1_confidence,
                    provenance: Provenance::Heavy,
                    reason: ReasonCode::HeavyDominant,
                })
            }
        }
    }
}

pub fn first_acceptance(rules: &[AcceptRule], input: &AcceptInput) -> Option<Acceptance> {
    let accepted = rules.iter().find_map(|rule| rule.check(input))?;
    log::debug!(
        "✅ {:?} accepted {} ({:.3})",
        accepted.rule,
        accepted.label,
        accepted.confidence
    );
    Some(accepted)
}

/// Ensemble vector with the light-dominance correction applied when its
/// conditions hold. Returns the vector and whether it was corrected.
pub fn corrected_ensemble(
    params: &RuleParams,
    vocab: &ClassVocabulary,
    is_leaf: bool,
    pair: &ModelPair,
) -> (ClassProbability, bool) {
    let e = &params.ensemble;
    let c = &params.correction;
    let family = &params.specialist.family;
    let base = ensemble(
        &pair.light.probabilities,
        &pair.heavy.probabilities,
        e.mode,
        e.light_weight,
        e.heavy_weight,
    );

    let light = &pair.light;
    let heavy = &pair.heavy;
    let applies = is_leaf
        && vocab.in_family(base.argmax(), family)
        && !vocab.in_family(light.top1_index, family)
        && light.top1_confidence >= heavy.top1_confidence + c.conf_gap_min
        && light.margin >= c.light_margin_min
        && pair.average_entropy() >= c.entropy_min;
    if applies {
        log::debug!("Light-dominance correction toward {}", light.top1_label);
        let corrected = ClassProbability::weighted(
            &light.probabilities,
            c.light_weight,
            &heavy.probabilities,
            c.heavy_weight,
        );
        (corrected, true)
    } else {
        (base, false)
    }
}

/// What happened on the way to the verdict.
#[derive(Debug, Clone, PartialEq)]
pub struct DecisionTrace {
    /// Outputs the last rule looked at
    pub pair: ModelPair,
    /// Ensemble of `pair` (corrected when the correction fired)
    pub ensemble: ClassProbability,
    pub leaf: Option<LeafPresence>,
    pub specialist: Option<SpecialistGate>,
    pub gate_stage: Option<GateStage>,
    pub signals: Signals,
    /// Human-readable reason, the guard's text when it decided
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub verdict: FinalVerdict,
    pub trace: DecisionTrace,
}

/// Accumulates the trace while rules run.
struct Tracker<'a> {
    params: &'a RuleParams,
    metrics: &'a ImageMetrics,
    pair: ModelPair,
    leaf: Option<LeafPresence>,
    specialist: Option<SpecialistGate>,
    gate_stage: Option<GateStage>,
    ensemble: Option<ClassProbability>,
}

impl Tracker<'_> {
    fn signals(&self) -> Signals {
        let l = &self.pair.light;
        let h = &self.pair.heavy;
        Signals::from_metrics(self.metrics).with_models(
            l.top1_confidence,
            l.margin,
            h.top1_confidence,
            h.margin,
        )
    }

    fn trace(self, reason: String) -> DecisionTrace {
        let e = &self.params.ensemble;
        let signals = self.signals();
        let ensemble = self.ensemble.unwrap_or_else(|| {
            ensemble(
                &self.pair.light.probabilities,
                &self.pair.heavy.probabilities,
                e.mode,
                e.light_weight,
                e.heavy_weight,
            )
        });
        DecisionTrace {
            pair: self.pair,
            ensemble,
            leaf: self.leaf,
            specialist: self.specialist,
            gate_stage: self.gate_stage,
            signals,
            reason,
        }
    }

    fn reject(self, reason: ReasonCode, extra: Diagnostics) -> Decision {
        log::debug!("⛔ Rejected: {reason}");
        let diagnostics = Diagnostics::new()
            .map("signals", self.signals().to_diagnostics())
            .extend(extra);
        let text = reason.to_string();
        Decision {
            verdict: FinalVerdict::Rejected {
                reason_code: reason,
                diagnostics,
            },
            trace: self.trace(text),
        }
    }

    fn veto(self, veto: Veto) -> Decision {
        let extra = veto.diagnostics.text("rule", format!("{:?}", veto.rule));
        self.reject(veto.reason, extra)
    }

    fn accept(
        self,
        label: String,
        confidence: f32,
        provenance: Provenance,
        reason: ReasonCode,
        extra: Diagnostics,
    ) -> Decision {
        let diagnostics = Diagnostics::new()
            .map("signals", self.signals().to_diagnostics())
            .extend(extra);
        let text = reason.to_string();
        Decision {
            verdict: FinalVerdict::Accepted {
                label,
                confidence,
                contributing_model: provenance,
                reason_code: reason,
                diagnostics,
            },
            trace: self.trace(text),
        }
    }

    fn accepted(self, a: Acceptance) -> Decision {
        let extra = Diagnostics::new().text("rule", format!("{:?}", a.rule));
        self.accept(a.label, a.confidence, a.provenance, a.reason, extra)
    }
}

/// Run every rule against one image's metrics and base outputs.
///
/// `refiner` is called back for TTA refinement and the specialist only when
/// the rules ask for it.
pub fn decide(
    params: &RuleParams,
    vocab: &ClassVocabulary,
    metrics: &ImageMetrics,
    base: ModelPair,
    refiner: &dyn Refiner,
) -> Result<Decision, ClassifyError> {
    let e = &params.ensemble;
    let base_ensemble = ensemble(
        &base.light.probabilities,
        &base.heavy.probabilities,
        e.mode,
        e.light_weight,
        e.heavy_weight,
    );
    let mut tracker = Tracker {
        params,
        metrics,
        pair: base.clone(),
        leaf: None,
        specialist: None,
        gate_stage: None,
        ensemble: None,
    };
    if let Some(veto) = first_veto(
        &EXTREME_VETOES,
        &presence_input(params, metrics, vocab, false, &base, &base_ensemble),
    ) {
        return Ok(tracker.veto(veto));
    }

    // leaf presence
    let evidence = BaseEvidence {
        params,
        metrics,
        base: &base,
        light_class: vocab.known(base.light.top1_index),
        heavy_class: vocab.known(base.heavy.top1_index),
    };
    let early = LeafPresence::gate(&evidence).rescue(&evidence, &EARLY_RESCUES);
    tracker.leaf = Some(early);
    if let Some(veto) = first_veto(
        &EARLY_CLASS_VETOES,
        &presence_input(params, metrics, vocab, early.is_leaf, &base, &base_ensemble),
    ) {
        return Ok(tracker.veto(veto));
    }
    let presence = early.rescue(&evidence, &LATE_RESCUES);
    tracker.leaf = Some(presence);
    let is_leaf = presence.is_leaf;
    if let Some(veto) = first_veto(
        &PRESENCE_VETOES,
        &presence_input(params, metrics, vocab, is_leaf, &base, &base_ensemble),
    ) {
        return Ok(tracker.veto(veto));
    }

    // specialist blend
    let blended = specialist::apply(
        &SpecialistInput {
            params: &params.specialist,
            metrics,
            vocab,
            is_leaf,
            base: &base,
            ensemble: &base_ensemble,
        },
        refiner,
    )?;
    let current = match blended {
        Some((gate, heavy)) => {
            tracker.specialist = Some(gate);
            ModelPair {
                light: base.light.clone(),
                heavy,
            }
        }
        None => base.clone(),
    };
    tracker.pair = current.clone();

    let current_ensemble = ensemble(
        &current.light.probabilities,
        &current.heavy.probabilities,
        e.mode,
        e.light_weight,
        e.heavy_weight,
    );
    if let Some(veto) = first_veto(
        &CLASS_VETOES,
        &presence_input(params, metrics, vocab, is_leaf, &current, &current_ensemble),
    ) {
        return Ok(tracker.veto(veto));
    }

    let accept_input = AcceptInput {
        params,
        metrics,
        vocab,
        is_leaf,
        pair: &current,
    };
    if let Some(accepted) = first_acceptance(&PRE_GATE_ACCEPTS, &accept_input) {
        return Ok(tracker.accepted(accepted));
    }

    // entropy gate
    let threshold = effective_threshold(&ThresholdInput {
        params,
        metrics,
        is_leaf,
        heavy_strong: evidence.heavy_strong(),
        heavy_class: vocab.known(current.heavy.top1_index),
        heavy_conf: current.heavy.top1_confidence,
        heavy_margin: current.heavy.margin,
    });
    let gate = EntropyGate::new(threshold, params.entropy.escalation_ratio);
    let gated = match gate.run(current, refiner)? {
        GateOutcome::Pass { stage, pair, .. } => {
            tracker.gate_stage = Some(stage);
            pair
        }
        GateOutcome::Reject { stage, entropy } => {
            tracker.gate_stage = Some(stage);
            let extra = Diagnostics::new()
                .number("entropy", entropy)
                .number("threshold", threshold)
                .text("stage", format!("{stage:?}"));
            return Ok(tracker.reject(ReasonCode::HighEntropy, extra));
        }
    };
    tracker.pair = gated.clone();

    let accept_input = AcceptInput {
        params,
        metrics,
        vocab,
        is_leaf,
        pair: &gated,
    };
    if let Some(accepted) = first_acceptance(&POST_GATE_ACCEPTS, &accept_input) {
        return Ok(tracker.accepted(accepted));
    }

    let (pooled, corrected) = corrected_ensemble(params, vocab, is_leaf, &gated);
    let picked_index = pooled.argmax();
    let picked_label = vocab.label(picked_index).to_string();
    let picked_conf = pooled.get(picked_index);
    tracker.ensemble = Some(pooled);

    // global guard
    let guard_input = GuardInput {
        light: Opinion::new(gated.light.top1_label.as_str(), gated.light.top1_confidence),
        heavy: Opinion::new(gated.heavy.top1_label.as_str(), gated.heavy.top1_confidence),
        ensemble: Opinion::new(picked_label.as_str(), picked_conf),
        picked: Opinion::new(picked_label.as_str(), picked_conf),
        picked_model: Provenance::Ensemble.to_string(),
        heavy_class: vocab.known(gated.heavy.top1_index),
        signals: tracker.signals(),
    };
    let decision = ClassGuard::new(params.guard.clone()).evaluate(&guard_input);
    let guard_diag = decision
        .diagnostic_info
        .clone()
        .text("reason", decision.reason.as_str())
        .flag("corrected", corrected);

    if decision.is_unknown {
        let blocker = guard_override_blocker(&OverrideInput {
            params: &params.guard_override,
            metrics,
            is_leaf,
            heavy_class: vocab.known(gated.heavy.top1_index),
            heavy_conf: gated.heavy.top1_confidence,
            heavy_margin: gated.heavy.margin,
        });
        return Ok(match blocker {
            None => {
                log::debug!("Guard override for {}", gated.heavy.top1_label);
                tracker.accept(
                    gated.heavy.top1_label.clone(),
                    gated.heavy.top1_confidence,
                    Provenance::Heavy,
                    ReasonCode::GuardOverride,
                    Diagnostics::new().map("guard", guard_diag),
                )
            }
            Some(blocked) => {
                let extra = Diagnostics::new()
                    .map("guard", guard_diag)
                    .text("override_blocked", blocked);
                let mut decision_out = tracker.reject(ReasonCode::Guard(decision.reason.clone()), extra);
                decision_out.trace.reason = decision.reason;
                decision_out
            }
        });
    }

    Ok(tracker.accept(
        picked_label,
        picked_conf,
        Provenance::Ensemble,
        ReasonCode::Ensemble,
        Diagnostics::new().map("guard", guard_diag),
    ))
}

fn presence_input<'a>(
    params: &'a RuleParams,
    metrics: &'a ImageMetrics,
    vocab: &'a ClassVocabulary,
    is_leaf: bool,
    pair: &'a ModelPair,
    ensemble: &'a ClassProbability,
) -> VetoInput<'a> {
    VetoInput {
        params,
        metrics,
        vocab,
        is_leaf,
        light: &pair.light,
        heavy: &pair.heavy,
        ensemble,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{ClassifierOutput, ModelRole};
    use crate::leaf_presence::tests::{metrics, output};

    fn vocab() -> ClassVocabulary {
        ClassVocabulary::from_labels(vec![
            "Apple___healthy".into(),
            "Apple___Apple_scab".into(),
            "Rice___Leaf_Blast".into(),
            "Rice___Brown_Spot".into(),
            "Grape___healthy".into(),
            "Corn___Common_rust".into(),
        ])
        .unwrap()
    }

    fn pair(v: &ClassVocabulary, light: (usize, f32), heavy: (usize, f32)) -> ModelPair {
        ModelPair {
            light: output(v, light.0, light.1, ModelRole::Light),
            heavy: output(v, heavy.0, heavy.1, ModelRole::Heavy),
        }
    }

    #[test]
    fn test_consensus_confidence_is_mean() {
        let params = RuleParams::default();
        let v = vocab();
        let p = pair(&v, (0, 0.95), (0, 0.93));
        let m = metrics(0.20, 0.25, 0.3);
        let input = AcceptInput {
            params: &params,
            metrics: &m,
            vocab: &v,
            is_leaf: true,
            pair: &p,
        };
        let accepted = first_acceptance(&POST_GATE_ACCEPTS, &input).unwrap();
        assert_eq!(accepted.rule, AcceptRule::Consensus);
        assert_eq!(accepted.label, "Apple___healthy");
        assert!((accepted.confidence - 0.94).abs() < 1e-5);
        assert_eq!(accepted.provenance, Provenance::Both);
    }

    #[test]
    fn test_heavy_dominant_needs_confidence_above_guard_floor() {
        let params = RuleParams::default();
        let v = vocab();
        let m = metrics(0.40, 0.40, 0.3);

        let weak = pair(&v, (4, 0.65), (4, 0.68));
        let input = AcceptInput {
            params: &params,
            metrics: &m,
            vocab: &v,
            is_leaf: true,
            pair: &weak,
        };
        assert!(AcceptRule::HeavyDominant.check(&input).is_none());

        let strong = pair(&v, (1, 0.60), (4, 0.97));
        let input = AcceptInput {
            pair: &strong,
            ..input
        };
        let accepted = AcceptRule::HeavyDominant.check(&input).unwrap();
        assert_eq!(accepted.label, "Grape___healthy");
        assert_eq!(accepted.provenance, Provenance::Heavy);
    }

    #[test]
    fn test_heavy_dominant_skips_specialist_family() {
        let params = RuleParams::default();
        let v = vocab();
        let m = metrics(0.40, 0.40, 0.3);
        let rice = pair(&v, (2, 0.90), (2, 0.97));
        let input = AcceptInput {
            params: &params,
            metrics: &m,
            vocab: &v,
            is_leaf: true,
            pair: &rice,
        };
        assert!(AcceptRule::HeavyDominant.check(&input).is_none());
    }

    #[test]
    fn test_leaf_override_on_large_leaf() {
        let params = RuleParams::default();
        let v = vocab();
        let m = metrics(0.70, 0.50, 0.3);
        let p = pair(&v, (0, 0.40), (5, 0.75));
        let input = AcceptInput {
            params: &params,
            metrics: &m,
            vocab: &v,
            is_leaf: true,
            pair: &p,
        };
        let accepted = first_acceptance(&PRE_GATE_ACCEPTS, &input).unwrap();
        assert_eq!(accepted.reason, ReasonCode::LeafOverride);
        assert_eq!(accepted.label, "Corn___Common_rust");
    }

    #[test]
    fn test_light_dominance_correction() {
        let params = RuleParams::default();
        let v = vocab();
        // heavy is spread with rice on top; light is confident on grape
        let light = output(&v, 4, 0.60, ModelRole::Light);
        let heavy = ClassifierOutput::from_probabilities(
            ClassProbability::from_weights(ndarray::Array1::from_vec(vec![
                0.12, 0.12, 0.30, 0.22, 0.12, 0.12,
            ]))
            .unwrap(),
            &v,
            ModelRole::Heavy,
        );
        let p = ModelPair { light, heavy };
        let (base, corrected) = corrected_ensemble(&params, &v, false, &p);
        assert!(!corrected);
        assert_eq!(base.argmax(), 2);

        let (pooled, corrected) = corrected_ensemble(&params, &v, true, &p);
        assert!(corrected);
        assert_eq!(pooled.argmax(), 4);
    }
}
