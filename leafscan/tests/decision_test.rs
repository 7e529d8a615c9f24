use leafscan::arbitration::{decide, Decision};
use leafscan::classes::{ClassVocabulary, KnownClass};
use leafscan::classifier::{ClassifierOutput, ModelPair, ModelRole};
use leafscan::entropy_gate::GateStage;
use leafscan::error::ClassifyError;
use leafscan::leaf_metrics::{BoxMetrics, ImageMetrics};
use leafscan::probability::ClassProbability;
use leafscan::rule_params::RuleParams;
use leafscan::specialist::SpecialistGate;
use leafscan::tta::{Refiner, TtaStrategy};
use leafscan::verdict::{DiagnosticValue, FinalVerdict, Provenance, ReasonCode};
use ndarray::Array1;
use std::cell::RefCell;

fn vocab() -> ClassVocabulary {
    ClassVocabulary::from_labels(vec![
        "Apple___healthy".into(),
        "Apple___Apple_scab".into(),
        "Rice___Leaf_Blast".into(),
        "Rice___Brown_Spot".into(),
        "Grape___healthy".into(),
        "Strawberry___Leaf_scorch".into(),
    ])
    .unwrap()
}

fn metrics(area: f32, gy: f32, sat: f32) -> ImageMetrics {
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

fn peaked(v: &ClassVocabulary, index: usize, conf: f32) -> ClassProbability {
    let rest = (1.0 - conf) / (v.len() - 1) as f32;
    let mut w = vec![rest; v.len()];
    w[index] = conf;
    ClassProbability::from_weights(Array1::from_vec(w)).unwrap()
}

fn pair(v: &ClassVocabulary, light: (usize, f32), heavy: (usize, f32)) -> ModelPair {
    ModelPair {
        light: ClassifierOutput::from_probabilities(peaked(v, light.0, light.1), v, ModelRole::Light),
        heavy: ClassifierOutput::from_probabilities(peaked(v, heavy.0, heavy.1), v, ModelRole::Heavy),
    }
}

/// Hands out canned refinements and records what was asked.
#[derive(Default)]
struct Scripted {
    quick: Option<ModelPair>,
    full: Option<ModelPair>,
    specialist: Option<ClassProbability>,
    asked: RefCell<Vec<TtaStrategy>>,
    specialist_calls: RefCell<usize>,
}

impl Refiner for Scripted {
    fn refine(&self, strategy: TtaStrategy) -> Result<ModelPair, ClassifyError> {
        self.asked.borrow_mut().push(strategy);
        let pair = match strategy {
            TtaStrategy::Quick => self.quick.clone(),
            TtaStrategy::Full => self.full.clone(),
            TtaStrategy::Base => None,
        };
        pair.ok_or_else(|| ClassifyError::internal(format!("unexpected {strategy:?} refinement")))
    }

    fn has_specialist(&self) -> bool {
        self.specialist.is_some()
    }

    fn specialist(&self) -> Result<Option<ClassProbability>, ClassifyError> {
        *self.specialist_calls.borrow_mut() += 1;
        Ok(self.specialist.clone())
    }
}

fn run(params: &RuleParams, m: &ImageMetrics, base: ModelPair, refiner: &Scripted) -> Decision {
    decide(params, &vocab(), m, base, refiner).unwrap()
}

#[test]
fn test_healthy_consensus_is_accepted_with_mean_confidence() {
    let v = vocab();
    let refiner = Scripted::default();
    let decision = run(
        &RuleParams::default(),
        &metrics(0.20, 0.25, 0.30),
        pair(&v, (0, 0.95), (0, 0.93)),
        &refiner,
    );

    let verdict = &decision.verdict;
    assert!(verdict.is_accepted());
    assert_eq!(verdict.label(), "Apple___healthy");
    assert!((verdict.confidence() - 0.94).abs() < 1e-4);
    assert_eq!(verdict.reason_code(), &ReasonCode::Consensus);
    match verdict {
        FinalVerdict::Accepted {
            contributing_model, ..
        } => assert_eq!(*contributing_model, Provenance::Both),
        other => panic!("expected acceptance, got {other:?}"),
    }
    assert_eq!(decision.trace.gate_stage, Some(GateStage::Base));
    assert!(refiner.asked.borrow().is_empty());
}

#[test]
fn test_missing_leaf_vetoes_confident_models() {
    let v = vocab();
    let decision = run(
        &RuleParams::default(),
        &metrics(0.01, 0.02, 0.50),
        pair(&v, (0, 0.99), (0, 0.99)),
        &Scripted::default(),
    );
    assert!(!decision.verdict.is_accepted());
    assert_eq!(decision.verdict.reason_code(), &ReasonCode::NoLeafVeto);
    assert_eq!(decision.verdict.label(), "Unknown");
    assert_eq!(decision.verdict.confidence(), 0.0);
}

#[test]
fn test_guard_rejects_disagreeing_models() {
    let v = vocab();
    let decision = run(
        &RuleParams::default(),
        &metrics(0.20, 0.25, 0.30),
        pair(&v, (1, 0.95), (4, 0.40)),
        &Scripted::default(),
    );
    let reason = decision.verdict.reason_code();
    assert_eq!(reason.code(), "Guard");
    assert!(
        decision.trace.reason.contains("delta>=delta_max"),
        "{}",
        decision.trace.reason
    );
}

#[test]
fn test_guard_rejects_two_weak_models() {
    let v = vocab();
    let decision = run(
        &RuleParams::default(),
        &metrics(0.20, 0.25, 0.30),
        pair(&v, (1, 0.60), (1, 0.65)),
        &Scripted::default(),
    );
    assert_eq!(decision.verdict.reason_code().code(), "Guard");
    assert!(decision.trace.reason.starts_with("both<=gate_min"));
}

#[test]
fn test_confident_heavy_model_overrides_guard() {
    let v = vocab();
    let decision = run(
        &RuleParams::default(),
        &metrics(0.30, 0.30, 0.30),
        pair(&v, (4, 0.45), (1, 0.93)),
        &Scripted::default(),
    );
    match &decision.verdict {
        FinalVerdict::Accepted {
            label,
            confidence,
            contributing_model,
            reason_code,
            ..
        } => {
            assert_eq!(label, "Apple___Apple_scab");
            assert!((confidence - 0.93).abs() < 1e-4);
            assert_eq!(*contributing_model, Provenance::Heavy);
            assert_eq!(*reason_code, ReasonCode::GuardOverride);
        }
        other => panic!("expected guard override, got {other:?}"),
    }
}

#[test]
fn test_denied_class_cannot_override_guard() {
    let v = vocab();
    let decision = run(
        &RuleParams::default(),
        &metrics(0.30, 0.30, 0.30),
        pair(&v, (4, 0.45), (5, 0.93)),
        &Scripted::default(),
    );
    assert!(!decision.verdict.is_accepted());
    assert_eq!(decision.verdict.reason_code().code(), "Guard");
    assert!(decision.trace.reason.contains("delta>=delta_max"));
    assert_eq!(
        decision.verdict.diagnostics().get("override_blocked"),
        Some(&DiagnosticValue::Text("class denied".into()))
    );
}

#[test]
fn test_quick_refinement_rescues_uncertain_image() {
    let v = vocab();
    let refiner = Scripted {
        quick: Some(pair(&v, (1, 0.95), (1, 0.93))),
        ..Default::default()
    };
    let decision = run(
        &RuleParams::default(),
        &metrics(0.20, 0.25, 0.30),
        pair(&v, (1, 0.30), (1, 0.30)),
        &refiner,
    );
    assert_eq!(decision.verdict.label(), "Apple___Apple_scab");
    assert_eq!(decision.verdict.reason_code(), &ReasonCode::Consensus);
    assert_eq!(decision.trace.gate_stage, Some(GateStage::QuickRefine));
    assert_eq!(*refiner.asked.borrow(), vec![TtaStrategy::Quick]);
}

#[test]
fn test_full_refinement_after_borderline_quick_pass() {
    let v = vocab();
    let refiner = Scripted {
        quick: Some(pair(&v, (1, 0.45), (1, 0.45))),
        full: Some(pair(&v, (1, 0.95), (1, 0.93))),
        ..Default::default()
    };
    let decision = run(
        &RuleParams::default(),
        &metrics(0.20, 0.25, 0.30),
        pair(&v, (1, 0.30), (1, 0.30)),
        &refiner,
    );
    assert!(decision.verdict.is_accepted());
    assert_eq!(decision.trace.gate_stage, Some(GateStage::FullRefine));
    assert_eq!(
        *refiner.asked.borrow(),
        vec![TtaStrategy::Quick, TtaStrategy::Full]
    );
}

#[test]
fn test_hopeless_quick_refinement_rejects_without_full_pass() {
    let v = vocab();
    let mut params = RuleParams::default();
    params.entropy.base_threshold = 1.2;
    let refiner = Scripted {
        quick: Some(pair(&v, (1, 0.30), (1, 0.30))),
        ..Default::default()
    };
    let decision = run(
        &params,
        &metrics(0.20, 0.25, 0.30),
        pair(&v, (1, 0.30), (1, 0.30)),
        &refiner,
    );
    assert_eq!(decision.verdict.reason_code(), &ReasonCode::HighEntropy);
    assert_eq!(decision.trace.gate_stage, Some(GateStage::QuickRefine));
    assert_eq!(*refiner.asked.borrow(), vec![TtaStrategy::Quick]);
}

#[test]
fn test_water_veto_on_specialist_family() {
    let v = vocab();
    let mut m = metrics(0.40, 0.40, 0.40);
    m.water_like_ratio = 0.20;
    let decision = run(
        &RuleParams::default(),
        &m,
        pair(&v, (0, 0.60), (2, 0.70)),
        &Scripted::default(),
    );
    assert_eq!(decision.verdict.reason_code(), &ReasonCode::WaterVeto);
}

#[test]
fn test_strawberry_scorch_veto_on_weak_leaf() {
    let v = vocab();
    let decision = run(
        &RuleParams::default(),
        &metrics(0.14, 0.20, 0.30),
        pair(&v, (0, 0.60), (5, 0.80)),
        &Scripted::default(),
    );
    assert_eq!(
        decision.verdict.reason_code(),
        &ReasonCode::OodVeto(KnownClass::StrawberryLeafScorch)
    );
    assert_eq!(
        decision.verdict.reason_code().to_string(),
        "Strawberry_OOD_Veto"
    );
}

#[test]
fn test_specialist_blend_moves_heavy_label() {
    let v = vocab();
    let refiner = Scripted {
        specialist: Some(
            ClassProbability::from_weights(Array1::from_vec(vec![
                0.02, 0.02, 0.90, 0.02, 0.02, 0.02,
            ]))
            .unwrap(),
        ),
        ..Default::default()
    };
    let decision = run(
        &RuleParams::default(),
        &metrics(0.40, 0.40, 0.30),
        pair(&v, (2, 0.85), (3, 0.55)),
        &refiner,
    );
    assert_eq!(*refiner.specialist_calls.borrow(), 1);
    assert_eq!(decision.trace.specialist, Some(SpecialistGate::Primary));
    assert_eq!(decision.trace.pair.heavy.top1_label, "Rice___Leaf_Blast");
    assert_eq!(decision.verdict.label(), "Rice___Leaf_Blast");
    assert_eq!(decision.verdict.reason_code(), &ReasonCode::Ensemble);
}

#[test]
fn test_decisions_are_deterministic() {
    let v = vocab();
    let m = metrics(0.20, 0.25, 0.30);
    let params = RuleParams::default();
    let first = run(&params, &m, pair(&v, (1, 0.82), (1, 0.77)), &Scripted::default());
    let second = run(&params, &m, pair(&v, (1, 0.82), (1, 0.77)), &Scripted::default());
    assert_eq!(first, second);
}
