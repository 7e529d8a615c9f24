//! Global confidence guard and the heavy-model guard override.

use crate::class_rules::{self, guard_config, GuardConfig};
use crate::classes::KnownClass;
use crate::leaf_metrics::ImageMetrics;
use crate::rule_params::{GlobalGuardParams, GuardOverrideParams};
use crate::verdict::{Diagnostics, Signals};

/// Labelled confidence of one participant.
#[derive(Debug, Clone, PartialEq)]
pub struct Opinion {
    pub label: String,
    pub confidence: f32,
}

impl Opinion {
    pub fn new(label: impl Into<String>, confidence: f32) -> Self {
        Self {
            label: label.into(),
            confidence: sanitize(confidence),
        }
    }
}

/// Everything the guard looks at.
#[derive(Debug, Clone, PartialEq)]
pub struct GuardInput {
    pub light: Opinion,
    pub heavy: Opinion,
    pub ensemble: Opinion,
    pub picked: Opinion,
    pub picked_model: String,
    /// Heavy class, for the per-class evidence report
    pub heavy_class: Option<KnownClass>,
    pub signals: Signals,
}

/// Result of a guard evaluation. Always carries a reason, even when
/// accepting.
#[derive(Debug, Clone, PartialEq)]
pub struct GuardDecision {
    pub is_unknown: bool,
    pub reason: String,
    pub diagnostic_info: Diagnostics,
}

fn sanitize(confidence: f32) -> f32 {
    if confidence.is_finite() {
        confidence.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

pub struct ClassGuard {
    params: GlobalGuardParams,
}

impl ClassGuard {
    pub fn new(params: GlobalGuardParams) -> Self {
        Self { params }
    }

    pub fn evaluate(&self, input: &GuardInput) -> GuardDecision {
        let p = &self.params;
        let cm = input.light.confidence;
        let cr = input.heavy.confidence;
        let picked = input.picked.confidence;

        let mut info = Diagnostics::new()
            .map(
                "thresholds",
                Diagnostics::new()
                    .number("gate_min", p.gate_min)
                    .number("delta_max", p.delta_max)
                    .number("pick_override", p.pick_override),
            )
            .map(
                "conf",
                Diagnostics::new()
                    .number("light", cm)
                    .number("heavy", cr)
                    .number("ensemble", input.ensemble.confidence)
                    .number("picked", picked),
            )
            .map(
                "labels",
                Diagnostics::new()
                    .text("light", input.light.label.as_str())
                    .text("heavy", input.heavy.label.as_str())
                    .text("ensemble", input.ensemble.label.as_str())
                    .text("picked", input.picked.label.as_str())
                    .text("model", input.picked_model.as_str()),
            );
        if let Some(cfg) = input.heavy_class.and_then(guard_config) {
            info = info.map("class_evidence", class_evidence(cfg, &input.signals));
        }

        if cm >= p.pick_override || cr >= p.pick_override || picked >= p.pick_override {
            return GuardDecision {
                is_unknown: false,
                reason: format!("override: >= {}", p.pick_override),
                diagnostic_info: info,
            };
        }

        let mut reasons = Vec::new();
        if cm <= p.gate_min && cr <= p.gate_min {
            reasons.push(format!(
                "both<=gate_min({}) light={cm:.3}, heavy={cr:.3}",
                p.gate_min
            ));
        }
        let delta = (cm - cr).abs();
        if delta >= p.delta_max {
            reasons.push(format!(
                "delta>=delta_max({}) |light-heavy|={delta:.3}",
                p.delta_max
            ));
        }

        if reasons.is_empty() {
            GuardDecision {
                is_unknown: false,
                reason: "ok".to_string(),
                diagnostic_info: info,
            }
        } else {
            GuardDecision {
                is_unknown: true,
                reason: reasons.join("; "),
                diagnostic_info: info,
            }
        }
    }
}

/// How the image measures against the soft thresholds of its class.
fn class_evidence(cfg: &GuardConfig, s: &Signals) -> Diagnostics {
    let checks = [
        ("leaf_ok", s.leaf >= cfg.leaf_min),
        ("greenness_ok", s.gy >= cfg.greenness_min),
        ("saturation_ok", s.sat >= cfg.saturation_min),
        ("highlight_ok", s.hi <= cfg.highlight_max),
        ("confidence_ok", s.cr >= cfg.confidence_cap),
        ("margin_ok", s.mr >= cfg.margin_min),
        ("delta_ok", (s.cm - s.cr).abs() <= cfg.delta_confidence_cap),
    ];
    let all = checks.iter().all(|(_, ok)| *ok);
    checks
        .into_iter()
        .fold(Diagnostics::new(), |d, (key, ok)| d.flag(key, ok))
        .flag("satisfied", all)
        .flag("require_leaf", cfg.require_leaf)
}

/// Inputs of the heavy-model override of a guard rejection.
#[derive(Debug, Clone, Copy)]
pub struct OverrideInput<'a> {
    pub params: &'a GuardOverrideParams,
    pub metrics: &'a ImageMetrics,
    pub is_leaf: bool,
    pub heavy_class: Option<KnownClass>,
    pub heavy_conf: f32,
    pub heavy_margin: f32,
}

/// Why a guard override was refused, or `None` when it is granted.
pub fn guard_override_blocker(input: &OverrideInput) -> Option<&'static str> {
    let p = input.params;
    let cfg = input.heavy_class.and_then(guard_config);
    let heavy_min = cfg.and_then(|c| c.heavy_min).unwrap_or(p.heavy_min);
    let margin_min = cfg
        .and_then(|c| c.heavy_margin_min)
        .unwrap_or(p.heavy_margin_min);
    let leaf_min = cfg.and_then(|c| c.leaf_min_override).unwrap_or(p.leaf_min);
    let gy_min = cfg
        .and_then(|c| c.greenness_min_override)
        .unwrap_or(p.greenness_min);

    let m = input.metrics;
    let area = m.leaf_area_fraction;
    let gy = m.leaf_mask_greenness_ratio;

    if !input.is_leaf {
        Some("no leaf")
    } else if input.heavy_conf < heavy_min || input.heavy_margin < margin_min {
        Some("heavy model not confident enough")
    } else if class_rules::is_member(&class_rules::GUARD_OVERRIDE_DENY, input.heavy_class) {
        Some("class denied")
    } else if area < leaf_min || gy < gy_min {
        Some("leaf evidence under override floors")
    } else if cfg.is_some_and(|c| c.hard_veto_hit(area, gy)) {
        Some("class hard floor")
    } else if m.red_dominated(p.red_fraction_max, p.red_exg_max) {
        Some("red-dominated region")
    } else {
        None
    }
}
