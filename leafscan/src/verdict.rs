//! Verdict types exposed to callers.

use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

use crate::classes::KnownClass;
use crate::entropy_gate::GateStage;
use crate::leaf_metrics::ImageMetrics;
use crate::probability::EnsembleMode;

pub const UNKNOWN_LABEL: &str = "Unknown";

/// Stable, machine-readable reason attached to every verdict.
#[derive(Debug, Clone, PartialEq)]
pub enum ReasonCode {
    NoLeafVeto,
    HighEntropy,
    WaterVeto,
    /// Out-of-distribution veto for one class, rendered `<Crop>_OOD_Veto`.
    OodVeto(KnownClass),
    /// Rejection by the global guard, with its evaluated reason.
    Guard(String),
    LeafOverride,
    Consensus,
    HeavyDominant,
    GuardOverride,
    Ensemble,
    Demo,
}

impl ReasonCode {
    /// Reason without per-request detail, suitable for grouping.
    pub fn code(&self) -> String {
        match self {
            ReasonCode::Guard(_) => "Guard".to_string(),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReasonCode::NoLeafVeto => f.write_str("NoLeafVeto"),
            ReasonCode::HighEntropy => f.write_str("HighEntropy"),
            ReasonCode::WaterVeto => f.write_str("WaterVeto"),
            ReasonCode::OodVeto(class) => write!(f, "{}_OOD_Veto", class.crop()),
            ReasonCode::Guard(reason) => write!(f, "Guard[{reason}]"),
            ReasonCode::LeafOverride => f.write_str("LeafOverride"),
            ReasonCode::Consensus => f.write_str("Consensus"),
            ReasonCode::HeavyDominant => f.write_str("HeavyDominant"),
            ReasonCode::GuardOverride => f.write_str("GuardOverride"),
            ReasonCode::Ensemble => f.write_str("Ensemble"),
            ReasonCode::Demo => f.write_str("Demo"),
        }
    }
}

impl Serialize for ReasonCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Which model's opinion an accepted label comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Provenance {
    Heavy,
    /// Both classifiers agreed.
    Both,
    Ensemble,
    Demo,
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Provenance::Heavy => "Heavy",
            Provenance::Both => "Both",
            Provenance::Ensemble => "Ensemble",
            Provenance::Demo => "Demo",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum DiagnosticValue {
    Flag(bool),
    Number(f64),
    Text(String),
    Map(Diagnostics),
}

/// Free-form key/value evidence attached to a verdict or guard decision.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Diagnostics(BTreeMap<String, DiagnosticValue>);

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn number(mut self, key: &str, value: f32) -> Self {
        self.0
            .insert(key.to_string(), DiagnosticValue::Number(value as f64));
        self
    }

    pub fn text(mut self, key: &str, value: impl Into<String>) -> Self {
        self.0
            .insert(key.to_string(), DiagnosticValue::Text(value.into()));
        self
    }

    pub fn flag(mut self, key: &str, value: bool) -> Self {
        self.0.insert(key.to_string(), DiagnosticValue::Flag(value));
        self
    }

    pub fn map(mut self, key: &str, value: Diagnostics) -> Self {
        self.0.insert(key.to_string(), DiagnosticValue::Map(value));
        self
    }

    pub fn get(&self, key: &str) -> Option<&DiagnosticValue> {
        self.0.get(key)
    }

    pub fn get_number(&self, key: &str) -> Option<f64> {
        match self.0.get(key) {
            Some(DiagnosticValue::Number(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Merge `other` into `self`; keys of `other` win.
    pub fn extend(mut self, other: Diagnostics) -> Self {
        self.0.extend(other.0);
        self
    }
}

/// The scalar signals most rules look at, in the short names used in logs.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct Signals {
    pub leaf: f32,
    pub gy: f32,
    pub sat: f32,
    pub hi: f32,
    /// Light top-1 confidence
    pub cm: f32,
    /// Heavy top-1 confidence
    pub cr: f32,
    pub mm: f32,
    pub mr: f32,
}

impl Signals {
    pub fn from_metrics(metrics: &ImageMetrics) -> Self {
        Self {
            leaf: metrics.leaf_area_fraction,
            gy: metrics.leaf_mask_greenness_ratio,
            sat: metrics.saturation_ratio,
            hi: metrics.highlight_ratio,
            ..Self::default()
        }
    }

    pub fn with_models(self, cm: f32, mm: f32, cr: f32, mr: f32) -> Self {
        Self {
            cm,
            mm,
            cr,
            mr,
            ..self
        }
    }

    pub fn to_diagnostics(self) -> Diagnostics {
        Diagnostics::new()
            .number("leaf", self.leaf)
            .number("gy", self.gy)
            .number("sat", self.sat)
            .number("hi", self.hi)
            .number("cm", self.cm)
            .number("cr", self.cr)
            .number("mm", self.mm)
            .number("mr", self.mr)
    }
}

/// Outcome of one classification request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status")]
pub enum FinalVerdict {
    Accepted {
        label: String,
        confidence: f32,
        contributing_model: Provenance,
        reason_code: ReasonCode,
        diagnostics: Diagnostics,
    },
    Rejected {
        reason_code: ReasonCode,
        diagnostics: Diagnostics,
    },
}

impl FinalVerdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, FinalVerdict::Accepted { .. })
    }

    /// Accepted label, or `"Unknown"`.
    pub fn label(&self) -> &str {
        match self {
            FinalVerdict::Accepted { label, .. } => label,
            FinalVerdict::Rejected { .. } => UNKNOWN_LABEL,
        }
    }

    /// Accepted confidence, 0 when rejected.
    pub fn confidence(&self) -> f32 {
        match self {
            FinalVerdict::Accepted { confidence, .. } => *confidence,
            FinalVerdict::Rejected { .. } => 0.0,
        }
    }

    pub fn reason_code(&self) -> &ReasonCode {
        match self {
            FinalVerdict::Accepted { reason_code, .. } | FinalVerdict::Rejected { reason_code, .. } => {
                reason_code
            }
        }
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        match self {
            FinalVerdict::Accepted { diagnostics, .. } | FinalVerdict::Rejected { diagnostics, .. } => {
                diagnostics
            }
        }
    }
}

/// Top-1 result of one model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelTop1 {
    pub label: String,
    pub confidence: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnsembleSummary {
    /// Final decided label, `Unknown` when rejected
    pub label: String,
    /// Confidence of the final decision, 0 when rejected
    pub confidence: f32,
    pub mode: EnsembleMode,
    pub light_weight: f32,
    pub heavy_weight: f32,
}

/// The label that was finally emitted and who it came from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Picked {
    pub model: String,
    pub label: String,
    pub confidence: f32,
}

impl Picked {
    pub fn from_verdict(verdict: &FinalVerdict) -> Self {
        match verdict {
            FinalVerdict::Accepted {
                label,
                confidence,
                contributing_model,
                ..
            } => Self {
                model: contributing_model.to_string(),
                label: label.clone(),
                confidence: *confidence,
            },
            FinalVerdict::Rejected { .. } => Self {
                model: UNKNOWN_LABEL.to_string(),
                label: UNKNOWN_LABEL.to_string(),
                confidence: 0.0,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EntropySummary {
    pub light: f32,
    pub heavy: f32,
    pub ensemble: f32,
}

/// Structured breakdown returned by `classify_with_details`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassificationDetails {
    /// Base single-view top-1 of each model
    pub light: ModelTop1,
    pub heavy: ModelTop1,
    pub ensemble: EnsembleSummary,
    pub picked: Picked,
    pub entropy: EntropySummary,
    /// Wall time of the base inference pass
    pub inference_ms: f64,
    pub reason: String,
    pub signals: Signals,
    /// Last entropy-gate stage reached, if the gate ran
    pub gate_stage: Option<GateStage>,
    pub specialist_used: bool,
    pub verdict: FinalVerdict,
}
