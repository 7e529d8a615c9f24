//! Entropy gate with test-time-augmentation escalation.
//!
//! The gate walks `Base -> QuickRefine -> FullRefine`, re-running inference
//! only while the averaged entropy stays above the effective threshold. A
//! quick refine that lands far above the threshold is rejected without paying
//! for the full view set.

use serde::Serialize;

use crate::class_rules::relax_rule;
use crate::classes::KnownClass;
use crate::classifier::ModelPair;
use crate::error::ClassifyError;
use crate::leaf_metrics::ImageMetrics;
use crate::rule_params::RuleParams;
use crate::tta::{Refiner, TtaStrategy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GateStage {
    Base,
    QuickRefine,
    FullRefine,
}

impl GateStage {
    pub fn strategy(self) -> TtaStrategy {
        match self {
            GateStage::Base => TtaStrategy::Base,
            GateStage::QuickRefine => TtaStrategy::Quick,
            GateStage::FullRefine => TtaStrategy::Full,
        }
    }
}

/// Signals the threshold relaxations depend on.
#[derive(Debug, Clone, Copy)]
pub struct ThresholdInput<'a> {
    pub params: &'a RuleParams,
    pub metrics: &'a ImageMetrics,
    pub is_leaf: bool,
    /// Base heavy output cleared the heavy-strong bar
    pub heavy_strong: bool,
    /// Current (possibly blended) heavy class and its confidence and margin
    pub heavy_class: Option<KnownClass>,
    pub heavy_conf: f32,
    pub heavy_margin: f32,
}

/// Base threshold raised by every relaxation whose conditions hold.
pub fn effective_threshold(input: &ThresholdInput) -> f32 {
    let e = &input.params.entropy;
    let m = input.metrics;
    let mut threshold = e.base_threshold;

    if input.is_leaf && input.heavy_strong {
        threshold = threshold.max(e.relax_leaf_heavy_strong);
    }
    if input.is_leaf && m.leaf_area_fraction >= input.params.leaf_override.leaf_min {
        threshold = threshold.max(e.relax_big_leaf);
    }

    if let Some(rule) = input.heavy_class.and_then(relax_rule) {
        let ok = (!rule.require_leaf || input.is_leaf)
            && input.heavy_conf >= rule.heavy_conf_min
            && input.heavy_margin >= rule.heavy_margin_min
            && rule.leaf_min.map_or(true, |v| m.leaf_area_fraction >= v)
            && rule
                .greenness_min
                .map_or(true, |v| m.leaf_mask_greenness_ratio >= v)
            && rule.highlight_max.map_or(true, |v| m.highlight_ratio <= v);
        if ok {
            threshold = threshold.max(rule.threshold);
        }
    }
    threshold
}

#[derive(Debug, Clone, PartialEq)]
pub enum GateOutcome {
    /// Entropy is acceptable; `pair` replaces the base outputs downstream.
    Pass {
        stage: GateStage,
        pair: ModelPair,
        entropy: f32,
    },
    Reject {
        stage: GateStage,
        entropy: f32,
    },
}

impl GateOutcome {
    pub fn stage(&self) -> GateStage {
        match self {
            GateOutcome::Pass { stage, .. } | GateOutcome::Reject { stage, .. } => *stage,
        }
    }
}

pub struct EntropyGate {
    threshold: f32,
    escalation_ratio: f32,
}

impl EntropyGate {
    pub fn new(threshold: f32, escalation_ratio: f32) -> Self {
        Self {
            threshold,
            escalation_ratio,
        }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn run(&self, current: ModelPair, refiner: &dyn Refiner) -> Result<GateOutcome, ClassifyError> {
        let h = current.average_entropy();
        if h <= self.threshold {
            return Ok(GateOutcome::Pass {
                stage: GateStage::Base,
                pair: current,
                entropy: h,
            });
        }
        log::debug!("🔁 Entropy {h:.3} > {:.3}, quick refine", self.threshold);

        let quick = refiner.refine(GateStage::QuickRefine.strategy())?;
        let hq = quick.average_entropy();
        if hq <= self.threshold {
            return Ok(GateOutcome::Pass {
                stage: GateStage::QuickRefine,
                pair: quick,
                entropy: hq,
            });
        }
        if hq >= self.escalation_ratio * self.threshold {
            log::debug!("Quick refine entropy {hq:.3} too high to escalate");
            return Ok(GateOutcome::Reject {
                stage: GateStage::QuickRefine,
                entropy: hq,
            });
        }

        log::debug!("🔁 Quick refine entropy {hq:.3}, full refine");
        let full = refiner.refine(GateStage::FullRefine.strategy())?;
        let hf = full.average_entropy();
        if hf <= self.threshold {
            Ok(GateOutcome::Pass {
                stage: GateStage::FullRefine,
                pair: full,
                entropy: hf,
            })
        } else {
            Ok(GateOutcome::Reject {
                stage: GateStage::FullRefine,
                entropy: hf,
            })
        }
    }
}
