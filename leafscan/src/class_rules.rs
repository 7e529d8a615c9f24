//! Static per-class rule tables.
//!
//! Every entry is keyed by [`KnownClass`], so a misspelled class name is a
//! compile error instead of a silently inert rule.

use crate::classes::KnownClass;
use serde::Serialize;

/// Floors below which a leaf-requiring class is rejected outright.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HardVeto {
    pub leaf_min: f32,
    pub greenness_min: f32,
}

/// Class-specific bounds that relax the necrosis rescue.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct NecrosisRelax {
    pub saturation_max: f32,
    pub greenness_max: f32,
}

/// Per-class guard thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GuardConfig {
    pub leaf_min: f32,
    pub greenness_min: f32,
    pub saturation_min: f32,
    pub highlight_max: f32,
    pub confidence_cap: f32,
    pub margin_min: f32,
    pub delta_confidence_cap: f32,
    pub require_leaf: bool,
    pub hard_veto: Option<HardVeto>,
    /// Heavy-model confidence bar for a guard override of this class.
    pub heavy_min: Option<f32>,
    pub heavy_margin_min: Option<f32>,
    /// Leaf floor for a guard override of this class.
    pub leaf_min_override: Option<f32>,
    pub greenness_min_override: Option<f32>,
    pub necrosis_relax: Option<NecrosisRelax>,
}

impl GuardConfig {
    const fn soft(
        leaf_min: f32,
        greenness_min: f32,
        saturation_min: f32,
        highlight_max: f32,
        confidence_cap: f32,
        margin_min: f32,
        delta_confidence_cap: f32,
    ) -> Self {
        Self {
            leaf_min,
            greenness_min,
            saturation_min,
            highlight_max,
            confidence_cap,
            margin_min,
            delta_confidence_cap,
            require_leaf: false,
            hard_veto: None,
            heavy_min: None,
            heavy_margin_min: None,
            leaf_min_override: None,
            greenness_min_override: None,
            necrosis_relax: None,
        }
    }

    /// True when the class demands leaf evidence and the metrics fall under
    /// its hard floors.
    pub fn hard_veto_hit(&self, leaf_area: f32, greenness: f32) -> bool {
        match (self.require_leaf, self.hard_veto) {
            (true, Some(veto)) => leaf_area < veto.leaf_min || greenness < veto.greenness_min,
            _ => false,
        }
    }
}

const ORANGE_HLB: GuardConfig = GuardConfig {
    require_leaf: true,
    hard_veto: Some(HardVeto {
        leaf_min: 0.08,
        greenness_min: 0.10,
    }),
    heavy_min: Some(0.84),
    heavy_margin_min: Some(0.22),
    leaf_min_override: Some(0.10),
    greenness_min_override: Some(0.10),
    ..GuardConfig::soft(0.32, 0.20, 0.08, 0.18, 0.42, 0.25, 0.22)
};

const RICE_SHEATH_BLIGHT: GuardConfig = GuardConfig::soft(0.20, 0.10, 0.06, 0.25, 0.50, 0.12, 0.30);

const TOMATO_LATE_BLIGHT: GuardConfig = GuardConfig {
    require_leaf: true,
    heavy_min: Some(0.88),
    heavy_margin_min: Some(0.35),
    necrosis_relax: Some(NecrosisRelax {
        saturation_max: 0.46,
        greenness_max: 0.15,
    }),
    leaf_min_override: Some(0.02),
    greenness_min_override: Some(0.05),
    ..GuardConfig::soft(0.30, 0.20, 0.06, 0.18, 0.45, 0.25, 0.22)
};

const CUCUMBER_POWDERY_MILDEW: GuardConfig =
    GuardConfig::soft(0.20, 0.09, 0.05, 0.35, 0.92, 0.10, 0.30);

const STRAWBERRY_LEAF_SCORCH: GuardConfig = GuardConfig {
    require_leaf: true,
    hard_veto: Some(HardVeto {
        leaf_min: 0.10,
        greenness_min: 0.12,
    }),
    ..GuardConfig::soft(0.25, 0.20, 0.15, 0.35, 0.52, 0.10, 0.30)
};

const CORN_GRAY_LEAF_SPOT: GuardConfig = GuardConfig::soft(0.10, 0.12, 0.08, 0.35, 0.88, 0.15, 0.30);

const CORN_COMMON_RUST: GuardConfig = GuardConfig {
    require_leaf: true,
    hard_veto: Some(HardVeto {
        leaf_min: 0.08,
        greenness_min: 0.12,
    }),
    ..GuardConfig::soft(0.12, 0.16, 0.06, 0.35, 0.80, 0.20, 0.30)
};

pub fn guard_config(class: KnownClass) -> Option<&'static GuardConfig> {
    match class {
        KnownClass::OrangeHaunglongbing => Some(&ORANGE_HLB),
        KnownClass::RiceSheathBlight => Some(&RICE_SHEATH_BLIGHT),
        KnownClass::TomatoLateBlight => Some(&TOMATO_LATE_BLIGHT),
        KnownClass::CucumberPowderyMildew => Some(&CUCUMBER_POWDERY_MILDEW),
        KnownClass::StrawberryLeafScorch => Some(&STRAWBERRY_LEAF_SCORCH),
        KnownClass::CornGrayLeafSpot => Some(&CORN_GRAY_LEAF_SPOT),
        KnownClass::CornCommonRust => Some(&CORN_COMMON_RUST),
        _ => None,
    }
}

/// Entropy-threshold relaxation for one class, applied only when every
/// listed condition holds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RelaxRule {
    pub threshold: f32,
    pub heavy_conf_min: f32,
    pub heavy_margin_min: f32,
    pub require_leaf: bool,
    pub leaf_min: Option<f32>,
    pub greenness_min: Option<f32>,
    pub highlight_max: Option<f32>,
}

impl RelaxRule {
    const fn new(threshold: f32, heavy_conf_min: f32, heavy_margin_min: f32) -> Self {
        Self {
            threshold,
            heavy_conf_min,
            heavy_margin_min,
            require_leaf: true,
            leaf_min: None,
            greenness_min: None,
            highlight_max: None,
        }
    }

    const fn with_leaf(mut self, leaf_min: f32, greenness_min: f32) -> Self {
        self.leaf_min = Some(leaf_min);
        self.greenness_min = Some(greenness_min);
        self
    }
}

pub fn relax_rule(class: KnownClass) -> Option<RelaxRule> {
    let rule = match class {
        KnownClass::PotatoLateBlight => RelaxRule::new(1.45, 0.88, 0.20),
        KnownClass::TomatoSpiderMites => RelaxRule::new(1.70, 0.80, 0.25).with_leaf(0.18, 0.18),
        KnownClass::CornNorthernLeafBlight => {
            RelaxRule::new(1.50, 0.82, 0.20).with_leaf(0.15, 0.20)
        }
        KnownClass::GrapeHealthy => RelaxRule::new(1.65, 0.82, 0.20).with_leaf(0.35, 0.32),
        KnownClass::OrangeHaunglongbing => RelaxRule::new(1.85, 0.78, 0.20).with_leaf(0.16, 0.16),
        KnownClass::RiceLeafBlast => RelaxRule::new(1.75, 0.80, 0.20).with_leaf(0.25, 0.35),
        KnownClass::TomatoSeptoriaLeafSpot => RelaxRule {
            highlight_max: Some(0.10),
            ..RelaxRule::new(1.80, 0.85, 0.25).with_leaf(0.18, 0.18)
        },
        _ => return None,
    };
    Some(rule)
}

/// Classes whose lesions can hide the green signal of the leaf.
pub const NECROSIS_PRONE: [KnownClass; 7] = [
    KnownClass::CornNorthernLeafBlight,
    KnownClass::CornGrayLeafSpot,
    KnownClass::TomatoLateBlight,
    KnownClass::TomatoTargetSpot,
    KnownClass::PotatoLateBlight,
    KnownClass::RiceBrownSpot,
    KnownClass::TomatoEarlyBlight,
];

pub const POWDERY_MILDEW: [KnownClass; 1] = [KnownClass::CherryPowderyMildew];

/// Healthy classes commonly photographed as small leaves in a wide frame.
pub const SMALL_LEAF_HEALTHY: [KnownClass; 6] = [
    KnownClass::PeachHealthy,
    KnownClass::AppleHealthy,
    KnownClass::GrapeHealthy,
    KnownClass::SoybeanHealthy,
    KnownClass::BlueberryHealthy,
    KnownClass::PepperBellHealthy,
];

/// Classes the guard override may never accept.
pub const GUARD_OVERRIDE_DENY: [KnownClass; 1] = [KnownClass::StrawberryLeafScorch];

pub fn is_member(list: &[KnownClass], class: Option<KnownClass>) -> bool {
    class.is_some_and(|c| list.contains(&c))
}
