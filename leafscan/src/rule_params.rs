//! Tunable thresholds of the decision pipeline.
//!
//! Defaults reproduce the calibrated production rule set. Values can be
//! overridden from a TOML file (missing keys keep their defaults) and a few
//! deployment knobs from environment variables.

use anyhow::{bail, Context, Result};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::calibration::DEFAULT_TEMPERATURE_FLOOR;
use crate::probability::EnsembleMode;

/// Base leaf-presence gate.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeafGateParams {
    /// Minimum leaf-area fraction (default: 0.035)
    pub area_min: f32,
    /// Minimum global ExG mean (default: -0.30)
    pub exg_min: f32,
    /// Box red fraction above which the region counts as red-dominated (default: 0.30)
    pub red_fraction_max: f32,
    /// Box ExG below which a red region is red-dominated (default: -0.10)
    pub red_exg_max: f32,
}

impl Default for LeafGateParams {
    fn default() -> Self {
        Self {
            area_min: 0.035,
            exg_min: -0.30,
            red_fraction_max: 0.30,
            red_exg_max: -0.10,
        }
    }
}

/// Rescue when the heavy model is strongly confident.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeavyRescueParams {
    pub conf_min: f32,
    pub margin_min: f32,
    pub greenness_min: f32,
    pub saturation_min: f32,
    pub area_min: f32,
    pub edge_min: f32,
    pub exg_box_min: f32,
}

impl Default for HeavyRescueParams {
    fn default() -> Self {
        Self {
            conf_min: 0.75,
            margin_min: 0.20,
            greenness_min: 0.03,
            saturation_min: 0.15,
            area_min: 0.02,
            edge_min: 0.02,
            exg_box_min: -0.05,
        }
    }
}

/// Rescue for necrosis-prone classes whose lesions mask the green signal.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NecrosisParams {
    pub enabled: bool,
    pub edge_tau: f32,
    pub lab_a_min: f32,
    pub lab_a_max: f32,
    pub lab_b_min: f32,
    pub lab_b_max: f32,
    pub saturation_max: f32,
    pub greenness_max: f32,
    pub heavy_conf_min: f32,
    pub heavy_margin_min: f32,
}

impl Default for NecrosisParams {
    fn default() -> Self {
        Self {
            enabled: true,
            edge_tau: 0.035,
            lab_a_min: -5.0,
            lab_a_max: 18.0,
            lab_b_min: 5.0,
            lab_b_max: 40.0,
            saturation_max: 0.40,
            greenness_max: 0.15,
            heavy_conf_min: 0.80,
            heavy_margin_min: 0.20,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PowderyParams {
    pub heavy_conf_min: f32,
    pub heavy_margin_min: f32,
    pub edge_min: f32,
    pub max_aspect: f32,
}

impl Default for PowderyParams {
    fn default() -> Self {
        Self {
            heavy_conf_min: 0.90,
            heavy_margin_min: 0.30,
            edge_min: 0.02,
            max_aspect: 6.0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmallLeafParams {
    pub heavy_conf_min: f32,
    pub heavy_margin_min: f32,
    pub area_min: f32,
    pub greenness_min: f32,
    pub saturation_min: f32,
    pub edge_min: f32,
    pub exg_box_min: f32,
}

impl Default for SmallLeafParams {
    fn default() -> Self {
        Self {
            heavy_conf_min: 0.96,
            heavy_margin_min: 0.40,
            area_min: 0.015,
            greenness_min: 0.06,
            saturation_min: 0.12,
            edge_min: 0.02,
            exg_box_min: -0.02,
        }
    }
}

/// Out-of-distribution check for the leaf-scorch class.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrawberryParams {
    pub leafish_area_min: f32,
    pub leafish_greenness_min: f32,
    pub leafish_edge_min: f32,
    pub leafish_exg_box_min: f32,
    pub overrule_conf_min: f32,
    pub overrule_margin_min: f32,
    pub area_min: f32,
    pub greenness_min: f32,
}

impl Default for StrawberryParams {
    fn default() -> Self {
        Self {
            leafish_area_min: 0.12,
            leafish_greenness_min: 0.15,
            leafish_edge_min: 0.02,
            leafish_exg_box_min: -0.05,
            overrule_conf_min: 0.93,
            overrule_margin_min: 0.45,
            area_min: 0.15,
            greenness_min: 0.15,
        }
    }
}

/// Floors of the no-leaf veto.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NoLeafFloors {
    pub area: f32,
    pub greenness: f32,
    pub saturation: f32,
}

impl Default for NoLeafFloors {
    fn default() -> Self {
        Self {
            area: 0.05,
            greenness: 0.05,
            saturation: 0.10,
        }
    }
}

/// Grass-like pattern veto for the citrus-greening class.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GrassVetoParams {
    pub saturation_min: f32,
    pub greenness_lo: f32,
    pub greenness_hi: f32,
    pub area_max: f32,
}

impl Default for GrassVetoParams {
    fn default() -> Self {
        Self {
            saturation_min: 0.65,
            greenness_lo: 0.12,
            greenness_hi: 0.24,
            area_max: 0.15,
        }
    }
}

/// Specialist trigger and blend.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpecialistParams {
    /// Crop family served by the specialist (default: "Rice")
    pub family: String,
    /// Blend weight of the specialist (default: 0.60, env: RICE_BLEND_ALPHA)
    pub blend_alpha: f32,
    /// Water-like fraction at or above which the family is vetoed (default: 0.10)
    pub water_veto_fraction: f32,
    pub area_min: f32,
    pub greenness_min: f32,
    pub entropy_max: f32,
    pub ensemble_top_k: usize,
    pub light_top_k: usize,
    pub alt_area_min: f32,
    pub alt_aspect_min: f32,
    pub alt_heavy_margin_max: f32,
    pub alt_heavy_conf_max: f32,
    pub alt_ensemble_top_k: usize,
    /// Top-k of the light and ensemble vectors checked by the water veto
    pub water_top_k: usize,
}

impl Default for SpecialistParams {
    fn default() -> Self {
        Self {
            family: "Rice".to_string(),
            blend_alpha: 0.60,
            water_veto_fraction: 0.10,
            area_min: 0.30,
            greenness_min: 0.35,
            entropy_max: 1.65,
            ensemble_top_k: 2,
            light_top_k: 3,
            alt_area_min: 0.22,
            alt_aspect_min: 3.0,
            alt_heavy_margin_max: 0.30,
            alt_heavy_conf_max: 0.60,
            alt_ensemble_top_k: 3,
            water_top_k: 3,
        }
    }
}

/// Large-leaf heavy-model override.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverrideParams {
    pub leaf_min: f32,
    pub heavy_min: f32,
    pub heavy_margin_min: f32,
}

impl Default for OverrideParams {
    fn default() -> Self {
        Self {
            leaf_min: 0.65,
            heavy_min: 0.70,
            heavy_margin_min: 0.18,
        }
    }
}

/// Acceptance of the heavy label despite a guard rejection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardOverrideParams {
    pub heavy_min: f32,
    pub heavy_margin_min: f32,
    pub leaf_min: f32,
    pub greenness_min: f32,
    pub red_fraction_max: f32,
    pub red_exg_max: f32,
}

impl Default for GuardOverrideParams {
    fn default() -> Self {
        Self {
            heavy_min: 0.90,
            heavy_margin_min: 0.40,
            leaf_min: 0.10,
            greenness_min: 0.08,
            red_fraction_max: 0.25,
            red_exg_max: -0.10,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntropyParams {
    pub base_threshold: f32,
    pub relax_leaf_heavy_strong: f32,
    pub relax_big_leaf: f32,
    /// Quick-refine entropy at or above `ratio·θ` is rejected without a full refine
    pub escalation_ratio: f32,
}

impl Default for EntropyParams {
    fn default() -> Self {
        Self {
            base_threshold: 1.50,
            relax_leaf_heavy_strong: 1.35,
            relax_big_leaf: 1.40,
            escalation_ratio: 1.20,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusParams {
    pub greenness_min: f32,
    pub mean_conf_min: f32,
    pub min_margin_min: f32,
    pub entropy_cap: f32,
    pub edge_min: f32,
    pub max_aspect: f32,
}

impl Default for ConsensusParams {
    fn default() -> Self {
        Self {
            greenness_min: 0.15,
            mean_conf_min: 0.80,
            min_margin_min: 0.25,
            entropy_cap: 1.40,
            edge_min: 0.02,
            max_aspect: 6.0,
        }
    }
}

/// Heavy-dominant acceptance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeavyHighParams {
    pub leaf_min: f32,
    pub greenness_min: f32,
    pub saturation_min: f32,
    pub edge_min: f32,
    pub abs_conf_min: f32,
    pub abs_margin_min: f32,
    pub entropy_cap: f32,
}

impl Default for HeavyHighParams {
    fn default() -> Self {
        Self {
            leaf_min: 0.22,
            greenness_min: 0.20,
            saturation_min: 0.08,
            edge_min: 0.02,
            abs_conf_min: 0.95,
            abs_margin_min: 0.30,
            entropy_cap: 1.45,
        }
    }
}

/// Re-weighting toward the light model when it confidently disagrees with a
/// specialist-family ensemble pick.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrectionParams {
    pub light_weight: f32,
    pub heavy_weight: f32,
    pub conf_gap_min: f32,
    pub light_margin_min: f32,
    pub entropy_min: f32,
}

impl Default for CorrectionParams {
    fn default() -> Self {
        Self {
            light_weight: 0.60,
            heavy_weight: 0.40,
            conf_gap_min: 0.15,
            light_margin_min: 0.25,
            entropy_min: 1.60,
        }
    }
}

/// Universal guard applied to every class.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalGuardParams {
    /// Both confidences at or below this are unknown (env: LEAF_GATE_MIN)
    pub gate_min: f32,
    /// Confidence gap at or above this is unknown (env: LEAF_DELTA_MAX)
    pub delta_max: f32,
    /// Any confidence at or above this accepts outright (env: PICK_OVERRIDE)
    pub pick_override: f32,
}

impl Default for GlobalGuardParams {
    fn default() -> Self {
        Self {
            gate_min: 0.70,
            delta_max: 0.45,
            pick_override: 0.98,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnsembleParams {
    pub mode: EnsembleMode,
    pub light_weight: f32,
    pub heavy_weight: f32,
}

impl Default for EnsembleParams {
    fn default() -> Self {
        Self {
            mode: EnsembleMode::Prob,
            light_weight: 0.25,
            heavy_weight: 0.75,
        }
    }
}

/// Every tunable of the pipeline.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleParams {
    pub leaf_gate: LeafGateParams,
    pub heavy_rescue: HeavyRescueParams,
    pub necrosis: NecrosisParams,
    pub powdery: PowderyParams,
    pub small_leaf: SmallLeafParams,
    pub strawberry: StrawberryParams,
    pub no_leaf: NoLeafFloors,
    pub grass: GrassVetoParams,
    pub specialist: SpecialistParams,
    pub leaf_override: OverrideParams,
    pub guard_override: GuardOverrideParams,
    pub entropy: EntropyParams,
    pub consensus: ConsensusParams,
    pub heavy_high: HeavyHighParams,
    pub correction: CorrectionParams,
    pub guard: GlobalGuardParams,
    pub ensemble: EnsembleParams,
    pub temperature_floor: TemperatureFloor,
}

/// Floor applied to every calibration temperature (env: T_FLOOR).
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TemperatureFloor(pub f32);

impl Default for TemperatureFloor {
    fn default() -> Self {
        Self(DEFAULT_TEMPERATURE_FLOOR)
    }
}

impl RuleParams {
    /// Parse a TOML override document.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let params: RuleParams = toml::from_str(text).context("Invalid rule parameter file")?;
        let floor = params.temperature_floor.0;
        if !(floor.is_finite() && floor > 0.0) {
            bail!("temperature_floor must be positive, got {floor}");
        }
        Ok(params)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read rule parameters: {}", path.display()))?;
        let params = Self::from_toml_str(&text)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        debug!("Loaded rule parameters from {}", path.display());
        Ok(params)
    }

    /// Defaults, then the optional file, then environment overrides.
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        let mut params = match path {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        params.apply_env_with(|key| std::env::var(key).ok());
        Ok(params)
    }

    /// Apply environment overrides read through `lookup`.
    pub fn apply_env_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let float = |key: &str, slot: &mut f32| {
            if let Some(raw) = lookup(key) {
                match raw.trim().parse::<f32>() {
                    Ok(v) if v.is_finite() => *slot = v,
                    _ => warn!("⚠️  Ignoring invalid {key}={raw}"),
                }
            }
        };
        float("LEAF_GATE_MIN", &mut self.guard.gate_min);
        float("LEAF_DELTA_MAX", &mut self.guard.delta_max);
        float("PICK_OVERRIDE", &mut self.guard.pick_override);
        float("RICE_BLEND_ALPHA", &mut self.specialist.blend_alpha);
        float("ENSEMBLE_W_MN", &mut self.ensemble.light_weight);
        float("ENSEMBLE_W_RN", &mut self.ensemble.heavy_weight);

        if let Some(raw) = lookup("T_FLOOR") {
            match raw.trim().parse::<f32>() {
                Ok(v) if v.is_finite() && v > 0.0 => self.temperature_floor.0 = v,
                _ => warn!("⚠️  Ignoring invalid T_FLOOR={raw}, temperatures must stay positive"),
            }
        }

        if let Some(raw) = lookup("ENSEMBLE_MODE") {
            match raw.parse::<EnsembleMode>() {
                Ok(mode) => self.ensemble.mode = mode,
                Err(e) => warn!("⚠️  {e}, keeping {:?}", self.ensemble.mode),
            }
        }
    }
}
