//! Temperature tables for calibrated softmax.
//!
//! A class-wise JSON table is preferred; if it is missing or malformed the
//! scalar `{mn, rn}` pair is used, and if that is also unusable every class
//! gets a temperature of 1.0. All entries are floored so calibration can only
//! soften a distribution, never sharpen it.

use anyhow::{anyhow, Context, Result};
use log::{debug, warn};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;

use crate::classes::{canonical_label, ClassVocabulary};

pub const DEFAULT_TEMPERATURE_FLOOR: f32 = 1.0;

/// Calibration table key of each model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationKey {
    Light,
    Heavy,
}

impl CalibrationKey {
    pub fn as_str(self) -> &'static str {
        match self {
            CalibrationKey::Light => "mn",
            CalibrationKey::Heavy => "rn",
        }
    }
}

/// One temperature per vocabulary class.
#[derive(Debug, Clone, PartialEq)]
pub struct TemperatureTable(Vec<f32>);

impl TemperatureTable {
    pub fn uniform(len: usize, temperature: f32, floor: f32) -> Self {
        Self(vec![temperature.max(floor); len])
    }

    pub fn values(&self) -> &[f32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Parse a class-wise table for one model.
    pub fn parse_classwise(
        text: &str,
        vocab: &ClassVocabulary,
        key: CalibrationKey,
        floor: f32,
    ) -> Result<Self> {
        let json: Value = serde_json::from_str(text)?;
        let key = key.as_str();

        // {"classes": [...], "mn": [T | {"T": T}, ...]}
        if let (Some(Value::Array(names)), Some(Value::Array(blob))) =
            (json.get("classes"), json.get(key))
        {
            if names.len() == blob.len() {
                let by_name: HashMap<String, f32> = names
                    .iter()
                    .zip(blob)
                    .filter_map(|(name, v)| Some((canonical_label(name.as_str()?), entry(v)?)))
                    .collect();
                return Ok(Self::from_named(&by_name, vocab, floor));
            }
        }

        match json.get(key) {
            // {"mn": {"T": [...]}}
            Some(Value::Object(obj)) if obj.get("T").is_some_and(Value::is_array) => {
                let list = obj.get("T").and_then(Value::as_array).cloned().unwrap_or_default();
                Self::from_positional(&list, vocab, floor)
            }
            // {"mn": [...]}
            Some(Value::Array(list)) => Self::from_positional(list, vocab, floor),
            // {"mn": {"class": T | {"T": T}}}
            Some(Value::Object(obj)) => {
                let by_name: HashMap<String, f32> = obj
                    .iter()
                    .filter_map(|(name, v)| Some((canonical_label(name), entry(v)?)))
                    .collect();
                if by_name.is_empty() {
                    return Err(anyhow!("No temperatures found under \"{key}\""));
                }
                Ok(Self::from_named(&by_name, vocab, floor))
            }
            _ => Err(anyhow!("Unsupported class-wise temperature format")),
        }
    }

    fn from_named(by_name: &HashMap<String, f32>, vocab: &ClassVocabulary, floor: f32) -> Self {
        let values = vocab
            .labels()
            .iter()
            .map(|label| {
                by_name
                    .get(&canonical_label(label))
                    .copied()
                    .unwrap_or(1.0)
                    .max(floor)
            })
            .collect();
        Self(values)
    }

    fn from_positional(list: &[Value], vocab: &ClassVocabulary, floor: f32) -> Result<Self> {
        if list.len() != vocab.len() {
            return Err(anyhow!(
                "Temperature list has {} entries, vocabulary has {}",
                list.len(),
                vocab.len()
            ));
        }
        let values = list
            .iter()
            .map(|v| {
                v.as_f64()
                    .map(|t| (t as f32).max(floor))
                    .ok_or_else(|| anyhow!("Non-numeric temperature: {v}"))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self(values))
    }
}

fn entry(value: &Value) -> Option<f32> {
    match value {
        Value::Number(n) => n.as_f64().map(|t| t as f32),
        Value::Object(obj) => obj.get("T").and_then(Value::as_f64).map(|t| t as f32),
        _ => None,
    }
}

/// Read the scalar `{mn, rn}` pair. Missing or malformed files yield 1.0.
pub fn load_scalar_pair(path: &Path) -> (f32, f32) {
    let parsed = std::fs::read_to_string(path)
        .ok()
        .and_then(|text| serde_json::from_str::<Value>(&text).ok());
    let Some(json) = parsed else {
        return (1.0, 1.0);
    };
    let read = |key: &str| {
        json.get(key)
            .and_then(Value::as_f64)
            .map(|t| t as f32)
            .unwrap_or(1.0)
    };
    (read("mn"), read("rn"))
}

/// Temperatures for both models.
#[derive(Debug, Clone, PartialEq)]
pub struct Calibration {
    pub light: TemperatureTable,
    pub heavy: TemperatureTable,
}

impl Calibration {
    pub fn identity(len: usize) -> Self {
        Self {
            light: TemperatureTable::uniform(len, 1.0, 1.0),
            heavy: TemperatureTable::uniform(len, 1.0, 1.0),
        }
    }

    /// Load class-wise temperatures, falling back to the scalar pair.
    pub fn load(
        classwise: &Path,
        scalar: &Path,
        vocab: &ClassVocabulary,
        floor: f32,
    ) -> Calibration {
        if classwise.is_file() {
            match Self::load_classwise(classwise, vocab, floor) {
                Ok(calibration) => {
                    debug!("Loaded class-wise temperatures from {}", classwise.display());
                    return calibration;
                }
                Err(e) => warn!(
                    "⚠️  Ignoring class-wise temperatures {}: {e:#}",
                    classwise.display()
                ),
            }
        }

        let (light, heavy) = load_scalar_pair(scalar);
        debug!("Using scalar temperatures mn={light:.3} rn={heavy:.3}");
        Calibration {
            light: TemperatureTable::uniform(vocab.len(), light, floor),
            heavy: TemperatureTable::uniform(vocab.len(), heavy, floor),
        }
    }

    fn load_classwise(path: &Path, vocab: &ClassVocabulary, floor: f32) -> Result<Calibration> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Ok(Calibration {
            light: TemperatureTable::parse_classwise(&text, vocab, CalibrationKey::Light, floor)?,
            heavy: TemperatureTable::parse_classwise(&text, vocab, CalibrationKey::Heavy, floor)?,
        })
    }
}
