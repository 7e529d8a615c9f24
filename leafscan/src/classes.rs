//! Class vocabulary and the enumerated classes the decision rules refer to.
//!
//! Labels follow the `Crop___Condition` convention of the training data. The
//! vocabulary is loaded once from `class_to_idx.json`; every label is matched
//! against [`KnownClass`] at load time so rule tables never compare raw
//! strings.

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use serde_json::Value;
use std::path::Path;

/// Classes with dedicated guard, veto, rescue or entropy-relaxation rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum KnownClass {
    AppleHealthy,
    BlueberryHealthy,
    CherryPowderyMildew,
    CornGrayLeafSpot,
    CornCommonRust,
    CornNorthernLeafBlight,
    CucumberPowderyMildew,
    GrapeHealthy,
    OrangeHaunglongbing,
    PeachHealthy,
    PepperBellHealthy,
    PotatoLateBlight,
    RiceBrownSpot,
    RiceLeafBlast,
    RiceSheathBlight,
    SoybeanHealthy,
    StrawberryLeafScorch,
    TomatoEarlyBlight,
    TomatoLateBlight,
    TomatoSeptoriaLeafSpot,
    TomatoSpiderMites,
    TomatoTargetSpot,
}

impl KnownClass {
    pub const ALL: [KnownClass; 22] = [
        KnownClass::AppleHealthy,
        KnownClass::BlueberryHealthy,
        KnownClass::CherryPowderyMildew,
        KnownClass::CornGrayLeafSpot,
        KnownClass::CornCommonRust,
        KnownClass::CornNorthernLeafBlight,
        KnownClass::CucumberPowderyMildew,
        KnownClass::GrapeHealthy,
        KnownClass::OrangeHaunglongbing,
        KnownClass::PeachHealthy,
        KnownClass::PepperBellHealthy,
        KnownClass::PotatoLateBlight,
        KnownClass::RiceBrownSpot,
        KnownClass::RiceLeafBlast,
        KnownClass::RiceSheathBlight,
        KnownClass::SoybeanHealthy,
        KnownClass::StrawberryLeafScorch,
        KnownClass::TomatoEarlyBlight,
        KnownClass::TomatoLateBlight,
        KnownClass::TomatoSeptoriaLeafSpot,
        KnownClass::TomatoSpiderMites,
        KnownClass::TomatoTargetSpot,
    ];

    /// Label as it appears in the training vocabulary.
    pub fn label(self) -> &'static str {
        match self {
            KnownClass::AppleHealthy => "Apple___healthy",
            KnownClass::BlueberryHealthy => "Blueberry___healthy",
            KnownClass::CherryPowderyMildew => "Cherry___Powdery_mildew",
            KnownClass::CornGrayLeafSpot => "Corn___Cercospora_leaf_spot Gray_leaf_spot",
            KnownClass::CornCommonRust => "Corn___Common_rust",
            KnownClass::CornNorthernLeafBlight => "Corn___Northern_Leaf_Blight",
            KnownClass::CucumberPowderyMildew => "Cucumber___Powdery_mildew",
            KnownClass::GrapeHealthy => "Grape___healthy",
            KnownClass::OrangeHaunglongbing => "Orange___Haunglongbing_(Citrus_greening)",
            KnownClass::PeachHealthy => "Peach___healthy",
            KnownClass::PepperBellHealthy => "Pepper,_bell___healthy",
            KnownClass::PotatoLateBlight => "Potato___Late_blight",
            KnownClass::RiceBrownSpot => "Rice___Brown_Spot",
            KnownClass::RiceLeafBlast => "Rice___Leaf_Blast",
            KnownClass::RiceSheathBlight => "Rice___Sheath_Blight",
            KnownClass::SoybeanHealthy => "Soybean___healthy",
            KnownClass::StrawberryLeafScorch => "Strawberry___Leaf_scorch",
            KnownClass::TomatoEarlyBlight => "Tomato___Early_blight",
            KnownClass::TomatoLateBlight => "Tomato___Late_blight",
            KnownClass::TomatoSeptoriaLeafSpot => "Tomato___Septoria_leaf_spot",
            KnownClass::TomatoSpiderMites => "Tomato___Spider_mites Two-spotted_spider_mite",
            KnownClass::TomatoTargetSpot => "Tomato___Target_Spot",
        }
    }

    /// Crop name used in veto reason codes, e.g. `Strawberry_OOD_Veto`.
    pub fn crop(self) -> &'static str {
        crop_family(self.label())
    }

    /// Resolve a vocabulary label, tolerant of punctuation and case drift.
    pub fn from_label(label: &str) -> Option<KnownClass> {
        let canon = canonical_label(label);
        KnownClass::ALL
            .iter()
            .copied()
            .find(|class| canonical_label(class.label()) == canon)
    }
}

/// Canonical form used to compare labels across vocabulary and calibration
/// files.
pub fn canonical_label(label: &str) -> String {
    let mut s = label.replace("___", "_").replace(',', "").replace(' ', "_");
    for ch in ['(', ')', '/', '\\'] {
        s = s.replace(ch, "_");
    }
    while s.contains("__") {
        s = s.replace("__", "_");
    }
    s.trim().to_lowercase()
}

/// Crop family of a label: the part before `___`.
pub fn crop_family(label: &str) -> &str {
    label.split("___").next().unwrap_or(label)
}

/// Ordered class vocabulary shared by all models.
#[derive(Debug, Clone)]
pub struct ClassVocabulary {
    labels: Vec<String>,
    known: Vec<Option<KnownClass>>,
}

impl ClassVocabulary {
    pub fn from_labels(labels: Vec<String>) -> Result<Self> {
        if labels.is_empty() {
            return Err(anyhow!("Class vocabulary is empty"));
        }
        let known = labels.iter().map(|l| KnownClass::from_label(l)).collect();
        Ok(Self { labels, known })
    }

    /// Load `class_to_idx.json`.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("class_to_idx.json not found: {}", path.display()))?;
        let vocab = Self::parse_json(&text)
            .with_context(|| format!("Failed to parse class vocabulary: {}", path.display()))?;
        log::debug!("Loaded {} classes from {}", vocab.len(), path.display());
        Ok(vocab)
    }

    /// Accepts `{name: index}` or `{index: name}`, optionally nested under
    /// `"classes"`.
    pub fn parse_json(text: &str) -> Result<Self> {
        let mut json: Value = serde_json::from_str(text)?;
        if let Some(inner) = json.get("classes").filter(|v| v.is_object()).cloned() {
            json = inner;
        }
        let map = json
            .as_object()
            .ok_or_else(|| anyhow!("Unsupported class_to_idx.json format"))?;

        let mut pairs: Vec<(usize, String)> = Vec::with_capacity(map.len());
        for (key, value) in map {
            let pair = match value {
                Value::Number(n) => {
                    let idx = n
                        .as_f64()
                        .filter(|v| *v >= 0.0)
                        .ok_or_else(|| anyhow!("Invalid class index for {key}"))?;
                    (idx as usize, key.clone())
                }
                Value::String(name) => {
                    let idx: usize = key
                        .trim()
                        .parse()
                        .map_err(|_| anyhow!("Invalid class index key: {key}"))?;
                    (idx, name.clone())
                }
                _ => return Err(anyhow!("Unsupported class_to_idx.json format")),
            };
            pairs.push(pair);
        }
        pairs.sort_by_key(|(idx, _)| *idx);
        Self::from_labels(pairs.into_iter().map(|(_, name)| name).collect())
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn label(&self, index: usize) -> &str {
        self.labels.get(index).map(String::as_str).unwrap_or("")
    }

    pub fn known(&self, index: usize) -> Option<KnownClass> {
        self.known.get(index).copied().flatten()
    }

    pub fn index_of(&self, label: &str) -> Option<usize> {
        let canon = canonical_label(label);
        self.labels.iter().position(|l| canonical_label(l) == canon)
    }

    pub fn family(&self, index: usize) -> &str {
        crop_family(self.label(index))
    }

    pub fn in_family(&self, index: usize, family: &str) -> bool {
        self.family(index).eq_ignore_ascii_case(family)
    }
}
