//! Degraded mode used only when explicitly enabled and the models failed to
//! load. Verdicts come from hints in the file name and are always tagged
//! with the `Demo` reason code.

use std::path::Path;

use crate::verdict::{Diagnostics, FinalVerdict, Provenance, ReasonCode};

const HINTS: [(&str, &str, f32); 4] = [
    ("scab", "Apple___Apple_scab", 0.92),
    ("black", "Apple___Black_rot", 0.88),
    ("rust", "Apple___Cedar_apple_rust", 0.90),
    ("healthy", "Apple___healthy", 0.97),
];
const FALLBACK: (&str, f32) = ("Apple___Apple_scab", 0.75);

pub fn demo_verdict(path: &Path) -> FinalVerdict {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    let hit = HINTS.iter().find(|(hint, _, _)| name.contains(hint));
    let (label, confidence) = hit.map_or(FALLBACK, |&(_, label, conf)| (label, conf));

    FinalVerdict::Accepted {
        label: label.to_string(),
        confidence,
        contributing_model: Provenance::Demo,
        reason_code: ReasonCode::Demo,
        diagnostics: Diagnostics::new()
            .text("hint", hit.map_or("none", |(hint, _, _)| *hint))
            .flag("demo", true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filename_hints() {
        let v = demo_verdict(Path::new("/tmp/Black_Rot_01.JPG"));
        assert_eq!(v.label(), "Apple___Black_rot");
        assert_eq!(v.confidence(), 0.88);
        assert_eq!(v.reason_code(), &ReasonCode::Demo);

        let v = demo_verdict(Path::new("healthy-leaf.png"));
        assert_eq!(v.label(), "Apple___healthy");
    }

    #[test]
    fn test_fallback_is_scab() {
        let v = demo_verdict(Path::new("IMG_2231.jpg"));
        assert_eq!(v.label(), "Apple___Apple_scab");
        assert_eq!(v.confidence(), 0.75);
        assert_eq!(
            v.diagnostics().get("hint"),
            Some(&crate::verdict::DiagnosticValue::Text("none".to_string()))
        );
    }
}
