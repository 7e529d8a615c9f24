use leafscan::calibration::Calibration;
use leafscan::classes::ClassVocabulary;
use leafscan::error::ClassifyError;
use leafscan::model_access::ModelPaths;
use leafscan::pipeline::InferenceContext;
use leafscan::rule_params::RuleParams;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tempfile::tempdir;

fn lookup_in(dir: &Path) -> impl Fn(&str) -> Option<String> {
    let mut vars = HashMap::new();
    vars.insert("MODEL_DIR".to_string(), dir.display().to_string());
    move |key: &str| vars.get(key).cloned()
}

fn write_model_dir(dir: &Path) {
    fs::create_dir_all(dir.join("weights/MN")).unwrap();
    fs::create_dir_all(dir.join("weights/RN")).unwrap();
    fs::create_dir_all(dir.join("calibration")).unwrap();
    fs::write(
        dir.join("weights/class_to_idx.json"),
        r#"{"classes": {"Apple___healthy": 0, "Apple___Apple_scab": 1, "Rice___Leaf_Blast": 2}}"#,
    )
    .unwrap();
    fs::write(
        dir.join("calibration/temperature_classwise_v1.fixed.json"),
        r#"{"mn": {"T": [1.4, 1.0, 2.2]}, "rn": [1.1, 1.3, 0.6]}"#,
    )
    .unwrap();
}

#[test]
fn test_vocabulary_and_calibration_from_model_dir() {
    let dir = tempdir().unwrap();
    write_model_dir(dir.path());
    let paths = ModelPaths::from_env_with(lookup_in(dir.path()));

    let vocab = ClassVocabulary::load(&paths.class_to_idx).unwrap();
    assert_eq!(vocab.len(), 3);
    assert_eq!(vocab.label(2), "Rice___Leaf_Blast");

    let calibration = Calibration::load(
        &paths.temperature_classwise,
        &paths.temperature_scalar,
        &vocab,
        1.0,
    );
    assert_eq!(calibration.light.values(), &[1.4, 1.0, 2.2]);
    // floored at 1.0
    assert_eq!(calibration.heavy.values(), &[1.1, 1.3, 1.0]);
}

#[test]
fn test_missing_calibration_falls_back_to_identity() {
    let dir = tempdir().unwrap();
    write_model_dir(dir.path());
    fs::remove_file(dir.path().join("calibration/temperature_classwise_v1.fixed.json")).unwrap();
    let paths = ModelPaths::from_env_with(lookup_in(dir.path()));
    let vocab = ClassVocabulary::load(&paths.class_to_idx).unwrap();

    let calibration = Calibration::load(
        &paths.temperature_classwise,
        &paths.temperature_scalar,
        &vocab,
        1.0,
    );
    assert_eq!(calibration, Calibration::identity(3));
}

#[test]
fn test_missing_models_are_unavailable() {
    let dir = tempdir().unwrap();
    write_model_dir(dir.path());
    let paths = ModelPaths::from_env_with(lookup_in(dir.path()));

    let err = InferenceContext::load(&paths, "cpu", RuleParams::default())
        .err()
        .unwrap();
    assert!(matches!(err, ClassifyError::ModelUnavailable(_)));
    assert!(err.to_string().contains("light"), "{err}");
}

#[test]
fn test_empty_model_file_is_rejected() {
    let dir = tempdir().unwrap();
    write_model_dir(dir.path());
    fs::write(dir.path().join("weights/MN/best.onnx"), b"").unwrap();
    let paths = ModelPaths::from_env_with(lookup_in(dir.path()));

    let err = InferenceContext::load(&paths, "cpu", RuleParams::default())
        .err()
        .unwrap();
    assert_eq!(err.code(), "ModelUnavailable");
}

#[test]
fn test_missing_vocabulary_is_unavailable() {
    let dir = tempdir().unwrap();
    let paths = ModelPaths::from_env_with(lookup_in(dir.path()));
    let err = InferenceContext::load(&paths, "cpu", RuleParams::default())
        .err()
        .unwrap();
    assert!(matches!(err, ClassifyError::ModelUnavailable(_)));
}
