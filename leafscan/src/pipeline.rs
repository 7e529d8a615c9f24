//! Inference context and the per-image classification entry points.
//!
//! An [`InferenceContext`] is built once at startup and shared read-only
//! between requests. Each request extracts metrics, runs the base inference
//! pass and hands both to [`arbitration::decide`], which calls back into a
//! [`TtaController`] only when a rule asks for more views.

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use image::RgbImage;
use log::{debug, info, warn};
use once_cell::unsync::OnceCell;

use crate::arbitration::{self, Decision};
use crate::calibration::Calibration;
use crate::classes::ClassVocabulary;
use crate::classifier::{CalibratedClassifier, ModelPair, ModelRole};
use crate::color_utils::symbols;
use crate::error::ClassifyError;
use crate::leaf_metrics;
use crate::model_access::ModelPaths;
use crate::onnx_session::OnnxBackbone;
use crate::probability::ClassProbability;
use crate::rule_params::RuleParams;
use crate::tta::{Refiner, TtaStrategy};
use crate::verdict::{
    ClassificationDetails, EnsembleSummary, EntropySummary, FinalVerdict, ModelTop1, Picked,
};

/// Loaded models, vocabulary, calibration and rule parameters.
pub struct InferenceContext {
    vocab: ClassVocabulary,
    light: CalibratedClassifier,
    heavy: CalibratedClassifier,
    specialist: Option<CalibratedClassifier>,
    params: RuleParams,
}

impl InferenceContext {
    pub fn new(
        vocab: ClassVocabulary,
        light: CalibratedClassifier,
        heavy: CalibratedClassifier,
        specialist: Option<CalibratedClassifier>,
        params: RuleParams,
    ) -> Self {
        Self {
            vocab,
            light,
            heavy,
            specialist,
            params,
        }
    }

    /// Load everything from disk. A missing specialist disables the blend;
    /// any other failure is `ModelUnavailable`.
    pub fn load(paths: &ModelPaths, device: &str, params: RuleParams) -> Result<Self, ClassifyError> {
        let vocab =
            ClassVocabulary::load(&paths.class_to_idx).map_err(ClassifyError::model_unavailable)?;
        info!("{}Loaded {} classes", symbols::resources_found(), vocab.len());

        let calibration = Calibration::load(
            &paths.temperature_classwise,
            &paths.temperature_scalar,
            &vocab,
            params.temperature_floor.0,
        );

        let load = |name: &str, path: &std::path::Path| {
            OnnxBackbone::load(name, path, device)
                .map_err(|e| ClassifyError::model_unavailable(format!("{name} model: {e:#}")))
        };
        let light = CalibratedClassifier::new(
            ModelRole::Light,
            Box::new(load("light", &paths.light_model)?),
            calibration.light,
        );
        let heavy = CalibratedClassifier::new(
            ModelRole::Heavy,
            Box::new(load("heavy", &paths.heavy_model)?),
            calibration.heavy.clone(),
        );

        // the specialist shares the heavy model's temperatures
        let specialist = if paths.specialist_model.is_file() {
            match OnnxBackbone::load("specialist", &paths.specialist_model, device) {
                Ok(backbone) => Some(CalibratedClassifier::new(
                    ModelRole::Specialist,
                    Box::new(backbone),
                    calibration.heavy,
                )),
                Err(e) => {
                    warn!(
                        "{}Specialist model unavailable, blend disabled: {e:#}",
                        symbols::warning()
                    );
                    None
                }
            }
        } else {
            debug!(
                "No specialist model at {}, blend disabled",
                paths.specialist_model.display()
            );
            None
        };

        Ok(Self::new(vocab, light, heavy, specialist, params))
    }

    pub fn vocab(&self) -> &ClassVocabulary {
        &self.vocab
    }

    pub fn params(&self) -> &RuleParams {
        &self.params
    }

    pub fn has_specialist(&self) -> bool {
        self.specialist.is_some()
    }

    /// Both models over one view set.
    fn infer_pair(&self, views: &[RgbImage]) -> Result<ModelPair, ClassifyError> {
        Ok(ModelPair {
            light: self.light.infer(views, &self.vocab)?,
            heavy: self.heavy.infer(views, &self.vocab)?,
        })
    }

    pub fn classify(&self, image: &RgbImage) -> Result<FinalVerdict, ClassifyError> {
        Ok(self.classify_with_details(image)?.verdict)
    }

    pub fn classify_with_details(
        &self,
        image: &RgbImage,
    ) -> Result<ClassificationDetails, ClassifyError> {
        let metrics = leaf_metrics::extract(image)?;

        let start = Instant::now();
        let base = self.infer_pair(&TtaStrategy::Base.views(image))?;
        let inference_ms = start.elapsed().as_secs_f64() * 1000.0;
        debug!(
            "Base pass {inference_ms:.1}ms: light {} {:.3}, heavy {} {:.3}",
            base.light.top1_label,
            base.light.top1_confidence,
            base.heavy.top1_label,
            base.heavy.top1_confidence
        );

        let refiner = TtaController::new(self, image);
        let decision = arbitration::decide(&self.params, &self.vocab, &metrics, base.clone(), &refiner)?;
        Ok(self.details(&base, decision, inference_ms))
    }

    fn details(&self, base: &ModelPair, decision: Decision, inference_ms: f64) -> ClassificationDetails {
        let Decision { verdict, trace } = decision;
        let e = &self.params.ensemble;
        let (label, confidence) = (verdict.label().to_string(), verdict.confidence());

        ClassificationDetails {
            light: ModelTop1 {
                label: base.light.top1_label.clone(),
                confidence: base.light.top1_confidence,
            },
            heavy: ModelTop1 {
                label: base.heavy.top1_label.clone(),
                confidence: base.heavy.top1_confidence,
            },
            ensemble: EnsembleSummary {
                label,
                confidence,
                mode: e.mode,
                light_weight: e.light_weight,
                heavy_weight: e.heavy_weight,
            },
            picked: Picked::from_verdict(&verdict),
            entropy: EntropySummary {
                light: base.light.entropy(),
                heavy: base.heavy.entropy(),
                ensemble: trace.ensemble.entropy(),
            },
            inference_ms,
            reason: trace.reason,
            signals: trace.signals,
            gate_stage: trace.gate_stage,
            specialist_used: trace.specialist.is_some(),
            verdict,
        }
    }
}

/// Re-runs inference over augmented views of one image on demand.
pub struct TtaController<'a> {
    context: &'a InferenceContext,
    image: &'a RgbImage,
    full_views: OnceCell<Vec<RgbImage>>,
}

impl<'a> TtaController<'a> {
    pub fn new(context: &'a InferenceContext, image: &'a RgbImage) -> Self {
        Self {
            context,
            image,
            full_views: OnceCell::new(),
        }
    }

    fn full_views(&self) -> &[RgbImage] {
        self.full_views
            .get_or_init(|| TtaStrategy::Full.views(self.image))
    }
}

impl Refiner for TtaController<'_> {
    fn refine(&self, strategy: TtaStrategy) -> Result<ModelPair, ClassifyError> {
        debug!(
            "🔁 Refining with {strategy:?} ({} views)",
            strategy.view_count()
        );
        match strategy {
            TtaStrategy::Full => self.context.infer_pair(self.full_views()),
            other => self.context.infer_pair(&other.views(self.image)),
        }
    }

    fn has_specialist(&self) -> bool {
        self.context.has_specialist()
    }

    fn specialist(&self) -> Result<Option<ClassProbability>, ClassifyError> {
        match &self.context.specialist {
            Some(model) => model.probabilities(self.full_views()).map(Some),
            None => Ok(None),
        }
    }
}

/// Run `job` on a worker thread and give up after `timeout`.
///
/// The job is not interrupted; a late result is dropped.
fn run_with_deadline<T, F>(job: F, timeout: Duration) -> Result<T, ClassifyError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, ClassifyError> + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name("leafscan-classify".to_string())
        .spawn(move || {
            let _ = tx.send(job());
        })
        .map_err(ClassifyError::internal)?;

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(mpsc::RecvTimeoutError::Timeout) => {
            warn!("{}Classification exceeded {timeout:?}", symbols::warning());
            Err(ClassifyError::Timeout(timeout))
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => Err(ClassifyError::internal(
            "classification worker exited without a result",
        )),
    }
}

/// [`InferenceContext::classify`] bounded by a deadline around the whole
/// pipeline.
pub fn classify_with_deadline(
    context: Arc<InferenceContext>,
    image: RgbImage,
    timeout: Duration,
) -> Result<FinalVerdict, ClassifyError> {
    run_with_deadline(move || context.classify(&image), timeout)
}

pub fn classify_with_details_deadline(
    context: Arc<InferenceContext>,
    image: RgbImage,
    timeout: Duration,
) -> Result<ClassificationDetails, ClassifyError> {
    run_with_deadline(move || context.classify_with_details(&image), timeout)
}
