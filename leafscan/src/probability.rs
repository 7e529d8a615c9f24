//! Class-probability vectors and the arithmetic the decision rules need.

use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};

/// Clamp applied before taking logarithms.
pub const PROB_EPS: f32 = 1e-12;

/// Probability vector indexed by the class vocabulary.
///
/// Entries are non-negative and sum to 1. Every constructor renormalizes, so
/// blends and averages never drift off the simplex.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassProbability(Array1<f32>);

/// One ranked entry of a probability vector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Ranked {
    pub index: usize,
    pub probability: f32,
}

impl ClassProbability {
    /// Temperature-scaled softmax of one row of pre-softmax scores.
    ///
    /// `temperatures` must have one entry per class.
    pub fn from_logits(logits: ArrayView1<f32>, temperatures: &[f32]) -> Self {
        debug_assert_eq!(logits.len(), temperatures.len());
        let scaled: Array1<f32> = logits
            .iter()
            .zip(temperatures)
            .map(|(z, t)| z / t)
            .collect();
        let max = scaled.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let exp = scaled.mapv(|z| (z - max).exp());
        let sum = exp.sum();
        Self(exp / sum)
    }

    /// Normalize arbitrary non-negative weights. Returns `None` when the
    /// weights cannot form a distribution.
    pub fn from_weights(weights: Array1<f32>) -> Option<Self> {
        if weights.is_empty() || weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return None;
        }
        let sum = weights.sum();
        if sum <= 0.0 {
            return None;
        }
        Some(Self(weights / sum))
    }

    pub fn uniform(n: usize) -> Self {
        Self(Array1::from_elem(n, 1.0 / n as f32))
    }

    /// Mean of several vectors over the same vocabulary (TTA pooling).
    pub fn mean(items: &[ClassProbability]) -> Option<Self> {
        let first = items.first()?;
        let mut acc = Array1::<f32>::zeros(first.len());
        for item in items {
            if item.len() != acc.len() {
                return None;
            }
            acc += &item.0;
        }
        Self::from_weights(acc / items.len() as f32)
    }

    /// Equal-weight average, the pooled vector the entropy checks look at.
    pub fn average(a: &ClassProbability, b: &ClassProbability) -> Self {
        Self::weighted(a, 0.5, b, 0.5)
    }

    /// `wa·a + wb·b`, renormalized.
    pub fn weighted(a: &ClassProbability, wa: f32, b: &ClassProbability, wb: f32) -> Self {
        let mixed = &a.0 * wa + &b.0 * wb;
        Self::from_weights(mixed).unwrap_or_else(|| a.clone())
    }

    /// Soft blend `(1-α)·self + α·other`, renormalized.
    pub fn blend(&self, other: &ClassProbability, alpha: f32) -> Self {
        Self::weighted(self, 1.0 - alpha, other, alpha)
    }

    /// Geometric pooling: softmax of weighted log-probabilities.
    pub fn log_pool(a: &ClassProbability, wa: f32, b: &ClassProbability, wb: f32) -> Self {
        let z: Array1<f32> = a
            .0
            .iter()
            .zip(b.0.iter())
            .map(|(pa, pb)| wa * pa.max(PROB_EPS).ln() + wb * pb.max(PROB_EPS).ln())
            .collect();
        let ones = vec![1.0; z.len()];
        Self::from_logits(z.view(), &ones)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn values(&self) -> &Array1<f32> {
        &self.0
    }

    pub fn get(&self, index: usize) -> f32 {
        self.0.get(index).copied().unwrap_or(0.0)
    }

    /// Index of the largest entry; the first one wins on ties.
    pub fn argmax(&self) -> usize {
        self.ranked().first().map(|r| r.index).unwrap_or(0)
    }

    /// Entries sorted by descending probability, ties broken by index.
    pub fn ranked(&self) -> Vec<Ranked> {
        let mut ranked: Vec<Ranked> = self
            .0
            .iter()
            .enumerate()
            .map(|(index, &probability)| Ranked { index, probability })
            .collect();
        ranked.sort_by(|a, b| {
            b.probability
                .total_cmp(&a.probability)
                .then(a.index.cmp(&b.index))
        });
        ranked
    }

    pub fn top_k(&self, k: usize) -> Vec<usize> {
        self.ranked().into_iter().take(k).map(|r| r.index).collect()
    }

    /// Top-1 probability.
    pub fn confidence(&self) -> f32 {
        self.ranked().first().map(|r| r.probability).unwrap_or(0.0)
    }

    /// Top-1 minus top-2 probability.
    pub fn margin(&self) -> f32 {
        let ranked = self.ranked();
        match ranked.as_slice() {
            [first, second, ..] => first.probability - second.probability,
            [first] => first.probability,
            [] => 0.0,
        }
    }

    /// Shannon entropy in nats.
    pub fn entropy(&self) -> f32 {
        self.0
            .iter()
            .map(|&p| {
                let p = p.max(PROB_EPS);
                -p * p.ln()
            })
            .sum()
    }
}

/// How the two classifiers are pooled into the ensemble vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnsembleMode {
    /// Weighted arithmetic mean of probabilities.
    Prob,
    /// Weighted mean of log-probabilities, re-softmaxed.
    Logit,
}

impl std::str::FromStr for EnsembleMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "prob" => Ok(EnsembleMode::Prob),
            "logit" => Ok(EnsembleMode::Logit),
            other => Err(format!("Unknown ensemble mode: {other}")),
        }
    }
}

/// Pool the light and heavy vectors with the configured weights.
pub fn ensemble(
    light: &ClassProbability,
    heavy: &ClassProbability,
    mode: EnsembleMode,
    light_weight: f32,
    heavy_weight: f32,
) -> ClassProbability {
    match mode {
        EnsembleMode::Prob => ClassProbability::weighted(light, light_weight, heavy, heavy_weight),
        EnsembleMode::Logit => {
            ClassProbability::log_pool(light, light_weight, heavy, heavy_weight)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn probs(values: &[f32]) -> ClassProbability {
        ClassProbability::from_weights(Array1::from_vec(values.to_vec())).unwrap()
    }

    #[test]
    fn test_softmax_is_a_distribution() {
        let logits = array![2.0f32, -1.0, 0.5, 7.0];
        let p = ClassProbability::from_logits(logits.view(), &[1.0, 1.0, 1.0, 1.0]);
        assert!((p.values().sum() - 1.0).abs() < 1e-5);
        assert!(p.values().iter().all(|&v| v >= 0.0));
        assert_eq!(p.argmax(), 3);
    }

    #[test]
    fn test_temperature_flattens_distribution() {
        let logits = array![4.0f32, 1.0, 0.0];
        let sharp = ClassProbability::from_logits(logits.view(), &[1.0, 1.0, 1.0]);
        let soft = ClassProbability::from_logits(logits.view(), &[3.0, 3.0, 3.0]);
        assert!(soft.confidence() < sharp.confidence());
        assert!(soft.entropy() > sharp.entropy());
    }

    #[test]
    fn test_uniform_entropy_is_ln_n() {
        for n in [2usize, 5, 38] {
            let p = ClassProbability::uniform(n);
            assert!((p.entropy() - (n as f32).ln()).abs() < 1e-4);
        }
    }

    #[test]
    fn test_entropy_grows_towards_uniform() {
        let peaked = probs(&[0.9, 0.05, 0.05]);
        let uniform = ClassProbability::uniform(3);
        let mut last = peaked.entropy();
        for step in 1..=10 {
            let t = step as f32 / 10.0;
            let mixed = peaked.blend(&uniform, t);
            let h = mixed.entropy();
            assert!(h + 1e-6 >= last, "entropy decreased at t={t}");
            last = h;
        }
    }

    #[test]
    fn test_margin_and_ranking() {
        let p = probs(&[0.1, 0.6, 0.3]);
        assert_eq!(p.argmax(), 1);
        assert!((p.margin() - 0.3).abs() < 1e-6);
        assert_eq!(p.top_k(2), vec![1, 2]);
    }

    #[test]
    fn test_ties_prefer_lower_index() {
        let p = probs(&[0.4, 0.4, 0.2]);
        assert_eq!(p.argmax(), 0);
        assert_eq!(p.margin(), 0.0);
    }

    #[test]
    fn test_blend_renormalizes() {
        let a = probs(&[0.8, 0.2, 0.0]);
        let b = probs(&[0.0, 0.1, 0.9]);
        let blended = a.blend(&b, 0.6);
        assert!((blended.values().sum() - 1.0).abs() < 1e-6);
        assert!((blended.get(2) - 0.54).abs() < 1e-5);
    }

    #[test]
    fn test_from_weights_rejects_degenerate_input() {
        assert!(ClassProbability::from_weights(array![0.0f32, 0.0]).is_none());
        assert!(ClassProbability::from_weights(array![f32::NAN, 1.0]).is_none());
        assert!(ClassProbability::from_weights(array![-0.1f32, 1.0]).is_none());
    }

    #[test]
    fn test_ensemble_modes_agree_on_clear_winner() {
        let light = probs(&[0.7, 0.2, 0.1]);
        let heavy = probs(&[0.8, 0.1, 0.1]);
        let prob = ensemble(&light, &heavy, EnsembleMode::Prob, 0.25, 0.75);
        let logit = ensemble(&light, &heavy, EnsembleMode::Logit, 0.25, 0.75);
        assert_eq!(prob.argmax(), 0);
        assert_eq!(logit.argmax(), 0);
        assert!((prob.get(0) - 0.775).abs() < 1e-5);
        assert!((logit.values().sum() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_mean_of_views() {
        let a = probs(&[1.0, 0.0]);
        let b = probs(&[0.0, 1.0]);
        let mean = ClassProbability::mean(&[a, b]).unwrap();
        assert!((mean.get(0) - 0.5).abs() < 1e-6);
        assert!(ClassProbability::mean(&[]).is_none());
    }
}
