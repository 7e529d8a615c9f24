//! Leaf disease diagnosis from a light and a heavy calibrated classifier.
//!
//! Library entry points are [`pipeline::InferenceContext`] and the deadline
//! wrappers in [`pipeline`]. The `leafscan` binary drives them through
//! [`batch`].

pub mod arbitration;
pub mod batch;
pub mod calibration;
pub mod class_guard;
pub mod class_rules;
pub mod classes;
pub mod classifier;
pub mod color_utils;
pub mod config;
pub mod demo;
pub mod entropy_gate;
pub mod error;
pub mod image_input;
pub mod leaf_metrics;
pub mod leaf_presence;
pub mod model_access;
pub mod onnx_session;
pub mod pipeline;
pub mod probability;
pub mod progress;
pub mod rule_params;
pub mod shared_metadata;
pub mod specialist;
pub mod tta;
pub mod verdict;
pub mod vetoes;

pub use error::ClassifyError;
pub use pipeline::{classify_with_deadline, InferenceContext};
pub use verdict::{ClassificationDetails, FinalVerdict, ReasonCode};
