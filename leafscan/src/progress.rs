//! Global progress bar management.
//!
//! One `MultiProgress` shared by the whole process so log lines and bars do
//! not overwrite each other.

use indicatif::{MultiProgress, ProgressBar};
use once_cell::sync::Lazy;
use std::sync::Arc;

static MULTI: Lazy<Arc<MultiProgress>> = Lazy::new(|| Arc::new(MultiProgress::new()));

/// Cheap handle to the global `MultiProgress`.
pub fn global_mp() -> Arc<MultiProgress> {
    MULTI.clone()
}

pub fn add_progress_bar(pb: ProgressBar) {
    global_mp().add(pb);
}

pub fn remove_progress_bar(pb: &ProgressBar) {
    global_mp().remove(pb);
}
