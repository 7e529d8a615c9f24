//! Image decoding and input collection.
//!
//! Sources on the command line may be files, directories (non-recursive) or
//! glob patterns. Strict mode turns unsupported or missing inputs into errors;
//! permissive mode logs and skips them.

use anyhow::{anyhow, Result};
use image::RgbImage;
use std::fs;
use std::path::{Path, PathBuf};

use crate::color_utils::symbols;
use crate::error::ClassifyError;

/// How collection treats bad inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageInputConfig {
    pub strict_mode: bool,
    pub require_glob_matches: bool,
}

impl Default for ImageInputConfig {
    fn default() -> Self {
        Self::from_strict_flag(true)
    }
}

impl ImageInputConfig {
    pub fn from_strict_flag(strict: bool) -> Self {
        Self {
            strict_mode: strict,
            require_glob_matches: strict,
        }
    }
}

/// Decode an encoded image into RGB.
pub fn decode_rgb(bytes: &[u8]) -> Result<RgbImage, ClassifyError> {
    if bytes.is_empty() {
        return Err(ClassifyError::InvalidImage("no image data".to_string()));
    }
    let image = image::load_from_memory(bytes)
        .map_err(|e| ClassifyError::InvalidImage(e.to_string()))?
        .to_rgb8();
    ensure_not_empty(image)
}

/// Read and decode an image file into RGB.
pub fn load_rgb(path: &Path) -> Result<RgbImage, ClassifyError> {
    let image = image::open(path)
        .map_err(|e| ClassifyError::InvalidImage(format!("{}: {e}", path.display())))?
        .to_rgb8();
    ensure_not_empty(image)
}

fn ensure_not_empty(image: RgbImage) -> Result<RgbImage, ClassifyError> {
    if image.width() == 0 || image.height() == 0 {
        return Err(ClassifyError::InvalidImage(format!(
            "empty raster ({}x{})",
            image.width(),
            image.height()
        )));
    }
    Ok(image)
}

/// Supported extensions: jpg, jpeg, png, webp, bmp, tiff, tif
pub fn is_supported_image_file(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .is_some_and(|ext| {
            matches!(
                ext.as_str(),
                "jpg" | "jpeg" | "png" | "webp" | "bmp" | "tiff" | "tif"
            )
        })
}

/// Image files directly inside `dir_path`, sorted.
pub fn find_images_in_directory(dir_path: &Path) -> Result<Vec<PathBuf>> {
    let mut image_files = Vec::new();
    for entry in fs::read_dir(dir_path)? {
        let path = entry?.path();
        if path.is_file() && is_supported_image_file(&path) {
            image_files.push(path);
        }
    }
    image_files.sort();
    Ok(image_files)
}

fn looks_like_glob(source: &str) -> bool {
    source.contains(['*', '?', '['])
}

/// Collect image files from files, directories and glob patterns.
pub fn collect_images_from_sources(
    sources: &[String],
    config: &ImageInputConfig,
) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    let skip = |message: String| -> Result<()> {
        if config.strict_mode {
            Err(anyhow!(message))
        } else {
            log::warn!("{}{message}", symbols::warning());
            Ok(())
        }
    };

    for source in sources {
        let path = Path::new(source);
        if path.is_file() {
            if is_supported_image_file(path) {
                found.push(path.to_path_buf());
            } else {
                skip(format!(
                    "File is not a supported image format: {}",
                    path.display()
                ))?;
            }
        } else if path.is_dir() {
            found.extend(find_images_in_directory(path)?);
        } else if !looks_like_glob(source) {
            skip(format!("File does not exist: {source}"))?;
        } else {
            match glob::glob(source) {
                Ok(paths) => {
                    let before = found.len();
                    for entry in paths {
                        match entry {
                            Ok(p) if p.is_file() && is_supported_image_file(&p) => found.push(p),
                            Ok(_) => {}
                            Err(e) => log::warn!(
                                "{}Error reading path in glob {source}: {e}",
                                symbols::warning()
                            ),
                        }
                    }
                    if found.len() == before && config.require_glob_matches {
                        return Err(anyhow!("No image files found matching pattern: {source}"));
                    }
                }
                Err(_) => skip(format!(
                    "Source path does not exist and is not a valid glob pattern: {source}"
                ))?,
            }
        }
    }

    found.sort();
    found.dedup();

    if found.is_empty() && config.strict_mode {
        return Err(anyhow!("No image files found in the specified sources"));
    }
    Ok(found)
}
