//! Deterministic test-time augmentation views.

use image::imageops;
use image::RgbImage;
use serde::Serialize;

use crate::classifier::ModelPair;
use crate::error::ClassifyError;
use crate::probability::ClassProbability;

const CENTER_CROP_SCALE: f64 = 0.90;
const CORNER_CROP_SCALE: f64 = 0.85;

/// View sets, from cheapest to most thorough.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TtaStrategy {
    /// The original image only.
    Base,
    /// Original plus horizontal flip.
    Quick,
    /// Center crop and four corner crops, each with its horizontal flip.
    Full,
}

impl TtaStrategy {
    pub fn view_count(self) -> usize {
        match self {
            TtaStrategy::Base => 1,
            TtaStrategy::Quick => 2,
            TtaStrategy::Full => 10,
        }
    }

    pub fn views(self, image: &RgbImage) -> Vec<RgbImage> {
        match self {
            TtaStrategy::Base => vec![image.clone()],
            TtaStrategy::Quick => vec![image.clone(), imageops::flip_horizontal(image)],
            TtaStrategy::Full => {
                let crops = five_crops(image);
                let flipped: Vec<RgbImage> = crops.iter().map(imageops::flip_horizontal).collect();
                crops.into_iter().chain(flipped).collect()
            }
        }
    }
}

fn scaled_side(image: &RgbImage, scale: f64) -> u32 {
    let min_side = image.width().min(image.height());
    ((min_side as f64 * scale) as u32).max(1)
}

fn five_crops(image: &RgbImage) -> Vec<RgbImage> {
    let (w, h) = image.dimensions();
    let s = scaled_side(image, CENTER_CROP_SCALE);
    let c = scaled_side(image, CORNER_CROP_SCALE);
    let crop = |x: u32, y: u32, side: u32| imageops::crop_imm(image, x, y, side, side).to_image();
    vec![
        crop((w - s) / 2, (h - s) / 2, s),
        crop(0, 0, c),
        crop(w - c, 0, c),
        crop(0, h - c, c),
        crop(w - c, h - c, c),
    ]
}

/// Re-runs inference for the image under decision. The entropy gate and the
/// specialist blender call back into this only when their rules ask for it.
pub trait Refiner {
    /// Both models averaged over the views of `strategy`.
    fn refine(&self, strategy: TtaStrategy) -> Result<ModelPair, ClassifyError>;

    fn has_specialist(&self) -> bool;

    /// Specialist probabilities over the full view set, `None` when no
    /// specialist is loaded.
    fn specialist(&self) -> Result<Option<ClassProbability>, ClassifyError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn gradient(w: u32, h: u32) -> RgbImage {
        RgbImage::from_fn(w, h, |x, y| Rgb([x as u8, y as u8, 0]))
    }

    #[test]
    fn test_view_counts() {
        let image = gradient(40, 30);
        for strategy in [TtaStrategy::Base, TtaStrategy::Quick, TtaStrategy::Full] {
            assert_eq!(strategy.views(&image).len(), strategy.view_count());
        }
    }

    #[test]
    fn test_quick_views_are_original_and_flip() {
        let image = gradient(40, 30);
        let views = TtaStrategy::Quick.views(&image);
        assert_eq!(views[0], image);
        assert_eq!(views[1].get_pixel(0, 5), image.get_pixel(39, 5));
    }

    #[test]
    fn test_full_crop_geometry() {
        let image = gradient(100, 60);
        let views = TtaStrategy::Full.views(&image);
        // center crop: int(60*0.9)=54, offset ((100-54)/2, (60-54)/2)
        assert_eq!(views[0].dimensions(), (54, 54));
        assert_eq!(views[0].get_pixel(0, 0), image.get_pixel(23, 3));
        // corners: int(60*0.85)=51
        assert_eq!(views[4].dimensions(), (51, 51));
        assert_eq!(views[4].get_pixel(0, 0), image.get_pixel(49, 9));
        // flips follow the crops
        assert_eq!(views[5].get_pixel(53, 0), views[0].get_pixel(0, 0));
    }

    #[test]
    fn test_views_are_deterministic() {
        let image = gradient(33, 47);
        assert_eq!(
            TtaStrategy::Full.views(&image),
            TtaStrategy::Full.views(&image)
        );
    }

    #[test]
    fn test_tiny_image_still_yields_views() {
        let image = gradient(1, 1);
        let views = TtaStrategy::Full.views(&image);
        assert!(views.iter().all(|v| v.dimensions() == (1, 1)));
    }
}
