//! Image-derived leaf, color and texture signals.
//!
//! HSV values use the 8-bit convention H∈[0,180], S,V∈[0,255] so thresholds
//! read the same as in the calibration notebooks.

use image::{GrayImage, Luma, RgbImage};
use imageproc::distance_transform::Norm;
use imageproc::edges::canny;
use imageproc::morphology::{close, open};
use imageproc::region_labelling::{connected_components, Connectivity};
use serde::Serialize;

use crate::error::ClassifyError;

const LEAF_HUE_LO: u8 = 30;
const LEAF_HUE_HI: u8 = 95;
const LEAF_SAT_FLOOR: u8 = 50;
const LEAF_VAL_FLOOR: u8 = 45;
const LEAF_SAT_PERCENTILE: f32 = 20.0;
const LEAF_VAL_PERCENTILE: f32 = 15.0;
const CLAHE_CLIP_LIMIT: f32 = 2.0;
const CLAHE_TILES: u32 = 8;
const BOX_PAD: u32 = 4;

const RED_R_MIN: u8 = 150;
const RED_G_MAX: u8 = 160;
const RED_B_MAX: u8 = 160;

const CANNY_LOW: f32 = 60.0;
const CANNY_HIGH: f32 = 120.0;

const HIGHLIGHT_GRAY_MIN: f32 = 240.0;
const SATURATION_MIN: u8 = 60;
const WATER_HUE_LO: u8 = 70;
const WATER_HUE_HI: u8 = 110;
const WATER_SAT_MIN: u8 = 100;

const EXG_STD_EPS: f32 = 1e-6;

/// Pixel bounds of the padded leaf box, inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LeafBounds {
    pub x0: u32,
    pub y0: u32,
    pub x1: u32,
    pub y1: u32,
}

impl LeafBounds {
    pub fn width(&self) -> u32 {
        self.x1 - self.x0 + 1
    }

    pub fn height(&self) -> u32 {
        self.y1 - self.y0 + 1
    }
}

/// Signals measured inside the bounding box of the largest leaf component.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BoxMetrics {
    /// Mean z-scored ExG over leaf pixels of the box
    pub greenness_box: f32,
    pub red_fraction_box: f32,
    /// Mean of the 0/255 Canny edge map of the box mask
    pub edge_density_box: f32,
    pub lab_chroma_a: f32,
    pub lab_chroma_b: f32,
    pub aspect_ratio: f32,
    pub bounds: Option<LeafBounds>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ImageMetrics {
    /// Largest 4-connected leaf component over image area
    pub leaf_area_fraction: f32,
    /// Mean z-scored excess-green index over the whole image
    pub mean_greenness_index: f32,
    /// Fraction of pixels selected by the adaptive leaf-color mask
    pub leaf_mask_greenness_ratio: f32,
    pub bounding_box: BoxMetrics,
    pub saturation_ratio: f32,
    pub highlight_ratio: f32,
    pub water_like_ratio: f32,
}

impl ImageMetrics {
    /// Box red fraction and greenness both indicate a red, non-leaf subject.
    pub fn red_dominated(&self, red_fraction_max: f32, exg_max: f32) -> bool {
        self.bounding_box.red_fraction_box > red_fraction_max
            && self.bounding_box.greenness_box < exg_max
    }
}

/// Compute all metrics for one decoded raster.
pub fn extract(image: &RgbImage) -> Result<ImageMetrics, ClassifyError> {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return Err(ClassifyError::InvalidImage(format!(
            "empty raster ({width}x{height})"
        )));
    }
    let total = (width as f32) * (height as f32);
    let hsv = HsvImage::from_rgb(image);

    let mask = adaptive_leaf_mask(&hsv);
    let mask_pixels = mask.pixels().filter(|p| p[0] > 0).count();
    let greenness_ratio = mask_pixels as f32 / total;

    let (largest, largest_area) = largest_component(&mask);
    let leaf_area = largest_area as f32 / total;

    let exg = excess_green(image);
    let exg_mean = mean(&exg);

    let bounding_box = match bounding_box(&largest, BOX_PAD) {
        Some(bounds) => box_metrics(image, &largest, bounds),
        None => {
            let (lab_chroma_a, lab_chroma_b) = lab_means(image, None);
            BoxMetrics {
                greenness_box: exg_mean,
                red_fraction_box: red_fraction(image, None),
                edge_density_box: 0.0,
                lab_chroma_a,
                lab_chroma_b,
                aspect_ratio: 1.0,
                bounds: None,
            }
        }
    };

    let metrics = ImageMetrics {
        leaf_area_fraction: leaf_area,
        mean_greenness_index: exg_mean,
        leaf_mask_greenness_ratio: greenness_ratio,
        bounding_box,
        saturation_ratio: hsv.fraction(|_, s, _| s >= SATURATION_MIN),
        highlight_ratio: highlight_ratio(image),
        water_like_ratio: hsv
            .fraction(|h, s, _| (WATER_HUE_LO..=WATER_HUE_HI).contains(&h) && s >= WATER_SAT_MIN),
    };
    log::debug!(
        "Metrics: leaf={:.3} gy={:.3} sat={:.3} hi={:.3} water={:.3} edge={:.3} aspect={:.2}",
        metrics.leaf_area_fraction,
        metrics.leaf_mask_greenness_ratio,
        metrics.saturation_ratio,
        metrics.highlight_ratio,
        metrics.water_like_ratio,
        metrics.bounding_box.edge_density_box,
        metrics.bounding_box.aspect_ratio,
    );
    Ok(metrics)
}

/// 8-bit HSV planes.
struct HsvImage {
    width: u32,
    h: Vec<u8>,
    s: Vec<u8>,
    v: Vec<u8>,
}

impl HsvImage {
    fn from_rgb(image: &RgbImage) -> Self {
        let n = (image.width() * image.height()) as usize;
        let mut out = Self {
            width: image.width(),
            h: Vec::with_capacity(n),
            s: Vec::with_capacity(n),
            v: Vec::with_capacity(n),
        };
        for p in image.pixels() {
            let (h, s, v) = rgb_to_hsv(p[0], p[1], p[2]);
            out.h.push(h);
            out.s.push(s);
            out.v.push(v);
        }
        out
    }

    fn fraction<F: Fn(u8, u8, u8) -> bool>(&self, pred: F) -> f32 {
        let hits = (0..self.h.len())
            .filter(|&i| pred(self.h[i], self.s[i], self.v[i]))
            .count();
        hits as f32 / self.h.len().max(1) as f32
    }
}

pub fn rgb_to_hsv(r: u8, g: u8, b: u8) -> (u8, u8, u8) {
    let (rf, gf, bf) = (r as f32, g as f32, b as f32);
    let max = rf.max(gf).max(bf);
    let min = rf.min(gf).min(bf);
    let diff = max - min;
    let s = if max > 0.0 { diff / max * 255.0 } else { 0.0 };
    let mut h = if diff == 0.0 {
        0.0
    } else if max == rf {
        60.0 * (gf - bf) / diff
    } else if max == gf {
        120.0 + 60.0 * (bf - rf) / diff
    } else {
        240.0 + 60.0 * (rf - gf) / diff
    };
    if h < 0.0 {
        h += 360.0;
    }
    (
        (h / 2.0).round().min(180.0) as u8,
        s.round().min(255.0) as u8,
        max as u8,
    )
}

/// Linear-interpolated percentile, matching the numpy default.
fn percentile(values: &[u8], q: f32) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    let pos = q / 100.0 * (sorted.len() - 1) as f32;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let lo_v = sorted[lo] as f32;
    lo_v + (sorted[hi] as f32 - lo_v) * (pos - lo as f32)
}

/// Hue band with saturation and value floors taken from the image's own
/// percentiles. Value is thresholded after local contrast equalisation so
/// shaded leaves survive.
fn adaptive_leaf_mask(hsv: &HsvImage) -> GrayImage {
    let height = (hsv.h.len() as u32) / hsv.width.max(1);
    let value = GrayImage::from_fn(hsv.width, height, |x, y| {
        Luma([hsv.v[(y * hsv.width + x) as usize]])
    });
    let value = clahe(&value, CLAHE_CLIP_LIMIT, CLAHE_TILES);

    let s_low = percentile(&hsv.s, LEAF_SAT_PERCENTILE).max(LEAF_SAT_FLOOR as f32) as u8;
    let v_low = percentile(value.as_raw(), LEAF_VAL_PERCENTILE).max(LEAF_VAL_FLOOR as f32) as u8;

    let raw = GrayImage::from_fn(hsv.width, height, |x, y| {
        let i = (y * hsv.width + x) as usize;
        let leaf = (LEAF_HUE_LO..=LEAF_HUE_HI).contains(&hsv.h[i])
            && hsv.s[i] >= s_low
            && value.get_pixel(x, y)[0] >= v_low;
        Luma([if leaf { 255 } else { 0 }])
    });
    open(&close(&raw, Norm::LInf, 1), Norm::LInf, 1)
}

/// Contrast-limited adaptive histogram equalisation on a `tiles`×`tiles`
/// grid. Tile lookup tables are blended bilinearly between tile centres.
fn clahe(plane: &GrayImage, clip_limit: f32, tiles: u32) -> GrayImage {
    let (width, height) = plane.dimensions();
    if width == 0 || height == 0 {
        return plane.clone();
    }
    let tiles = tiles.max(1);
    // sizes that do not split evenly are extended by reflection
    let (ext_w, ext_h) = if width % tiles == 0 && height % tiles == 0 {
        (width, height)
    } else {
        (width + tiles - width % tiles, height + tiles - height % tiles)
    };
    let (tile_w, tile_h) = (ext_w / tiles, ext_h / tiles);
    let tile_area = (tile_w * tile_h) as usize;
    let clip = ((clip_limit * tile_area as f32 / 256.0) as usize).max(1);
    let scale = 255.0 / tile_area as f32;

    let mut luts = vec![[0u8; 256]; (tiles * tiles) as usize];
    for ty in 0..tiles {
        for tx in 0..tiles {
            let mut hist = [0usize; 256];
            for y in ty * tile_h..(ty + 1) * tile_h {
                let sy = reflect_101(y, height);
                for x in tx * tile_w..(tx + 1) * tile_w {
                    hist[plane.get_pixel(reflect_101(x, width), sy)[0] as usize] += 1;
                }
            }
            clip_histogram(&mut hist, clip);

            let lut = &mut luts[(ty * tiles + tx) as usize];
            let mut sum = 0usize;
            for (slot, count) in lut.iter_mut().zip(hist.iter()) {
                sum += count;
                *slot = (sum as f32 * scale).round().min(255.0) as u8;
            }
        }
    }

    // neighbouring tile indices and the weight of the second one
    let neighbours = |pos: u32, tile: u32| -> (usize, usize, f32) {
        let f = pos as f32 / tile as f32 - 0.5;
        let lo = f.floor();
        let weight = f - lo;
        let lo = lo as i64;
        let first = lo.max(0) as usize;
        let second = (lo + 1).min(tiles as i64 - 1) as usize;
        (first, second, weight)
    };
    let tiles = tiles as usize;
    GrayImage::from_fn(width, height, |x, y| {
        let v = plane.get_pixel(x, y)[0] as usize;
        let (tx1, tx2, xa) = neighbours(x, tile_w);
        let (ty1, ty2, ya) = neighbours(y, tile_h);
        let at = |ty: usize, tx: usize| luts[ty * tiles + tx][v] as f32;
        let top = at(ty1, tx1) * (1.0 - xa) + at(ty1, tx2) * xa;
        let bottom = at(ty2, tx1) * (1.0 - xa) + at(ty2, tx2) * xa;
        Luma([(top * (1.0 - ya) + bottom * ya).round().clamp(0.0, 255.0) as u8])
    })
}

/// Cap every bin at `clip` and spread the excess evenly, the remainder
/// one count at a time across the range.
fn clip_histogram(hist: &mut [usize; 256], clip: usize) {
    let mut excess = 0usize;
    for bin in hist.iter_mut() {
        if *bin > clip {
            excess += *bin - clip;
            *bin = clip;
        }
    }
    let batch = excess / 256;
    let mut residual = excess - batch * 256;
    for bin in hist.iter_mut() {
        *bin += batch;
    }
    if residual > 0 {
        let step = (256 / residual).max(1);
        let mut i = 0;
        while i < 256 && residual > 0 {
            hist[i] += 1;
            i += step;
            residual -= 1;
        }
    }
}

/// Border index mirrored without repeating the edge pixel (`dcb|abcd|cba`).
fn reflect_101(i: u32, n: u32) -> u32 {
    if n <= 1 {
        return 0;
    }
    let period = 2 * (n - 1);
    let i = i % period;
    if i >= n {
        period - i
    } else {
        i
    }
}

/// Mask of the largest 4-connected component and its pixel count.
fn largest_component(mask: &GrayImage) -> (GrayImage, usize) {
    let labels = connected_components(mask, Connectivity::Four, Luma([0u8]));
    let mut areas: Vec<usize> = Vec::new();
    for p in labels.pixels() {
        let label = p[0] as usize;
        if label == 0 {
            continue;
        }
        if areas.len() <= label {
            areas.resize(label + 1, 0);
        }
        areas[label] += 1;
    }

    let mut best = (0usize, 0usize);
    for (label, &area) in areas.iter().enumerate().skip(1) {
        if area > best.1 {
            best = (label, area);
        }
    }

    let (best_label, best_area) = best;
    let largest = GrayImage::from_fn(mask.width(), mask.height(), |x, y| {
        let label = labels.get_pixel(x, y)[0] as usize;
        Luma([if best_label > 0 && label == best_label {
            255
        } else {
            0
        }])
    });
    (largest, best_area)
}

fn bounding_box(mask: &GrayImage, pad: u32) -> Option<LeafBounds> {
    let mut bounds: Option<LeafBounds> = None;
    for (x, y, p) in mask.enumerate_pixels() {
        if p[0] == 0 {
            continue;
        }
        bounds = Some(match bounds {
            None => LeafBounds {
                x0: x,
                y0: y,
                x1: x,
                y1: y,
            },
            Some(b) => LeafBounds {
                x0: b.x0.min(x),
                y0: b.y0.min(y),
                x1: b.x1.max(x),
                y1: b.y1.max(y),
            },
        });
    }
    bounds.map(|b| LeafBounds {
        x0: b.x0.saturating_sub(pad),
        y0: b.y0.saturating_sub(pad),
        x1: (b.x1 + pad).min(mask.width() - 1),
        y1: (b.y1 + pad).min(mask.height() - 1),
    })
}

fn box_metrics(image: &RgbImage, largest: &GrayImage, bounds: LeafBounds) -> BoxMetrics {
    let (bw, bh) = (bounds.width(), bounds.height());
    let crop = image::imageops::crop_imm(image, bounds.x0, bounds.y0, bw, bh).to_image();
    let mask_box = image::imageops::crop_imm(largest, bounds.x0, bounds.y0, bw, bh).to_image();

    let exg = excess_green(&crop);
    let leaf_exg: Vec<f32> = exg
        .iter()
        .zip(mask_box.pixels())
        .filter(|(_, m)| m[0] > 0)
        .map(|(v, _)| *v)
        .collect();
    let greenness_box = if leaf_exg.is_empty() {
        -1.0
    } else {
        mean(&leaf_exg)
    };

    let edges = canny(&mask_box, CANNY_LOW, CANNY_HIGH);
    let edge_pixels = edges.pixels().filter(|p| p[0] > 0).count();
    let edge_density_box = 255.0 * edge_pixels as f32 / (bw * bh) as f32;

    let (lab_chroma_a, lab_chroma_b) = lab_means(&crop, Some(&mask_box));

    BoxMetrics {
        greenness_box,
        red_fraction_box: red_fraction(&crop, Some(&mask_box)),
        edge_density_box,
        lab_chroma_a,
        lab_chroma_b,
        aspect_ratio: bw.max(bh) as f32 / bw.min(bh).max(1) as f32,
        bounds: Some(bounds),
    }
}

/// ExG = 2G-R-B, z-scored over the region, in row-major order.
fn excess_green(image: &RgbImage) -> Vec<f32> {
    let values: Vec<f32> = image
        .pixels()
        .map(|p| 2.0 * p[1] as f32 - p[0] as f32 - p[2] as f32)
        .collect();
    let m = mean(&values);
    let var = values.iter().map(|v| (v - m) * (v - m)).sum::<f32>() / values.len().max(1) as f32;
    let std = var.sqrt();
    values.iter().map(|v| (v - m) / (std + EXG_STD_EPS)).collect()
}

fn red_fraction(image: &RgbImage, mask: Option<&GrayImage>) -> f32 {
    let is_red = |p: &image::Rgb<u8>| p[0] >= RED_R_MIN && p[1] <= RED_G_MAX && p[2] <= RED_B_MAX;
    match mask {
        Some(mask) => {
            let mut red = 0usize;
            let mut denom = 0usize;
            for (p, m) in image.pixels().zip(mask.pixels()) {
                if m[0] > 0 {
                    denom += 1;
                    if is_red(p) {
                        red += 1;
                    }
                }
            }
            red as f32 / denom.max(1) as f32
        }
        None => {
            let red = image.pixels().filter(|p| is_red(p)).count();
            red as f32 / pixel_count(image)
        }
    }
}

fn highlight_ratio(image: &RgbImage) -> f32 {
    let bright = image
        .pixels()
        .filter(|p| {
            0.299 * p[0] as f32 + 0.587 * p[1] as f32 + 0.114 * p[2] as f32 >= HIGHLIGHT_GRAY_MIN
        })
        .count();
    bright as f32 / pixel_count(image)
}

/// CIE Lab (D65) a*/b* means over masked pixels, or all pixels when the mask
/// is absent or empty.
fn lab_means(image: &RgbImage, mask: Option<&GrayImage>) -> (f32, f32) {
    let use_mask = mask.is_some_and(|m| m.pixels().any(|p| p[0] > 0));
    let mut sum_a = 0.0f64;
    let mut sum_b = 0.0f64;
    let mut n = 0usize;
    for (x, y, p) in image.enumerate_pixels() {
        if use_mask && mask.is_some_and(|m| m.get_pixel(x, y)[0] == 0) {
            continue;
        }
        let (_, a, b) = rgb_to_lab(p[0], p[1], p[2]);
        sum_a += a as f64;
        sum_b += b as f64;
        n += 1;
    }
    if n == 0 {
        return (0.0, 0.0);
    }
    ((sum_a / n as f64) as f32, (sum_b / n as f64) as f32)
}

pub fn rgb_to_lab(r: u8, g: u8, b: u8) -> (f32, f32, f32) {
    fn linear(c: u8) -> f32 {
        let c = c as f32 / 255.0;
        if c <= 0.04045 {
            c / 12.92
        } else {
            ((c + 0.055) / 1.055).powf(2.4)
        }
    }
    fn f(t: f32) -> f32 {
        const DELTA: f32 = 6.0 / 29.0;
        if t > DELTA * DELTA * DELTA {
            t.cbrt()
        } else {
            t / (3.0 * DELTA * DELTA) + 4.0 / 29.0
        }
    }
    let (rl, gl, bl) = (linear(r), linear(g), linear(b));
    let x = (0.412_453 * rl + 0.357_580 * gl + 0.180_423 * bl) / 0.950_456;
    let y = 0.212_671 * rl + 0.715_160 * gl + 0.072_169 * bl;
    let z = (0.019_334 * rl + 0.119_193 * gl + 0.950_227 * bl) / 1.088_754;
    let (fx, fy, fz) = (f(x), f(y), f(z));
    (116.0 * fy - 16.0, 500.0 * (fx - fy), 200.0 * (fy - fz))
}

fn pixel_count(image: &RgbImage) -> f32 {
    ((image.width() * image.height()) as f32).max(1.0)
}

fn mean(values: &[f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f32>() / values.len() as f32
}
