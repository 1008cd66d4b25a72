//! Paired image / label transforms
//!
//! Geometric augmentations must move the image and its label map together. Images
//! are resampled bilinearly; label maps always use nearest-neighbour so class ids
//! are never blended. Pixels introduced by padding or rotation are ignored.

use image::imageops::{self, FilterType};
use image::{GrayImage, Rgb, RgbImage};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::dataset::burn_dataset::SegItem;

/// Per-pixel label map; `None` marks a pixel excluded from loss and metrics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelMap {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<Option<u8>>,
}

impl LabelMap {
    /// Decode a grayscale label image; values `>= num_classes` become ignored
    pub fn decode(gray: &GrayImage, num_classes: usize) -> Self {
        let pixels = gray
            .as_raw()
            .iter()
            .map(|&v| if (v as usize) < num_classes { Some(v) } else { None })
            .collect();
        Self {
            width: gray.width(),
            height: gray.height(),
            pixels,
        }
    }

    pub fn filled(width: u32, height: u32, value: Option<u8>) -> Self {
        Self {
            width,
            height,
            pixels: vec![value; (width * height) as usize],
        }
    }

    pub fn get(&self, x: u32, y: u32) -> Option<u8> {
        if x < self.width && y < self.height {
            self.pixels[(y * self.width + x) as usize]
        } else {
            None
        }
    }

    pub fn crop(&self, x0: u32, y0: u32, width: u32, height: u32) -> Self {
        let mut pixels = Vec::with_capacity((width * height) as usize);
        for y in y0..y0 + height {
            for x in x0..x0 + width {
                pixels.push(self.get(x, y));
            }
        }
        Self {
            width,
            height,
            pixels,
        }
    }

    pub fn flip_horizontal(&self) -> Self {
        let mut pixels = Vec::with_capacity(self.pixels.len());
        for y in 0..self.height {
            for x in (0..self.width).rev() {
                pixels.push(self.get(x, y));
            }
        }
        Self {
            width: self.width,
            height: self.height,
            pixels,
        }
    }

    pub fn resize_nearest(&self, width: u32, height: u32) -> Self {
        let mut pixels = Vec::with_capacity((width * height) as usize);
        for y in 0..height {
            let sy = ((y as f32 + 0.5) * self.height as f32 / height as f32) as u32;
            for x in 0..width {
                let sx = ((x as f32 + 0.5) * self.width as f32 / width as f32) as u32;
                pixels.push(self.get(sx.min(self.width - 1), sy.min(self.height - 1)));
            }
        }
        Self {
            width,
            height,
            pixels,
        }
    }

    /// Place this map at (`left`, `top`) inside a larger ignored canvas
    pub fn pad_to(&self, width: u32, height: u32, left: u32, top: u32) -> Self {
        let mut out = Self::filled(width, height, None);
        for y in 0..self.height {
            for x in 0..self.width {
                out.pixels[((y + top) * width + x + left) as usize] = self.get(x, y);
            }
        }
        out
    }
}

/// Augmentation settings for one loader
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AugmentationConfig {
    /// Square crop size; `None` keeps the full image
    pub crop_size: Option<u32>,
    /// Scale factor range `[1/s, s]`; 0 disables scaling
    pub random_scale: f32,
    /// Maximum rotation in degrees (applies ±random_rotate); 0 disables
    pub random_rotate: f32,
    /// Probability of a horizontal flip
    pub horizontal_flip_prob: f32,
}

impl AugmentationConfig {
    /// Scale, rotate, crop and flip
    pub fn training(crop_size: u32, random_scale: f32, random_rotate: f32) -> Self {
        Self {
            crop_size: Some(crop_size),
            random_scale,
            random_rotate,
            horizontal_flip_prob: 0.5,
        }
    }

    /// Optional random crop only
    pub fn validation(crop_size: Option<u32>) -> Self {
        Self {
            crop_size,
            random_scale: 0.0,
            random_rotate: 0.0,
            horizontal_flip_prob: 0.0,
        }
    }

    pub fn none() -> Self {
        Self::validation(None)
    }

    pub fn is_identity(&self) -> bool {
        self.crop_size.is_none()
            && self.random_scale == 0.0
            && self.random_rotate == 0.0
            && self.horizontal_flip_prob == 0.0
    }
}

/// Applies an [`AugmentationConfig`] to image/label pairs
#[derive(Clone, Debug)]
pub struct Augmenter {
    config: AugmentationConfig,
}

impl Augmenter {
    pub fn new(config: AugmentationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AugmentationConfig {
        &self.config
    }

    pub fn apply(&self, mut item: SegItem, rng: &mut ChaCha8Rng) -> SegItem {
        if self.config.is_identity() {
            return item;
        }

        if self.config.random_scale > 0.0 && self.config.random_scale != 1.0 {
            let s = self.config.random_scale.max(1.0 / self.config.random_scale);
            let ratio = rng.gen_range(1.0 / s..=s);
            let width = ((item.image.width() as f32 * ratio).round() as u32).max(1);
            let height = ((item.image.height() as f32 * ratio).round() as u32).max(1);
            item.image = imageops::resize(&item.image, width, height, FilterType::Triangle);
            item.label = item.label.map(|l| l.resize_nearest(width, height));
        }

        if self.config.random_rotate > 0.0 {
            let angle = rng.gen_range(-self.config.random_rotate..=self.config.random_rotate);
            if angle.abs() >= 0.1 {
                item.image = rotate_image(&item.image, angle);
                item.label = item.label.map(|l| rotate_label(&l, angle));
            }
        }

        if let Some(size) = self.config.crop_size {
            item = random_crop(item, size, rng);
        }

        if self.config.horizontal_flip_prob > 0.0
            && rng.gen::<f32>() < self.config.horizontal_flip_prob
        {
            item.image = imageops::flip_horizontal(&item.image);
            item.label = item.label.map(|l| l.flip_horizontal());
        }

        item
    }
}

/// Pad to at least `size` on both axes, then cut a random `size x size` window
fn random_crop(mut item: SegItem, size: u32, rng: &mut ChaCha8Rng) -> SegItem {
    let (w, h) = item.image.dimensions();
    if w < size || h < size {
        let pw = w.max(size);
        let ph = h.max(size);
        let left = (pw - w) / 2;
        let top = (ph - h) / 2;
        let mut canvas = RgbImage::from_pixel(pw, ph, Rgb([0, 0, 0]));
        imageops::replace(&mut canvas, &item.image, left as i64, top as i64);
        item.image = canvas;
        item.label = item.label.map(|l| l.pad_to(pw, ph, left, top));
    }

    let (w, h) = item.image.dimensions();
    let x = rng.gen_range(0..=w - size);
    let y = rng.gen_range(0..=h - size);
    item.image = imageops::crop_imm(&item.image, x, y, size, size).to_image();
    item.label = item.label.map(|l| l.crop(x, y, size, size));
    item
}

fn rotation_source(x: u32, y: u32, cx: f32, cy: f32, cos_a: f32, sin_a: f32) -> (f32, f32) {
    let dx = x as f32 - cx;
    let dy = y as f32 - cy;
    (cx + dx * cos_a + dy * sin_a, cy - dx * sin_a + dy * cos_a)
}

fn rotate_image(img: &RgbImage, angle_degrees: f32) -> RgbImage {
    let (width, height) = img.dimensions();
    let (sin_a, cos_a) = angle_degrees.to_radians().sin_cos();
    let cx = width as f32 / 2.0;
    let cy = height as f32 / 2.0;

    RgbImage::from_fn(width, height, |x, y| {
        let (sx, sy) = rotation_source(x, y, cx, cy, cos_a, sin_a);
        bilinear_sample(img, sx, sy)
    })
}

fn rotate_label(label: &LabelMap, angle_degrees: f32) -> LabelMap {
    let (sin_a, cos_a) = angle_degrees.to_radians().sin_cos();
    let cx = label.width as f32 / 2.0;
    let cy = label.height as f32 / 2.0;

    let mut pixels = Vec::with_capacity(label.pixels.len());
    for y in 0..label.height {
        for x in 0..label.width {
            let (sx, sy) = rotation_source(x, y, cx, cy, cos_a, sin_a);
            if sx < 0.0 || sy < 0.0 {
                pixels.push(None);
            } else {
                pixels.push(label.get(sx.round() as u32, sy.round() as u32));
            }
        }
    }
    LabelMap {
        width: label.width,
        height: label.height,
        pixels,
    }
}

fn bilinear_sample(img: &RgbImage, x: f32, y: f32) -> Rgb<u8> {
    let (width, height) = img.dimensions();
    if x < 0.0 || y < 0.0 || x > (width - 1) as f32 || y > (height - 1) as f32 {
        return Rgb([0, 0, 0]);
    }

    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    let x1 = (x0 + 1).min(width - 1);
    let y1 = (y0 + 1).min(height - 1);
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let p00 = img.get_pixel(x0, y0);
    let p10 = img.get_pixel(x1, y0);
    let p01 = img.get_pixel(x0, y1);
    let p11 = img.get_pixel(x1, y1);

    let mut out = [0u8; 3];
    for c in 0..3 {
        let v = p00[c] as f32 * (1.0 - fx) * (1.0 - fy)
            + p10[c] as f32 * fx * (1.0 - fy)
            + p01[c] as f32 * (1.0 - fx) * fy
            + p11[c] as f32 * fx * fy;
        out[c] = v.round().clamp(0.0, 255.0) as u8;
    }
    Rgb(out)
}

/// Bilinear resize of one `h x w` float plane into `out` (`oh x ow`)
pub fn resize_plane(src: &[f32], h: usize, w: usize, out: &mut [f32], oh: usize, ow: usize) {
    let scale_y = h as f32 / oh as f32;
    let scale_x = w as f32 / ow as f32;
    for oy in 0..oh {
        let sy = ((oy as f32 + 0.5) * scale_y - 0.5).clamp(0.0, (h - 1) as f32);
        let y0 = sy.floor() as usize;
        let y1 = (y0 + 1).min(h - 1);
        let fy = sy - y0 as f32;
        for ox in 0..ow {
            let sx = ((ox as f32 + 0.5) * scale_x - 0.5).clamp(0.0, (w - 1) as f32);
            let x0 = sx.floor() as usize;
            let x1 = (x0 + 1).min(w - 1);
            let fx = sx - x0 as f32;
            let top = src[y0 * w + x0] * (1.0 - fx) + src[y0 * w + x1] * fx;
            let bottom = src[y1 * w + x0] * (1.0 - fx) + src[y1 * w + x1] * fx;
            out[oy * ow + ox] = top * (1.0 - fy) + bottom * fy;
        }
    }
}
