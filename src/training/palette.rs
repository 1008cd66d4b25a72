//! Color palettes for prediction renderings

use image::{GrayImage, Rgb, RgbImage};

/// Cityscapes training classes, last entry for anything past class 18
pub const CITYSCAPES: [[u8; 3]; 20] = [
    [128, 64, 128],
    [244, 35, 232],
    [70, 70, 70],
    [102, 102, 156],
    [190, 153, 153],
    [153, 153, 153],
    [250, 170, 30],
    [220, 220, 0],
    [107, 142, 35],
    [152, 251, 152],
    [70, 130, 180],
    [220, 20, 60],
    [255, 0, 0],
    [0, 0, 142],
    [0, 0, 70],
    [0, 60, 100],
    [0, 80, 100],
    [0, 0, 230],
    [119, 11, 32],
    [0, 0, 0],
];

/// Three-class (background / two foreground) palette
pub const TRIPLET: [[u8; 3]; 3] = [[0, 0, 0], [217, 83, 79], [91, 192, 222]];

/// Color lookup for a class count
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Palette {
    Cityscapes,
    Triplet,
    /// Evenly spaced grey levels
    Grey { classes: usize },
}

impl Palette {
    pub fn for_classes(classes: usize) -> Self {
        match classes {
            3 => Palette::Triplet,
            19 => Palette::Cityscapes,
            n => Palette::Grey { classes: n },
        }
    }

    pub fn color(&self, class: u8) -> [u8; 3] {
        match self {
            Palette::Cityscapes => CITYSCAPES[(class as usize).min(CITYSCAPES.len() - 1)],
            Palette::Triplet => TRIPLET[(class as usize).min(TRIPLET.len() - 1)],
            Palette::Grey { classes } => {
                let steps = classes.saturating_sub(1).max(1);
                let level = (class as usize).min(steps) * 255 / steps;
                [level as u8; 3]
            }
        }
    }

    /// Render a class-id map
    pub fn colorize(&self, prediction: &GrayImage) -> RgbImage {
        let (width, height) = prediction.dimensions();
        RgbImage::from_fn(width, height, |x, y| Rgb(self.color(prediction.get_pixel(x, y)[0])))
    }
}
