use image::imageops::{self, FilterType};
use image::RgbaImage;

use crate::{CANVAS_HEIGHT, CANVAS_WIDTH};

/// Forces the sprite sheet onto the fixed game canvas. Aspect ratio is not
/// preserved; the model is prompted for a compatible layout already.
pub fn fit_canvas(image: &RgbaImage) -> RgbaImage {
    resize_exact(image, CANVAS_WIDTH, CANVAS_HEIGHT)
}

pub fn resize_exact(image: &RgbaImage, width: u32, height: u32) -> RgbaImage {
    if image.dimensions() == (width, height) {
        return image.clone();
    }
    imageops::resize(image, width, height, FilterType::Lanczos3)
}

#[cfg(test)]
mod tests {
    use image::Rgba;

    use super::*;

    #[test]
    fn output_is_canvas_sized_for_any_input() {
        for (width, height) in [(100, 100), (1000, 200), (50, 800), (336, 384), (1, 1)] {
            let input = RgbaImage::from_pixel(width, height, Rgba([12, 34, 56, 255]));
            let out = fit_canvas(&input);
            assert_eq!(out.dimensions(), (336, 384), "input {width}x{height}");
        }
    }

    #[test]
    fn fully_transparent_input_stays_transparent() {
        let input = RgbaImage::from_pixel(64, 64, Rgba([0, 0, 0, 0]));
        let out = fit_canvas(&input);
        assert!(out.pixels().all(|pixel| pixel.0[3] == 0));
    }
}
