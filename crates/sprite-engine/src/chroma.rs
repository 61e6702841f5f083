use image::{DynamicImage, Rgba, RgbaImage};

/// Green-screen rule applied to model output.
///
/// A pixel is background when its green channel is above `min_green` and
/// dominates both red and blue by more than `dominance`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChromaKey {
    pub min_green: u8,
    pub dominance: f64,
}

impl Default for ChromaKey {
    fn default() -> Self {
        Self {
            min_green: crate::CHROMA_MIN_GREEN,
            dominance: crate::CHROMA_DOMINANCE,
        }
    }
}

impl ChromaKey {
    pub fn is_background(&self, pixel: &Rgba<u8>) -> bool {
        let [r, g, b, _] = pixel.0;
        let green = f64::from(g);
        g > self.min_green
            && green > f64::from(r) * self.dominance
            && green > f64::from(b) * self.dominance
    }

    /// Converts to RGBA and clears every background pixel to `(0, 0, 0, 0)`.
    pub fn apply(&self, image: &DynamicImage) -> RgbaImage {
        let mut rgba = image.to_rgba8();
        for pixel in rgba.pixels_mut() {
            if self.is_background(pixel) {
                *pixel = Rgba([0, 0, 0, 0]);
            }
        }
        rgba
    }
}

pub fn strip_green(image: &DynamicImage) -> RgbaImage {
    ChromaKey::default().apply(image)
}

#[cfg(test)]
mod tests {
    use image::{Rgb, RgbImage};

    use super::*;

    fn single(pixel: [u8; 4]) -> DynamicImage {
        let mut image = RgbaImage::new(1, 1);
        image.put_pixel(0, 0, Rgba(pixel));
        DynamicImage::ImageRgba8(image)
    }

    #[test]
    fn pure_green_becomes_transparent() {
        let out = strip_green(&single([0, 255, 0, 255]));
        assert_eq!(out.get_pixel(0, 0).0, [0, 0, 0, 0]);
    }

    #[test]
    fn dim_green_at_threshold_is_kept() {
        // g must be strictly above 100
        let out = strip_green(&single([0, 100, 0, 255]));
        assert_eq!(out.get_pixel(0, 0).0, [0, 100, 0, 255]);
        let out = strip_green(&single([0, 101, 0, 255]));
        assert_eq!(out.get_pixel(0, 0).0, [0, 0, 0, 0]);
    }

    #[test]
    fn dominance_is_strict_against_red_and_blue() {
        // 130 == 100 * 1.3, not strictly greater
        let out = strip_green(&single([100, 130, 0, 255]));
        assert_eq!(out.get_pixel(0, 0).0, [100, 130, 0, 255]);
        let out = strip_green(&single([0, 130, 100, 255]));
        assert_eq!(out.get_pixel(0, 0).0, [0, 130, 100, 255]);
        let out = strip_green(&single([99, 130, 99, 255]));
        assert_eq!(out.get_pixel(0, 0).0, [0, 0, 0, 0]);
    }

    #[test]
    fn non_matching_pixels_keep_their_alpha() {
        let out = strip_green(&single([200, 40, 40, 17]));
        assert_eq!(out.get_pixel(0, 0).0, [200, 40, 40, 17]);
    }

    #[test]
    fn translucent_green_is_cleared_regardless_of_alpha() {
        let out = strip_green(&single([10, 220, 10, 64]));
        assert_eq!(out.get_pixel(0, 0).0, [0, 0, 0, 0]);
    }

    #[test]
    fn rgb_input_is_promoted_to_opaque_rgba() {
        let mut rgb = RgbImage::new(2, 1);
        rgb.put_pixel(0, 0, Rgb([0, 255, 0]));
        rgb.put_pixel(1, 0, Rgb([240, 200, 180]));
        let out = strip_green(&DynamicImage::ImageRgb8(rgb));
        assert_eq!(out.get_pixel(0, 0).0, [0, 0, 0, 0]);
        assert_eq!(out.get_pixel(1, 0).0, [240, 200, 180, 255]);
    }

    #[test]
    fn predicate_matches_rule_over_a_channel_sweep() {
        let key = ChromaKey::default();
        for r in (0..=255u16).step_by(15) {
            for g in (0..=255u16).step_by(15) {
                for b in (0..=255u16).step_by(15) {
                    let pixel = [r as u8, g as u8, b as u8, 255];
                    let expected = g > 100
                        && f64::from(g) > f64::from(r) * 1.3
                        && f64::from(g) > f64::from(b) * 1.3;
                    assert_eq!(key.is_background(&Rgba(pixel)), expected, "{pixel:?}");
                    let out = key.apply(&single(pixel));
                    if expected {
                        assert_eq!(out.get_pixel(0, 0).0, [0, 0, 0, 0]);
                    } else {
                        assert_eq!(out.get_pixel(0, 0).0, pixel);
                    }
                }
            }
        }
    }
}
