//! Image decoding and CLIP-style tensor preparation.
//!
//! Steps: decode -> RGB -> center square crop -> resize -> scale to [0, 1]
//! -> per-channel mean/std normalization -> `[1, 3, H, W]`.
//!
//! Cropping the central square before resizing gives the same framing as
//! resize-shortest-side then center crop, and keeps the resize buffer at
//! `image_size x image_size` whatever the aspect ratio.

use std::io::Cursor;

use image::imageops::FilterType;
use image::io::Reader as ImageReader;
use image::{GenericImageView, RgbImage};
use ndarray::Array4;
use serde::Deserialize;

use super::EngineError;

/// OpenAI CLIP normalization constants (shared by BiomedCLIP).
pub const CLIP_MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];
pub const CLIP_STD: [f32; 3] = [0.268_629_54, 0.261_302_58, 0.275_777_11];
pub const CLIP_IMAGE_SIZE: u32 = 224;

/// Largest decoded image accepted (width x height), checked from the header
/// before any pixel buffer is allocated.
pub const MAX_INPUT_PIXELS: u64 = 100_000_000;

/// Decoded and normalized image ready for the vision encoder.
#[derive(Debug, Clone)]
pub struct PreparedImage {
    /// Shape `[1, 3, size, size]`.
    pub pixels: Array4<f32>,
    /// Width of the decoded source image.
    pub width: u32,
    /// Height of the decoded source image.
    pub height: u32,
}

/// Vision-encoder input preparation.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ImagePreprocessor {
    #[serde(default = "default_image_size")]
    pub image_size: u32,
    #[serde(default = "default_mean")]
    pub mean: [f32; 3],
    #[serde(default = "default_std")]
    pub std: [f32; 3],
}

fn default_image_size() -> u32 {
    CLIP_IMAGE_SIZE
}

fn default_mean() -> [f32; 3] {
    CLIP_MEAN
}

fn default_std() -> [f32; 3] {
    CLIP_STD
}

impl Default for ImagePreprocessor {
    fn default() -> Self {
        Self {
            image_size: CLIP_IMAGE_SIZE,
            mean: CLIP_MEAN,
            std: CLIP_STD,
        }
    }
}

impl ImagePreprocessor {
    /// Decode raw bytes (JPEG, PNG, TIFF) and build the encoder tensor.
    pub fn prepare(&self, image_bytes: &[u8]) -> Result<PreparedImage, EngineError> {
        if image_bytes.is_empty() {
            return Err(EngineError::InvalidImage("empty input".to_string()));
        }

        let (width, height) = read_dimensions(image_bytes)?;
        check_dimensions(width, height)?;

        let img = image::load_from_memory(image_bytes)
            .map_err(|e| EngineError::InvalidImage(format!("Failed to decode image: {e}")))?;
        let (width, height) = img.dimensions();
        check_dimensions(width, height)?;

        let rgb = img.to_rgb8();
        let pixels = self.to_tensor(&rgb);

        Ok(PreparedImage {
            pixels,
            width,
            height,
        })
    }

    /// Center square crop, resize to `image_size`, normalize.
    fn to_tensor(&self, rgb: &RgbImage) -> Array4<f32> {
        let size = self.image_size;
        let (x, y, side) = center_square(rgb.width(), rgb.height());
        let square = image::imageops::crop_imm(rgb, x, y, side, side).to_image();
        let resized = image::imageops::resize(&square, size, size, FilterType::CatmullRom);

        let side = size as usize;
        let mut tensor = Array4::<f32>::zeros((1, 3, side, side));
        for y in 0..size {
            for x in 0..size {
                let pixel = resized.get_pixel(x, y);
                for c in 0..3 {
                    let value = f32::from(pixel.0[c]) / 255.0;
                    tensor[[0, c, y as usize, x as usize]] = (value - self.mean[c]) / self.std[c];
                }
            }
        }
        tensor
    }
}

/// Origin and side of the largest centered square in a `width x height` image.
pub fn center_square(width: u32, height: u32) -> (u32, u32, u32) {
    let side = width.min(height);
    ((width - side) / 2, (height - side) / 2, side)
}

fn read_dimensions(image_bytes: &[u8]) -> Result<(u32, u32), EngineError> {
    ImageReader::new(Cursor::new(image_bytes))
        .with_guessed_format()
        .map_err(|e| EngineError::InvalidImage(format!("Failed to read image header: {e}")))?
        .into_dimensions()
        .map_err(|e| EngineError::InvalidImage(format!("Failed to decode image: {e}")))
}

fn check_dimensions(width: u32, height: u32) -> Result<(), EngineError> {
    if width == 0 || height == 0 {
        return Err(EngineError::InvalidImage(format!(
            "degenerate dimensions {width}x{height}"
        )));
    }
    if u64::from(width) * u64::from(height) > MAX_INPUT_PIXELS {
        return Err(EngineError::InvalidImage(format!(
            "image too large: {width}x{height} exceeds {MAX_INPUT_PIXELS} pixels"
        )));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{DynamicImage, ImageOutputFormat, Rgb};

    /// Encode a solid-color RGB image as PNG.
    pub(crate) fn png_bytes(width: u32, height: u32, color: [u8; 3]) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, Rgb(color));
        let mut cursor = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut cursor, ImageOutputFormat::Png)
            .unwrap();
        cursor.into_inner()
    }

    #[test]
    fn prepare_reports_source_dimensions() {
        let prepared = ImagePreprocessor::default()
            .prepare(&png_bytes(320, 240, [200, 10, 10]))
            .unwrap();
        assert_eq!(prepared.width, 320);
        assert_eq!(prepared.height, 240);
        assert_eq!(prepared.pixels.shape(), &[1, 3, 224, 224]);
    }

    #[test]
    fn prepare_normalizes_channels() {
        let prepared = ImagePreprocessor::default()
            .prepare(&png_bytes(64, 64, [255, 0, 0]))
            .unwrap();
        let red = prepared.pixels[[0, 0, 100, 100]];
        let green = prepared.pixels[[0, 1, 100, 100]];
        let expected_red = (1.0 - CLIP_MEAN[0]) / CLIP_STD[0];
        let expected_green = (0.0 - CLIP_MEAN[1]) / CLIP_STD[1];
        assert!((red - expected_red).abs() < 1e-3, "red = {red}");
        assert!((green - expected_green).abs() < 1e-3, "green = {green}");
    }

    #[test]
    fn garbage_bytes_are_invalid_image() {
        let err = ImagePreprocessor::default()
            .prepare(b"not an image")
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidImage(_)));
    }

    #[test]
    fn empty_bytes_are_invalid_image() {
        let err = ImagePreprocessor::default().prepare(&[]).unwrap_err();
        assert!(matches!(err, EngineError::InvalidImage(_)));
    }

    #[test]
    fn center_square_landscape_and_portrait() {
        assert_eq!(center_square(448, 224), (112, 0, 224));
        assert_eq!(center_square(100, 300), (0, 100, 100));
        assert_eq!(center_square(50, 50), (0, 0, 50));
        assert_eq!(center_square(1, 1_000_000), (0, 499_999, 1));
    }

    #[test]
    fn extremely_thin_image_is_prepared() {
        let prepared = ImagePreprocessor::default()
            .prepare(&png_bytes(1, 200_000, [10, 200, 10]))
            .unwrap();
        assert_eq!(prepared.width, 1);
        assert_eq!(prepared.height, 200_000);
        assert_eq!(prepared.pixels.shape(), &[1, 3, 224, 224]);
        let green = prepared.pixels[[0, 1, 0, 223]];
        let expected = (200.0 / 255.0 - CLIP_MEAN[1]) / CLIP_STD[1];
        assert!((green - expected).abs() < 1e-2, "green = {green}");
    }

    #[test]
    fn oversized_dimensions_rejected() {
        assert!(check_dimensions(10_000, 10_000).is_ok());
        let err = check_dimensions(20_000, 20_000).unwrap_err();
        assert!(matches!(err, EngineError::InvalidImage(_)));
        assert!(matches!(
            check_dimensions(0, 10).unwrap_err(),
            EngineError::InvalidImage(_)
        ));
    }

    #[test]
    fn custom_size_respected() {
        let pre = ImagePreprocessor {
            image_size: 32,
            ..ImagePreprocessor::default()
        };
        let prepared = pre.prepare(&png_bytes(40, 90, [1, 2, 3])).unwrap();
        assert_eq!(prepared.pixels.shape(), &[1, 3, 32, 32]);
    }
}
