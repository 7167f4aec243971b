//! Image preprocessing for the face pipeline models
//!
//! All model inputs are NHWC `[1, side, side, 3]` float tensors. Callers own
//! the tensor buffers and pass them in by `&mut`; a buffer must not be shared
//! between two calls that overlap in time.

use std::io::Cursor;

use image::{imageops::FilterType, DynamicImage, RgbImage};
use ndarray::Array4;

use crate::error::{FaceError, Result};
use crate::geometry::transform::{crop_to_absolute, Padding};
use crate::types::{AlignedRoi, ImageSize, Point};

/// Smallest accepted image edge, in pixels
pub const MIN_IMAGE_SIZE: u32 = 16;

/// Pixel value mapping into the model's input range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Normalization {
    /// `[-1, 1]`
    SignedUnit,
    /// `[0, 1]`
    Unit,
}

impl Normalization {
    #[inline]
    pub fn apply(&self, v: f32) -> f32 {
        match self {
            Normalization::SignedUnit => (v - 127.5) / 127.5,
            Normalization::Unit => v / 255.0,
        }
    }
}

/// An RGB source image, oriented and size-checked
#[derive(Debug, Clone)]
pub struct Frame {
    image: RgbImage,
}

impl Frame {
    /// Decode encoded image bytes with EXIF orientation handling
    pub fn decode(data: &[u8]) -> Result<Self> {
        let image = image::load_from_memory(data)
            .map_err(|e| FaceError::ImageDecodeFailed(e.to_string()))?;
        Self::from_image(apply_exif_orientation(data, image))
    }

    /// Wrap raw RGBA8 pixels, row-major with no row padding
    pub fn from_rgba(width: u32, height: u32, pixels: &[u8]) -> Result<Self> {
        let expected = width as usize * height as usize * 4;
        if pixels.len() != expected {
            return Err(FaceError::ImageDecodeFailed(format!(
                "expected {} RGBA bytes for {}x{}, got {}",
                expected,
                width,
                height,
                pixels.len()
            )));
        }
        check_size(width, height)?;

        let rgb: Vec<u8> = pixels
            .chunks_exact(4)
            .flat_map(|px| [px[0], px[1], px[2]])
            .collect();
        let image = RgbImage::from_raw(width, height, rgb)
            .ok_or_else(|| FaceError::ImageDecodeFailed("pixel buffer size mismatch".into()))?;
        Ok(Self { image })
    }

    pub fn from_image(image: DynamicImage) -> Result<Self> {
        check_size(image.width(), image.height())?;
        Ok(Self { image: image.to_rgb8() })
    }

    pub fn size(&self) -> ImageSize {
        ImageSize::new(self.image.width(), self.image.height())
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }
}

fn check_size(width: u32, height: u32) -> Result<()> {
    if width < MIN_IMAGE_SIZE || height < MIN_IMAGE_SIZE {
        return Err(FaceError::ImageTooSmall { width, height });
    }
    Ok(())
}

/// Apply EXIF orientation to correct image rotation
/// Mobile phones often store images with EXIF orientation tags instead of rotating pixels
fn apply_exif_orientation(data: &[u8], image: DynamicImage) -> DynamicImage {
    let orientation = match exif::Reader::new().read_from_container(&mut Cursor::new(data)) {
        Ok(exif_data) => exif_data
            .get_field(exif::Tag::Orientation, exif::In::PRIMARY)
            .and_then(|field| field.value.get_uint(0))
            .unwrap_or(1),
        Err(_) => 1,
    };

    // See https://exiftool.org/TagNames/EXIF.html (Orientation)
    match orientation {
        2 => image.fliph(),
        3 => image.rotate180(),
        4 => image.flipv(),
        5 => image.rotate90().fliph(),
        6 => image.rotate90(),
        7 => image.rotate270().fliph(),
        8 => image.rotate270(),
        _ => image,
    }
}

/// Reuse `slot` if it already has the right shape, else allocate
pub fn input_tensor(slot: Option<Array4<f32>>, side: u32) -> Array4<f32> {
    let shape = [1, side as usize, side as usize, 3];
    match slot {
        Some(t) if t.shape() == shape => t,
        _ => Array4::zeros(shape),
    }
}

fn check_tensor(tensor: &Array4<f32>, side: u32) -> Result<()> {
    let shape = [1, side as usize, side as usize, 3];
    if tensor.shape() != shape {
        return Err(FaceError::invalid(format!(
            "input tensor shape {:?}, expected {:?}",
            tensor.shape(),
            shape
        )));
    }
    Ok(())
}

/// Resize `frame` into a centered `side x side` square, filling `tensor`
///
/// Returns the letterbox margins as fractions of the square.
pub fn letterbox_into(
    frame: &Frame,
    side: u32,
    norm: Normalization,
    tensor: &mut Array4<f32>,
) -> Result<Padding> {
    check_tensor(tensor, side)?;
    let (orig_w, orig_h) = frame.image.dimensions();

    let scale = side as f32 / orig_w.max(orig_h) as f32;
    let new_w = ((orig_w as f32 * scale).round() as u32).clamp(1, side);
    let new_h = ((orig_h as f32 * scale).round() as u32).clamp(1, side);

    let resized = image::imageops::resize(&frame.image, new_w, new_h, FilterType::Triangle);

    let left = (side - new_w) / 2;
    let top = (side - new_h) / 2;
    let right = side - new_w - left;
    let bottom = side - new_h - top;

    tensor.fill(norm.apply(0.0));
    for (x, y, pixel) in resized.enumerate_pixels() {
        let (tx, ty) = ((x + left) as usize, (y + top) as usize);
        for c in 0..3 {
            tensor[[0, ty, tx, c]] = norm.apply(pixel[c] as f32);
        }
    }

    Padding::from_pixels(side, top, bottom, left, right)
}

/// Sample a rotated square region of `frame` into `tensor`
///
/// Each output pixel is mapped through the ROI (and the optional horizontal
/// mirror) back into the source and sampled bilinearly. Samples outside the
/// source are black.
pub fn crop_aligned_into(
    frame: &Frame,
    roi: &AlignedRoi,
    side: u32,
    mirror: bool,
    norm: Normalization,
    tensor: &mut Array4<f32>,
) -> Result<()> {
    check_tensor(tensor, side)?;
    if !(roi.size > 0.0) || !roi.cx.is_finite() || !roi.cy.is_finite() || !roi.theta.is_finite() {
        return Err(FaceError::invalid(format!("degenerate crop region {:?}", roi)));
    }

    let rgb = &frame.image;
    let (w, h) = rgb.dimensions();
    let max_x = (w - 1) as f32;
    let max_y = (h - 1) as f32;
    let step = 1.0 / side as f32;

    for v in 0..side {
        for u in 0..side {
            let local = Point::new((u as f32 + 0.5) * step, (v as f32 + 0.5) * step);
            let src = crop_to_absolute(&local, roi, mirror);
            // Pixel centers sit at +0.5.
            let sx = src.x - 0.5;
            let sy = src.y - 0.5;

            let (tx, ty) = (u as usize, v as usize);
            if !(sx >= 0.0 && sx <= max_x && sy >= 0.0 && sy <= max_y) {
                for c in 0..3 {
                    tensor[[0, ty, tx, c]] = norm.apply(0.0);
                }
                continue;
            }

            let x0 = sx as u32;
            let y0 = sy as u32;
            let x1 = (x0 + 1).min(w - 1);
            let y1 = (y0 + 1).min(h - 1);
            let fx = sx - x0 as f32;
            let fy = sy - y0 as f32;

            let p00 = rgb.get_pixel(x0, y0);
            let p01 = rgb.get_pixel(x0, y1);
            let p10 = rgb.get_pixel(x1, y0);
            let p11 = rgb.get_pixel(x1, y1);

            for c in 0..3 {
                let value = p00[c] as f32 * (1.0 - fx) * (1.0 - fy)
                    + p10[c] as f32 * fx * (1.0 - fy)
                    + p01[c] as f32 * (1.0 - fx) * fy
                    + p11[c] as f32 * fx * fy;
                tensor[[0, ty, tx, c]] = norm.apply(value.clamp(0.0, 255.0));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn solid(width: u32, height: u32, value: u8) -> Frame {
        Frame::from_image(DynamicImage::ImageRgb8(RgbImage::from_pixel(
            width,
            height,
            Rgb([value, value, value]),
        )))
        .unwrap()
    }

    #[test]
    fn test_rejects_tiny_images() {
        let err = Frame::from_image(DynamicImage::ImageRgb8(RgbImage::new(8, 20))).unwrap_err();
        assert!(matches!(err, FaceError::ImageTooSmall { width: 8, height: 20 }));
        assert!(Frame::from_rgba(15, 16, &vec![0u8; 15 * 16 * 4]).is_err());
    }

    #[test]
    fn test_decode_garbage() {
        let err = Frame::decode(b"definitely not an image").unwrap_err();
        assert!(matches!(err, FaceError::ImageDecodeFailed(_)));
    }

    #[test]
    fn test_decode_png() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(20, 18, Rgb([10, 20, 30])));
        let mut bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png).unwrap();
        let frame = Frame::decode(&bytes).unwrap();
        assert_eq!(frame.size(), ImageSize::new(20, 18));
    }

    #[test]
    fn test_from_rgba_drops_alpha() {
        let pixels: Vec<u8> = (0..16 * 16).flat_map(|_| [1u8, 2, 3, 255]).collect();
        let frame = Frame::from_rgba(16, 16, &pixels).unwrap();
        assert_eq!(frame.image().get_pixel(5, 5), &Rgb([1, 2, 3]));
        assert!(Frame::from_rgba(16, 16, &pixels[..10]).is_err());
    }

    #[test]
    fn test_letterbox_wide_image() {
        let frame = solid(64, 32, 255);
        let mut tensor = input_tensor(None, 16);
        let padding = letterbox_into(&frame, 16, Normalization::Unit, &mut tensor).unwrap();

        assert!((padding.top() - 0.25).abs() < 1e-6);
        assert!((padding.bottom() - 0.25).abs() < 1e-6);
        assert_eq!(padding.left(), 0.0);
        assert_eq!(tensor[[0, 0, 8, 0]], 0.0);
        assert!((tensor[[0, 8, 8, 0]] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_input_tensor_reuse() {
        let t = input_tensor(None, 8);
        let ptr = t.as_ptr();
        let reused = input_tensor(Some(t), 8);
        assert_eq!(reused.as_ptr(), ptr);
        assert_eq!(input_tensor(Some(reused), 4).shape(), &[1, 4, 4, 3]);
    }

    #[test]
    fn test_wrong_tensor_shape_rejected() {
        let frame = solid(16, 16, 0);
        let mut tensor = input_tensor(None, 8);
        assert!(letterbox_into(&frame, 16, Normalization::Unit, &mut tensor).is_err());
    }

    #[test]
    fn test_crop_identity_and_mirror() {
        // Left half black, right half white.
        let mut img = RgbImage::new(32, 32);
        for (x, _, p) in img.enumerate_pixels_mut() {
            *p = if x < 16 { Rgb([0, 0, 0]) } else { Rgb([255, 255, 255]) };
        }
        let frame = Frame::from_image(DynamicImage::ImageRgb8(img)).unwrap();
        let roi = AlignedRoi::new(16.0, 16.0, 32.0, 0.0);

        let mut tensor = input_tensor(None, 8);
        crop_aligned_into(&frame, &roi, 8, false, Normalization::Unit, &mut tensor).unwrap();
        assert_eq!(tensor[[0, 4, 0, 0]], 0.0);
        assert!((tensor[[0, 4, 7, 0]] - 1.0).abs() < 1e-6);

        crop_aligned_into(&frame, &roi, 8, true, Normalization::Unit, &mut tensor).unwrap();
        assert!((tensor[[0, 4, 0, 0]] - 1.0).abs() < 1e-6);
        assert_eq!(tensor[[0, 4, 7, 0]], 0.0);
    }

    #[test]
    fn test_crop_outside_is_black() {
        let frame = solid(16, 16, 200);
        let roi = AlignedRoi::new(100.0, 100.0, 8.0, 0.0);
        let mut tensor = input_tensor(None, 4);
        crop_aligned_into(&frame, &roi, 4, false, Normalization::SignedUnit, &mut tensor).unwrap();
        assert!(tensor.iter().all(|&v| (v + 1.0).abs() < 1e-6));
    }
}
