//! Frame decoding and sub-frame compositing

use crate::{ParleyError, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use image::{imageops, Rgb, RgbImage};
use std::path::Path;

/// Decode a base64 JPEG/PNG frame to RGB
pub fn decode_image_base64(data: &str) -> Result<RgbImage> {
    let bytes = STANDARD
        .decode(data.trim())
        .map_err(|e| ParleyError::ImageError(format!("Invalid base64 image: {}", e)))?;
    Ok(image::load_from_memory(&bytes)?.to_rgb8())
}

pub fn save_png(image: &RgbImage, path: &Path) -> Result<()> {
    image.save_with_format(path, image::ImageFormat::Png)?;
    Ok(())
}

/// Combine up to four frames into one image
///
/// One frame is returned as is, two are laid out side by side, three and
/// four fill a 2x2 grid (three leave the bottom-right cell black). Frames
/// beyond the fourth are ignored. Every cell takes the size of the first
/// frame.
pub fn stack_images(images: &[RgbImage]) -> Result<RgbImage> {
    let first = images
        .first()
        .ok_or_else(|| ParleyError::ImageError("No images to stack".into()))?;
    if images.len() == 1 {
        return Ok(first.clone());
    }

    let (w, h) = first.dimensions();
    let (cols, rows) = if images.len() == 2 { (2, 1) } else { (2, 2) };
    let mut canvas = RgbImage::from_pixel(w * cols, h * rows, Rgb([0, 0, 0]));

    for (i, image) in images.iter().take(4).enumerate() {
        let x = (i as u32 % cols) * w;
        let y = (i as u32 / cols) * h;
        imageops::overlay(&mut canvas, image, x as i64, y as i64);
    }
    Ok(canvas)
}
