//! Fixed preprocessing pass applied before OCR when requested:
//! grayscale, 5x5 median blur, Otsu binary threshold.

use std::io::Cursor;
use std::path::Path;

use anyhow::{Context, Result};
use image::{DynamicImage, GrayImage, ImageFormat};
use imageproc::contrast::{otsu_level, threshold, ThresholdType};
use imageproc::filter::median_filter;

/// Radius of the median filter; 2 gives a 5x5 kernel.
const MEDIAN_RADIUS: u32 = 2;

/// Grayscale → denoise → binarize.
pub fn binarize(img: &DynamicImage) -> GrayImage {
    let gray = img.to_luma8();
    let denoised = median_filter(&gray, MEDIAN_RADIUS, MEDIAN_RADIUS);
    let level = otsu_level(&denoised);
    threshold(&denoised, level, ThresholdType::Binary)
}

/// Decode `bytes`, binarize, and re-encode as PNG for the engine.
pub fn preprocess_image(bytes: &[u8]) -> Result<Vec<u8>> {
    let img = image::load_from_memory(bytes).context("Failed to decode image")?;
    let bitmap = DynamicImage::ImageLuma8(binarize(&img));

    let mut output = Vec::new();
    bitmap
        .write_to(&mut Cursor::new(&mut output), ImageFormat::Png)
        .context("Failed to encode preprocessed image")?;
    Ok(output)
}

pub fn preprocess_file(path: &Path) -> Result<Vec<u8>> {
    let bytes =
        std::fs::read(path).with_context(|| format!("Failed to read image: {:?}", path))?;
    preprocess_image(&bytes)
}
