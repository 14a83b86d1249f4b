use image::{imageops::FilterType, GrayImage, ImageBuffer, Pixel, Rgb, Rgb32FImage, RgbImage};
use ndarray::{Array4, ArrayView2, Axis};
use tracing::instrument;

use crate::{Error, Result};

/// Both padded input dimensions are multiples of this.
pub const ALIGNMENT: u32 = 32;

pub const MEAN_VALUES: [f32; 3] = [0.485, 0.456, 0.406];
pub const VARIANCE_VALUES: [f32; 3] = [0.229, 0.224, 0.225];

/// How an image was fitted onto the network canvas. Needed again after
/// detection to map boxes back onto the source image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResizeParameters {
    pub ratio: f32,
    pub target_width: u32,
    pub target_height: u32,
    pub padded_width: u32,
    pub padded_height: u32,
}

impl ResizeParameters {
    /// Expected resolution of a half-scale heatmap, `(width, height)`.
    pub fn heatmap_size(&self) -> (u32, u32) {
        (self.padded_width / 2, self.padded_height / 2)
    }
}

fn align_up(value: u32) -> u32 {
    value.div_ceil(ALIGNMENT) * ALIGNMENT
}

pub fn resize_params(
    width: u32,
    height: u32,
    canvas_size: u32,
    mag_ratio: f32,
) -> Result<ResizeParameters> {
    if width == 0 || height == 0 {
        return Err(Error::InvalidImage { width, height });
    }
    if canvas_size == 0 {
        return Err(Error::Config("canvas size must be positive".into()));
    }
    if !mag_ratio.is_finite() || mag_ratio <= 0.0 {
        return Err(Error::Config(format!(
            "magnification ratio must be positive, got {mag_ratio}"
        )));
    }

    let long_side = width.max(height) as f64;
    let target_size = (mag_ratio as f64 * long_side).min(canvas_size as f64);
    let ratio = target_size / long_side;

    let target_width = ((width as f64 * ratio) as u32).max(1);
    let target_height = ((height as f64 * ratio) as u32).max(1);
    let padded_width = align_up(target_width);
    let padded_height = align_up(target_height);

    log::debug!(
        "Resize will change image dimensions from (w: {width}, h: {height}) to (w: {target_width}, h: {target_height}), padded to (w: {padded_width}, h: {padded_height}) with ratio {ratio}."
    );

    Ok(ResizeParameters {
        ratio: ratio as f32,
        target_width,
        target_height,
        padded_width,
        padded_height,
    })
}

/// Resizes with linear interpolation and pastes the result into the top-left
/// corner of a zeroed canvas of the padded size.
#[instrument(level = "debug", skip(image))]
pub fn resize_aspect_ratio(
    image: &RgbImage,
    canvas_size: u32,
    mag_ratio: f32,
) -> Result<(Rgb32FImage, ResizeParameters)> {
    let params = resize_params(image.width(), image.height(), canvas_size, mag_ratio)?;
    let resized = image::imageops::resize(
        image,
        params.target_width,
        params.target_height,
        FilterType::Triangle,
    );

    let mut canvas = Rgb32FImage::new(params.padded_width, params.padded_height);
    for (x, y, pixel) in resized.enumerate_pixels() {
        canvas.put_pixel(x, y, Rgb(pixel.0.map(|c| c as f32)));
    }
    Ok((canvas, params))
}

/// `(pixel - mean * 255) / (variance * 255)` per channel, laid out as
/// `[1, 3, height, width]`.
///
/// Not idempotent: the input must be raw 0..=255 pixel values.
#[instrument(level = "debug", skip(image))]
pub fn normalize_mean_variance(
    image: &Rgb32FImage,
    mean_vals: &[f32; 3],
    variance_vals: &[f32; 3],
) -> Array4<f32> {
    let mean = mean_vals.map(|m| m * 255.0);
    let variance = variance_vals.map(|v| v * 255.0);
    Array4::<f32>::from_shape_fn(
        (1, 3, image.height() as usize, image.width() as usize),
        |(_, ch, y, x)| {
            let pixel = image.get_pixel(x as u32, y as u32).channels()[ch];
            (pixel - mean[ch]) / variance[ch]
        },
    )
}

/// Renders a score map as grayscale, clamping to `[0, 1]`.
pub fn to_luma_image(data: ArrayView2<f32>) -> GrayImage {
    let height = data.len_of(Axis(0));
    let width = data.len_of(Axis(1));
    let pixel_data = data
        .iter()
        .map(|p| (p.clamp(0.0, 1.0) * 255.0) as u8)
        .collect::<Vec<u8>>();
    ImageBuffer::from_raw(width as u32, height as u32, pixel_data)
        .unwrap_or_else(|| GrayImage::new(width as u32, height as u32))
}
