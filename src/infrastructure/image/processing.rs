//! Composable image processing pipelines.
//!
//! A pipeline is an ordered list of pure `image -> image` stages. The
//! built-in transforms degrade to a no-op on empty images or empty targets
//! so a bad input never fails a fetch.

use std::sync::Arc;

use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, Rgba, RgbaImage};

/// A pure image transform.
///
/// Implementations must not share mutable state; the same stage may run on
/// several pipelines at once.
pub trait Transform: Send + Sync {
    /// Applies the transform.
    fn apply(&self, image: DynamicImage) -> DynamicImage;
}

impl<F> Transform for F
where
    F: Fn(DynamicImage) -> DynamicImage + Send + Sync,
{
    fn apply(&self, image: DynamicImage) -> DynamicImage {
        self(image)
    }
}

/// Ordered sequence of transforms. The empty pipeline is the identity.
#[derive(Clone, Default)]
pub struct ProcessingPipeline {
    stages: Vec<Arc<dyn Transform>>,
}

impl ProcessingPipeline {
    /// Returns the identity pipeline.
    #[must_use]
    pub fn identity() -> Self {
        Self::default()
    }

    /// Creates a single-stage pipeline.
    #[must_use]
    pub fn new(transform: impl Transform + 'static) -> Self {
        Self::identity().then(transform)
    }

    /// Appends a stage that runs after the existing ones.
    #[must_use]
    pub fn then(mut self, transform: impl Transform + 'static) -> Self {
        self.stages.push(Arc::new(transform));
        self
    }

    /// Returns a pipeline that runs `self` and then `next`.
    #[must_use]
    pub fn and_then(&self, next: &Self) -> Self {
        let mut stages = Vec::with_capacity(self.stages.len() + next.stages.len());
        stages.extend(self.stages.iter().cloned());
        stages.extend(next.stages.iter().cloned());
        Self { stages }
    }

    /// Number of stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Returns true if the pipeline leaves images untouched.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Runs every stage in order.
    #[must_use]
    pub fn apply(&self, image: DynamicImage) -> DynamicImage {
        self.stages
            .iter()
            .fold(image, |acc, stage| stage.apply(acc))
    }
}

impl std::fmt::Debug for ProcessingPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessingPipeline")
            .field("stages", &self.stages.len())
            .finish()
    }
}

/// Composes two optional pipelines: `f` runs first, then `g`.
///
/// A missing side acts as the identity.
#[must_use]
pub fn compose(
    f: Option<&ProcessingPipeline>,
    g: Option<&ProcessingPipeline>,
) -> Option<ProcessingPipeline> {
    match (f, g) {
        (Some(f), Some(g)) => Some(f.and_then(g)),
        (Some(only), None) | (None, Some(only)) => Some(only.clone()),
        (None, None) => None,
    }
}

fn is_empty_image(image: &DynamicImage) -> bool {
    image.width() == 0 || image.height() == 0
}

/// Largest side, in pixels, a [`Resize`] will produce.
pub const MAX_DIMENSION: u32 = 16_384;

/// Resizes to fill a target size, cropping overflow.
///
/// `scale` is the display density factor (2.0 for a high-density screen);
/// the target is given in points and multiplied by it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Resize {
    /// Target width in points.
    pub width: u32,
    /// Target height in points.
    pub height: u32,
    /// Display scale factor.
    pub scale: f32,
}

impl Resize {
    /// Resizes to `width` x `height` pixels.
    #[must_use]
    pub const fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            scale: 1.0,
        }
    }

    /// Sets the display scale factor.
    #[must_use]
    pub const fn with_scale(mut self, scale: f32) -> Self {
        self.scale = scale;
        self
    }

    /// Returns the target size in pixels, or `None` if either side is
    /// empty or larger than [`MAX_DIMENSION`].
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn pixel_size(&self) -> Option<(u32, u32)> {
        let scale = if self.scale.is_finite() && self.scale > 0.0 {
            self.scale
        } else {
            1.0
        };
        let limit = MAX_DIMENSION as f32;
        let width = (self.width as f32 * scale).round();
        let height = (self.height as f32 * scale).round();
        if width < 1.0 || height < 1.0 || width > limit || height > limit {
            return None;
        }
        Some((width as u32, height as u32))
    }
}

impl Transform for Resize {
    fn apply(&self, image: DynamicImage) -> DynamicImage {
        let Some((width, height)) = self.pixel_size() else {
            return image;
        };
        if is_empty_image(&image) {
            return image;
        }
        if image.dimensions() == (width, height) {
            return image;
        }
        image.resize_to_fill(width, height, FilterType::Lanczos3)
    }
}

/// Rounds the corners, painting the cut-off area with a background color.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RoundedCorners {
    /// Corner radius in pixels; clamped to half the shorter side.
    pub radius: f32,
    /// Fill for pixels outside the rounded rectangle.
    pub background: Rgba<u8>,
}

impl RoundedCorners {
    /// Creates a rounded-corner transform.
    #[must_use]
    pub const fn new(radius: f32, background: Rgba<u8>) -> Self {
        Self { radius, background }
    }
}

#[allow(clippy::cast_precision_loss)]
impl Transform for RoundedCorners {
    fn apply(&self, image: DynamicImage) -> DynamicImage {
        if is_empty_image(&image) || !self.radius.is_finite() || self.radius <= 0.0 {
            return image;
        }
        let mut canvas = image.to_rgba8();
        let (w, h) = canvas.dimensions();
        let radius = self.radius.min(w.min(h) as f32 / 2.0);

        for (x, y, pixel) in canvas.enumerate_pixels_mut() {
            let px = x as f32 + 0.5;
            let py = y as f32 + 0.5;
            let cx = px.clamp(radius, w as f32 - radius);
            let cy = py.clamp(radius, h as f32 - radius);
            let (dx, dy) = (px - cx, py - cy);
            if dx * dx + dy * dy > radius * radius {
                *pixel = self.background;
            }
        }
        DynamicImage::ImageRgba8(canvas)
    }
}

/// Crops to the centered square and masks it to a circle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircleCrop {
    /// Fill for pixels outside the circle.
    pub background: Rgba<u8>,
}

impl CircleCrop {
    /// Creates a circle crop transform.
    #[must_use]
    pub const fn new(background: Rgba<u8>) -> Self {
        Self { background }
    }
}

#[allow(clippy::cast_precision_loss)]
impl Transform for CircleCrop {
    fn apply(&self, image: DynamicImage) -> DynamicImage {
        if is_empty_image(&image) {
            return image;
        }
        let (w, h) = image.dimensions();
        let side = w.min(h);
        let square = image.crop_imm((w - side) / 2, (h - side) / 2, side, side);

        let mut canvas: RgbaImage = square.to_rgba8();
        let radius = side as f32 / 2.0;
        for (x, y, pixel) in canvas.enumerate_pixels_mut() {
            let dx = x as f32 + 0.5 - radius;
            let dy = y as f32 + 0.5 - radius;
            if dx * dx + dy * dy > radius * radius {
                *pixel = self.background;
            }
        }
        DynamicImage::ImageRgba8(canvas)
    }
}
