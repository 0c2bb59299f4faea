//! Output dimension planning
//!
//! Fits a source image inside optional width/height bounds while keeping its
//! aspect ratio. Never upscales.

use image::imageops::FilterType;
use serde::{Deserialize, Serialize};

/// Final output size for a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

/// Output size plus the scale applied along the binding axis
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlannedDimensions {
    pub width: u32,
    pub height: u32,
    pub scale_factor: f64,
}

impl PlannedDimensions {
    pub fn dimensions(&self) -> Dimensions {
        Dimensions {
            width: self.width,
            height: self.height,
        }
    }

    pub fn is_identity(&self) -> bool {
        self.scale_factor >= 1.0
    }

    pub fn resampling(&self) -> Resampling {
        Resampling::for_scale(self.scale_factor)
    }
}

/// Scale factor below which the image is considered heavily downscaled
pub const HEAVY_DOWNSCALE: f64 = 0.5;

/// Resampling quality used when drawing onto the output surface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resampling {
    /// Straight pixel copy, no resize
    None,
    /// Bilinear, enough for mild downscaling
    Medium,
    /// Lanczos, for aggressive downscaling
    High,
}

impl Resampling {
    pub fn for_scale(scale_factor: f64) -> Self {
        if scale_factor >= 1.0 {
            Resampling::None
        } else if scale_factor < HEAVY_DOWNSCALE {
            Resampling::High
        } else {
            Resampling::Medium
        }
    }

    pub fn filter(self) -> Option<FilterType> {
        match self {
            Resampling::None => None,
            Resampling::Medium => Some(FilterType::Triangle),
            Resampling::High => Some(FilterType::Lanczos3),
        }
    }
}

/// Compute output dimensions for a source image
pub fn plan_dimensions(
    source_width: u32,
    source_height: u32,
    max_width: Option<u32>,
    max_height: Option<u32>,
) -> Dimensions {
    plan_dimensions_detailed(source_width, source_height, max_width, max_height).dimensions()
}

/// Same as [`plan_dimensions`], additionally reporting the scale factor
pub fn plan_dimensions_detailed(
    source_width: u32,
    source_height: u32,
    max_width: Option<u32>,
    max_height: Option<u32>,
) -> PlannedDimensions {
    let source_w = f64::from(source_width);
    let source_h = f64::from(source_height);

    let mut width = source_w;
    let mut height = source_h;

    if let Some(max_w) = max_width.filter(|&m| m > 0) {
        if width > f64::from(max_w) {
            height *= f64::from(max_w) / width;
            width = f64::from(max_w);
        }
    }

    if let Some(max_h) = max_height.filter(|&m| m > 0) {
        if height > f64::from(max_h) {
            width *= f64::from(max_h) / height;
            height = f64::from(max_h);
        }
    }

    let scale_factor = if source_w > 0.0 { width / source_w } else { 1.0 };

    PlannedDimensions {
        width: round_dimension(width),
        height: round_dimension(height),
        scale_factor,
    }
}

// A zero-sized surface cannot be encoded, so extreme ratios keep one pixel
fn round_dimension(value: f64) -> u32 {
    (value.round() as u32).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_constraints_is_identity() {
        let planned = plan_dimensions_detailed(640, 480, None, None);
        assert_eq!(planned.dimensions(), Dimensions { width: 640, height: 480 });
        assert_eq!(planned.scale_factor, 1.0);
        assert_eq!(planned.resampling(), Resampling::None);
    }

    #[test]
    fn test_height_bound_dominates() {
        let planned = plan_dimensions_detailed(4000, 3000, Some(1920), Some(1080));
        assert_eq!(planned.dimensions(), Dimensions { width: 1440, height: 1080 });
        assert!((planned.scale_factor - 0.36).abs() < 1e-9);
        assert_eq!(planned.resampling(), Resampling::High);
    }

    #[test]
    fn test_width_only() {
        let dims = plan_dimensions(1000, 500, Some(800), None);
        assert_eq!(dims, Dimensions { width: 800, height: 400 });
    }

    #[test]
    fn test_height_only() {
        let dims = plan_dimensions(1000, 500, None, Some(100));
        assert_eq!(dims, Dimensions { width: 200, height: 100 });
    }

    #[test]
    fn test_never_upscales() {
        let dims = plan_dimensions(300, 200, Some(3000), Some(2000));
        assert_eq!(dims, Dimensions { width: 300, height: 200 });
    }

    #[test]
    fn test_rounds_to_nearest() {
        // 333 * (100 / 1000) = 33.3
        let dims = plan_dimensions(1000, 333, Some(100), None);
        assert_eq!(dims, Dimensions { width: 100, height: 33 });
        // 335 * 0.1 = 33.5
        let dims = plan_dimensions(1000, 335, Some(100), None);
        assert_eq!(dims, Dimensions { width: 100, height: 34 });
    }

    #[test]
    fn test_extreme_ratio_keeps_one_pixel() {
        let dims = plan_dimensions(10_000, 2, Some(100), None);
        assert_eq!(dims, Dimensions { width: 100, height: 1 });
    }

    #[test]
    fn test_resampling_thresholds() {
        assert_eq!(Resampling::for_scale(1.0), Resampling::None);
        assert_eq!(Resampling::for_scale(0.75), Resampling::Medium);
        assert_eq!(Resampling::for_scale(0.5), Resampling::Medium);
        assert_eq!(Resampling::for_scale(0.49), Resampling::High);
    }
}
