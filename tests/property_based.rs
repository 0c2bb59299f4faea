use image::{DynamicImage, Rgba, RgbaImage};
use img_transcode::converter::Surface;
use img_transcode::planner::Resampling;
use img_transcode::{plan_dimensions, plan_dimensions_detailed, Dimensions, OutputFormat};
use proptest::prelude::*;
use std::sync::OnceLock;

// Fixed textured input shared by every case
fn surface() -> &'static Surface {
    static SURFACE: OnceLock<Surface> = OnceLock::new();
    SURFACE.get_or_init(|| {
        let bitmap = DynamicImage::ImageRgba8(RgbaImage::from_fn(96, 64, |x, y| {
            Rgba([
                (x * 255 / 96) as u8,
                (y * 255 / 64) as u8,
                ((x ^ y) * 7 % 256) as u8,
                255,
            ])
        }));
        let mut surface = Surface::create(96, 64, u64::MAX).unwrap();
        surface.draw(&bitmap, Resampling::None).unwrap();
        surface
    })
}

fn encoded_size(format: OutputFormat, quality: u32) -> usize {
    let fraction = quality as f32 / 100.0;
    surface().encode(format, Some(fraction), 10).unwrap().len()
}

fn lossy_format() -> impl Strategy<Value = OutputFormat> {
    prop_oneof![
        Just(OutputFormat::Jpeg),
        Just(OutputFormat::Webp),
        Just(OutputFormat::Avif),
    ]
}

fn bound_strategy() -> impl Strategy<Value = Option<u32>> {
    prop_oneof![Just(None), (1u32..=8000).prop_map(Some)]
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 256,
        .. ProptestConfig::default()
    })]

    #[test]
    fn prop_output_fits_bounds(
        width in 1u32..=10_000,
        height in 1u32..=10_000,
        max_width in bound_strategy(),
        max_height in bound_strategy(),
    ) {
        let dims = plan_dimensions(width, height, max_width, max_height);
        if let Some(max) = max_width {
            prop_assert!(dims.width <= max);
        }
        if let Some(max) = max_height {
            prop_assert!(dims.height <= max);
        }
        prop_assert!(dims.width >= 1 && dims.height >= 1);
    }

    #[test]
    fn prop_aspect_ratio_preserved(
        width in 1u32..=10_000,
        height in 1u32..=10_000,
        max_width in bound_strategy(),
        max_height in bound_strategy(),
    ) {
        let planned = plan_dimensions_detailed(width, height, max_width, max_height);
        // Each side is the source side times the same scale, up to rounding
        let exact_w = f64::from(width) * planned.scale_factor;
        let exact_h = f64::from(height) * planned.scale_factor;
        prop_assert!((f64::from(planned.width) - exact_w).abs() <= 1.0);
        prop_assert!((f64::from(planned.height) - exact_h).abs() <= 1.0);
        prop_assert!(planned.scale_factor > 0.0 && planned.scale_factor <= 1.0);
    }

    #[test]
    fn prop_no_upscaling_when_already_within_bounds(
        width in 1u32..=4000,
        height in 1u32..=4000,
        slack_w in 0u32..=4000,
        slack_h in 0u32..=4000,
        use_width in any::<bool>(),
        use_height in any::<bool>(),
    ) {
        let max_width = use_width.then_some(width + slack_w);
        let max_height = use_height.then_some(height + slack_h);
        let dims = plan_dimensions(width, height, max_width, max_height);
        prop_assert_eq!(dims, Dimensions { width, height });
    }

    #[test]
    fn prop_binding_axis_hits_its_bound(
        width in 2u32..=6000,
        height in 2u32..=6000,
        max_width in 1u32..=1000,
        max_height in 1u32..=1000,
    ) {
        prop_assume!(width > max_width || height > max_height);
        let dims = plan_dimensions(width, height, Some(max_width), Some(max_height));
        prop_assert!(dims.width == max_width || dims.height == max_height);
    }
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 24,
        .. ProptestConfig::default()
    })]

    #[test]
    fn prop_lower_quality_is_not_larger(
        format in lossy_format(),
        low in prop::sample::select(vec![10u32, 50]),
        step in prop::sample::select(vec![40u32, 80]),
    ) {
        let high = (low + step).min(90);
        prop_assert!(
            encoded_size(format, low) <= encoded_size(format, high),
            "{} at {} vs {}", format, low, high
        );
    }
}
