//! Decode, draw and encode primitives for the transcode worker

use crate::error::ConvertError;
use crate::format::OutputFormat;
use crate::planner::Resampling;
use image::codecs::{avif::AvifEncoder, gif::GifEncoder, jpeg::JpegEncoder, png::PngEncoder};
use image::error::LimitErrorKind;
use image::{
    DynamicImage, ExtendedColorType, GenericImage, GenericImageView, ImageEncoder, ImageError,
    ImageReader, Limits, RgbaImage,
};
use std::io::Cursor;

const BYTES_PER_PIXEL: u64 = 4;

/// Worst-case decoder bytes per pixel (16-bit RGBA)
const MAX_DECODED_BYTES_PER_PIXEL: u64 = 8;

/// Decode arbitrary image bytes into a bitmap
///
/// Images wider or taller than `max_resolution` are rejected before their
/// pixel data is allocated.
pub fn decode(data: &[u8], max_resolution: u32) -> Result<DynamicImage, ConvertError> {
    if data.is_empty() {
        return Err(ConvertError::Decode("input is empty".to_string()));
    }

    let mut reader = ImageReader::new(Cursor::new(data))
        .with_guessed_format()
        .map_err(|e| ConvertError::Decode(e.to_string()))?;

    if reader.format().is_none() {
        return decode_fallback(data, max_resolution);
    }

    reader.limits(decode_limits(max_resolution));

    reader.decode().map_err(|e| match e {
        ImageError::Limits(ref limit) if limit.kind() == LimitErrorKind::DimensionError => {
            ConvertError::Decode(format!(
                "image exceeds maximum resolution {max}x{max}",
                max = max_resolution
            ))
        }
        other => ConvertError::Decode(other.to_string()),
    })
}

/// Decoder limits for a square resolution bound
///
/// The allocation cap follows the resolution so any image inside the bound
/// can be decoded at its widest pixel layout.
fn decode_limits(max_resolution: u32) -> Limits {
    let side = u64::from(max_resolution);
    let mut limits = Limits::default();
    limits.max_image_width = Some(max_resolution);
    limits.max_image_height = Some(max_resolution);
    limits.max_alloc = Some(
        side.saturating_mul(side)
            .saturating_mul(MAX_DECODED_BYTES_PER_PIXEL),
    );
    limits
}

/// Size in bytes of a bitmap as held in memory
pub fn bitmap_len(bitmap: &DynamicImage) -> u64 {
    bitmap.as_bytes().len() as u64
}

#[cfg(feature = "heic")]
fn decode_fallback(data: &[u8], max_resolution: u32) -> Result<DynamicImage, ConvertError> {
    if is_heif(data) {
        decode_heic(data, max_resolution)
    } else {
        Err(ConvertError::Decode("unrecognized image format".to_string()))
    }
}

#[cfg(not(feature = "heic"))]
fn decode_fallback(_data: &[u8], _max_resolution: u32) -> Result<DynamicImage, ConvertError> {
    Err(ConvertError::Decode("unrecognized image format".to_string()))
}

#[cfg(feature = "heic")]
fn is_heif(data: &[u8]) -> bool {
    const BRANDS: [&[u8]; 6] = [b"heic", b"heix", b"hevc", b"heim", b"mif1", b"msf1"];
    data.len() >= 12 && &data[4..8] == b"ftyp" && BRANDS.contains(&&data[8..12])
}

/// Decode HEIC bytes to an RGBA bitmap
#[cfg(feature = "heic")]
fn decode_heic(data: &[u8], max_resolution: u32) -> Result<DynamicImage, ConvertError> {
    use libheif_rs::{ColorSpace, HeifContext, LibHeif, RgbChroma};

    let lib_heif = LibHeif::new();

    let ctx = HeifContext::read_from_bytes(data)
        .map_err(|e| ConvertError::Decode(e.to_string()))?;

    let handle = ctx
        .primary_image_handle()
        .map_err(|e| ConvertError::Decode(e.to_string()))?;

    let width = handle.width();
    let height = handle.height();

    if width > max_resolution || height > max_resolution {
        return Err(ConvertError::Decode(format!(
            "image exceeds maximum resolution {max}x{max}",
            max = max_resolution
        )));
    }

    let image = lib_heif
        .decode(&handle, ColorSpace::Rgb(RgbChroma::Rgba), None)
        .map_err(|e| ConvertError::Decode(e.to_string()))?;

    let planes = image.planes();
    let interleaved = planes
        .interleaved
        .ok_or_else(|| ConvertError::Decode("Failed to get interleaved RGBA data".to_string()))?;

    // Rows may be padded past width * 4
    let stride = interleaved.stride;
    let row_len = width as usize * BYTES_PER_PIXEL as usize;
    let mut rgba = Vec::with_capacity(row_len * height as usize);
    for y in 0..height as usize {
        let row_start = y * stride;
        rgba.extend_from_slice(&interleaved.data[row_start..row_start + row_len]);
    }

    RgbaImage::from_raw(width, height, rgba)
        .map(DynamicImage::ImageRgba8)
        .ok_or_else(|| ConvertError::Decode("HEIC plane size mismatch".to_string()))
}

/// Off-screen RGBA drawing surface at the planned output size
pub struct Surface {
    pixels: RgbaImage,
}

impl Surface {
    pub fn create(width: u32, height: u32, max_pixels: u64) -> Result<Self, ConvertError> {
        let area = u64::from(width) * u64::from(height);
        if area == 0 {
            return Err(ConvertError::Surface(format!(
                "invalid surface size {}x{}",
                width, height
            )));
        }
        if area > max_pixels {
            return Err(ConvertError::Surface(format!(
                "surface {}x{} exceeds {} pixels",
                width, height, max_pixels
            )));
        }

        let len = usize::try_from(area * BYTES_PER_PIXEL)
            .map_err(|_| ConvertError::Surface("surface too large for address space".to_string()))?;

        let mut buffer = Vec::new();
        buffer
            .try_reserve_exact(len)
            .map_err(|e| ConvertError::Surface(e.to_string()))?;
        buffer.resize(len, 0);

        let pixels = RgbaImage::from_raw(width, height, buffer)
            .ok_or_else(|| ConvertError::Surface("surface buffer size mismatch".to_string()))?;

        Ok(Self { pixels })
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn byte_len(&self) -> u64 {
        self.pixels.as_raw().len() as u64
    }

    pub fn pixels(&self) -> &RgbaImage {
        &self.pixels
    }

    /// Draw `bitmap` scaled to fill the whole surface
    pub fn draw(&mut self, bitmap: &DynamicImage, resampling: Resampling) -> Result<(), ConvertError> {
        let (width, height) = self.pixels.dimensions();

        let copied = if bitmap.dimensions() == (width, height) {
            match bitmap.as_rgba8() {
                Some(rgba) => self.pixels.copy_from(rgba, 0, 0),
                None => self.pixels.copy_from(&bitmap.to_rgba8(), 0, 0),
            }
        } else {
            let filter = resampling
                .filter()
                .unwrap_or(image::imageops::FilterType::Triangle);
            let scaled = bitmap.resize_exact(width, height, filter).into_rgba8();
            self.pixels.copy_from(&scaled, 0, 0)
        };

        copied.map_err(|e| ConvertError::Draw(e.to_string()))
    }

    /// Encode the surface
    ///
    /// `quality` is a 0.0-1.0 fraction and is only consulted by lossy
    /// encoders; lossless encoders never see it.
    pub fn encode(
        &self,
        format: OutputFormat,
        quality: Option<f32>,
        avif_speed: u8,
    ) -> Result<Vec<u8>, ConvertError> {
        let (width, height) = self.pixels.dimensions();
        let percent = quality.map(|q| (q * 100.0).round().clamp(1.0, 100.0) as u8);
        let encode_failed = |message: String| ConvertError::Encode { format, message };

        let mut out = Vec::new();
        match format {
            OutputFormat::Jpeg => {
                // JPEG has no alpha channel
                let rgb: Vec<u8> = self
                    .pixels
                    .as_raw()
                    .chunks_exact(BYTES_PER_PIXEL as usize)
                    .flat_map(|px| [px[0], px[1], px[2]])
                    .collect();
                JpegEncoder::new_with_quality(&mut out, percent.unwrap_or(92))
                    .write_image(&rgb, width, height, ExtendedColorType::Rgb8)
                    .map_err(|e| encode_failed(e.to_string()))?;
            }
            OutputFormat::Png => {
                PngEncoder::new(&mut out)
                    .write_image(self.pixels.as_raw(), width, height, ExtendedColorType::Rgba8)
                    .map_err(|e| encode_failed(e.to_string()))?;
            }
            OutputFormat::Gif => {
                let mut encoder = GifEncoder::new(&mut out);
                encoder
                    .encode(self.pixels.as_raw(), width, height, ExtendedColorType::Rgba8)
                    .map_err(|e| encode_failed(e.to_string()))?;
            }
            OutputFormat::Webp => {
                let encoder = webp::Encoder::from_rgba(self.pixels.as_raw(), width, height);
                let memory = match percent {
                    Some(q) => encoder.encode_simple(false, f32::from(q)),
                    None => encoder.encode_simple(true, 100.0),
                }
                .map_err(|e| encode_failed(format!("WebP encode failed: {e:?}")))?;
                out.extend_from_slice(&memory);
            }
            OutputFormat::Avif => {
                AvifEncoder::new_with_speed_quality(&mut out, avif_speed, percent.unwrap_or(100))
                    .write_image(self.pixels.as_raw(), width, height, ExtendedColorType::Rgba8)
                    .map_err(|e| encode_failed(e.to_string()))?;
            }
        }

        if out.is_empty() {
            return Err(encode_failed("encoder produced no data".to_string()));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgba};

    fn sample(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgba8(RgbaImage::from_fn(width, height, |x, y| {
            Rgba([(x % 256) as u8, (y % 256) as u8, 128, 255])
        }))
    }

    fn png_bytes(image: &DynamicImage) -> Vec<u8> {
        let mut out = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
            .unwrap();
        out
    }

    #[test]
    fn test_decode_empty_input() {
        let err = decode(&[], 1000).unwrap_err();
        assert!(matches!(err, ConvertError::Decode(_)));
    }

    #[test]
    fn test_decode_garbage() {
        let err = decode(b"definitely not an image", 1000).unwrap_err();
        assert!(matches!(err, ConvertError::Decode(_)));
    }

    #[test]
    fn test_decode_truncated_png() {
        let bytes = png_bytes(&sample(32, 32));
        let err = decode(&bytes[..bytes.len() / 2], 1000).unwrap_err();
        assert!(matches!(err, ConvertError::Decode(_)));
    }

    #[test]
    fn test_decode_resolution_limit() {
        let bytes = png_bytes(&sample(64, 8));
        let err = decode(&bytes, 32).unwrap_err();
        assert!(err.to_string().contains("maximum resolution"));
        assert!(decode(&bytes, 64).is_ok());
    }

    #[test]
    fn test_alloc_limit_covers_full_resolution() {
        let limits = decode_limits(16384);
        assert_eq!(limits.max_image_width, Some(16384));
        // A 16384x16384 RGBA16 bitmap must fit, well past the 512 MiB default
        assert_eq!(limits.max_alloc, Some(16384 * 16384 * 8));
        assert!(limits.max_alloc > Limits::default().max_alloc);
    }

    #[test]
    #[ignore = "allocates over 1 GiB"]
    fn test_decode_past_default_alloc_budget() {
        // 14000x13000 RGB decodes to ~546 MB, above the decoder's 512 MiB default
        let bytes = png_bytes(&DynamicImage::ImageRgb8(image::RgbImage::new(14000, 13000)));
        let decoded = decode(&bytes, 16384).unwrap();
        assert_eq!(decoded.dimensions(), (14000, 13000));
    }

    #[test]
    fn test_surface_rejects_oversized_area() {
        assert!(matches!(
            Surface::create(1000, 1000, 999_999),
            Err(ConvertError::Surface(_))
        ));
        assert!(Surface::create(1000, 1000, 1_000_000).is_ok());
    }

    #[test]
    fn test_draw_same_size_copies_pixels() {
        let bitmap = sample(8, 4);
        let mut surface = Surface::create(8, 4, u64::MAX).unwrap();
        surface.draw(&bitmap, Resampling::None).unwrap();
        assert_eq!(surface.pixels().as_raw(), bitmap.as_bytes());
    }

    #[test]
    fn test_draw_scales_to_surface() {
        let bitmap = sample(64, 32);
        let mut surface = Surface::create(16, 8, u64::MAX).unwrap();
        surface.draw(&bitmap, Resampling::High).unwrap();
        assert_eq!((surface.width(), surface.height()), (16, 8));
        assert_eq!(surface.byte_len(), 16 * 8 * 4);
    }

    #[test]
    fn test_every_format_produces_decodable_output() {
        let mut surface = Surface::create(24, 16, u64::MAX).unwrap();
        surface.draw(&sample(24, 16), Resampling::None).unwrap();

        for format in OutputFormat::ALL {
            let quality = format.supports_quality().then_some(0.8);
            let encoded = surface.encode(format, quality, 10).unwrap();
            let guessed = image::guess_format(&encoded).unwrap();
            let expected = match format {
                OutputFormat::Webp => ImageFormat::WebP,
                OutputFormat::Avif => ImageFormat::Avif,
                OutputFormat::Png => ImageFormat::Png,
                OutputFormat::Jpeg => ImageFormat::Jpeg,
                OutputFormat::Gif => ImageFormat::Gif,
            };
            assert_eq!(guessed, expected, "format {}", format);
        }
    }

    #[test]
    fn test_lossless_formats_ignore_quality() {
        let mut surface = Surface::create(16, 16, u64::MAX).unwrap();
        surface.draw(&sample(16, 16), Resampling::None).unwrap();

        let with_hint = surface.encode(OutputFormat::Png, Some(0.1), 8).unwrap();
        let without = surface.encode(OutputFormat::Png, None, 8).unwrap();
        assert_eq!(with_hint, without);
    }
}
