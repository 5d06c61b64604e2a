//! Thin wrapper over the image codec library.
//!
//! All operations are synchronous and stateless; callers that sit on the
//! async runtime run them through `spawn_blocking`. The adapter owns no
//! caches.

use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::codecs::webp::WebPEncoder;
use image::{DynamicImage, GenericImageView, ImageFormat};
use vitrine_model::EncodeFormat;

use crate::error::{CoreError, Result};

/// Dimensions and format of an undecoded image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeInfo {
    pub width: u32,
    pub height: u32,
    /// Lowercased source format name (`jpeg`, `png`, ...).
    pub format: String,
}

/// How many leading bytes are usually enough for a dimension probe.
pub const PROBE_PREFIX_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, Default)]
pub struct ImageCodec;

impl ImageCodec {
    /// Read dimensions and format from encoded bytes. Header-only probing
    /// runs against a bounded prefix so callers can hand over whatever
    /// they have without the probe walking the whole buffer; a full decode
    /// is the fallback for formats the fast path cannot parse.
    pub fn probe(&self, bytes: &[u8]) -> Result<ProbeInfo> {
        let prefix = &bytes[..bytes.len().min(PROBE_PREFIX_BYTES)];
        let format = image::guess_format(prefix)
            .map(format_name)
            .map_err(|err| CoreError::Codec(format!("probe: {err}")))?;

        if let Ok(size) = imagesize::blob_size(prefix) {
            return Ok(ProbeInfo {
                width: size.width as u32,
                height: size.height as u32,
                format,
            });
        }

        let raster = self.decode(bytes)?;
        let (width, height) = raster.dimensions();
        Ok(ProbeInfo {
            width,
            height,
            format,
        })
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<DynamicImage> {
        image::load_from_memory(bytes)
            .map_err(|err| CoreError::Codec(format!("decode: {err}")))
    }

    /// Fit the raster inside `max_width × max_height`, preserving aspect
    /// ratio and never enlarging. Images already inside the box pass
    /// through untouched.
    pub fn resize(
        &self,
        raster: DynamicImage,
        max_width: u32,
        max_height: u32,
    ) -> DynamicImage {
        let (width, height) = raster.dimensions();
        if width <= max_width && height <= max_height {
            return raster;
        }
        raster.resize(
            max_width,
            max_height,
            image::imageops::FilterType::Lanczos3,
        )
    }

    pub fn encode(
        &self,
        raster: &DynamicImage,
        format: EncodeFormat,
        quality: u8,
    ) -> Result<Vec<u8>> {
        let mut output = Cursor::new(Vec::new());
        match format {
            EncodeFormat::Jpeg => {
                let encoder = JpegEncoder::new_with_quality(
                    &mut output,
                    quality.clamp(1, 100),
                );
                raster
                    .to_rgb8()
                    .write_with_encoder(encoder)
                    .map_err(|err| {
                        CoreError::Codec(format!("jpeg encode: {err}"))
                    })?;
            }
            EncodeFormat::Png => {
                let encoder = PngEncoder::new(&mut output);
                raster.write_with_encoder(encoder).map_err(|err| {
                    CoreError::Codec(format!("png encode: {err}"))
                })?;
            }
            EncodeFormat::Webp => {
                // The pure-Rust webp encoder is lossless; quality applies
                // to jpeg output only.
                let encoder = WebPEncoder::new_lossless(&mut output);
                raster
                    .to_rgba8()
                    .write_with_encoder(encoder)
                    .map_err(|err| {
                        CoreError::Codec(format!("webp encode: {err}"))
                    })?;
            }
        }
        Ok(output.into_inner())
    }

    /// Decode, fit inside the target box, and re-encode in one step.
    pub fn render_variant(
        &self,
        bytes: &[u8],
        max_width: u32,
        max_height: u32,
        quality: u8,
        format: EncodeFormat,
    ) -> Result<Vec<u8>> {
        let raster = self.decode(bytes)?;
        let resized = self.resize(raster, max_width, max_height);
        self.encode(&resized, format, quality)
    }
}

fn format_name(format: ImageFormat) -> String {
    match format {
        ImageFormat::Jpeg => "jpeg".to_string(),
        ImageFormat::Png => "png".to_string(),
        ImageFormat::Gif => "gif".to_string(),
        ImageFormat::Bmp => "bmp".to_string(),
        ImageFormat::WebP => "webp".to_string(),
        ImageFormat::Tiff => "tiff".to_string(),
        other => format!("{other:?}").to_ascii_lowercase(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_png(width: u32, height: u32) -> Vec<u8> {
        let raster = DynamicImage::new_rgb8(width, height);
        let mut out = Cursor::new(Vec::new());
        raster.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    #[test]
    fn probe_reads_dimensions_and_format() {
        let codec = ImageCodec;
        let bytes = sample_png(800, 600);
        let info = codec.probe(&bytes).unwrap();
        assert_eq!(
            info,
            ProbeInfo {
                width: 800,
                height: 600,
                format: "png".to_string()
            }
        );
    }

    #[test]
    fn probe_rejects_non_images() {
        let codec = ImageCodec;
        assert!(matches!(
            codec.probe(b"definitely not an image"),
            Err(CoreError::Codec(_))
        ));
    }

    #[test]
    fn resize_fits_inside_without_enlargement() {
        let codec = ImageCodec;

        let large = DynamicImage::new_rgb8(1024, 768);
        let resized = codec.resize(large, 300, 300);
        let (w, h) = resized.dimensions();
        assert!(w <= 300 && h <= 300);
        // Aspect ratio preserved: 1024x768 fits as 300x225.
        assert_eq!((w, h), (300, 225));

        let small = DynamicImage::new_rgb8(100, 50);
        let untouched = codec.resize(small, 300, 300);
        assert_eq!(untouched.dimensions(), (100, 50));
    }

    #[test]
    fn encode_round_trips_through_decode() {
        let codec = ImageCodec;
        let raster = DynamicImage::new_rgb8(64, 64);
        let jpeg = codec
            .encode(&raster, EncodeFormat::Jpeg, 85)
            .unwrap();
        let decoded = codec.decode(&jpeg).unwrap();
        assert_eq!(decoded.dimensions(), (64, 64));
    }
}
