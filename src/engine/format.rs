//! Save formats and suffix parsing.
//!
//! ## Crate mapping
//!
//! | Suffix | Encoder |
//! |---|---|
//! | `.png` | `image::codecs::png::PngEncoder` |
//! | `.jpg` / `.jpeg` (`[Q=n]`, default 75) | `image::codecs::jpeg::JpegEncoder` |
//! | `.tif` / `.tiff` | `image::codecs::tiff::TiffEncoder` (needs a seekable target) |
//! | `.webp` | `image::codecs::webp::WebPEncoder` (lossless) |
//!
//! Decoding goes through `image::ImageReader` with the format guessed from
//! the leading bytes, so any of the four formats loads from any source.

use super::EngineError;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::codecs::tiff::TiffEncoder;
use image::codecs::webp::WebPEncoder;
use image::{DynamicImage, ImageError, ImageFormat};
use std::io::{Seek, Write};
use std::path::Path;

const DEFAULT_JPEG_QUALITY: u8 = 75;

/// Formats with compiled-in decoders.
pub const LOAD_FORMATS: &[&str] = &["png", "jpeg", "tiff", "webp"];

/// Formats the engine can write.
pub const SAVE_FORMATS: &[&str] = &["png", "jpeg", "tiff", "webp"];

/// Short lowercase name used in operation names (`load_png`, `save_jpeg`).
pub fn format_name(format: ImageFormat) -> &'static str {
    match format {
        ImageFormat::Png => "png",
        ImageFormat::Jpeg => "jpeg",
        ImageFormat::Tiff => "tiff",
        ImageFormat::WebP => "webp",
        _ => "unknown",
    }
}

/// An output format with its options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveFormat {
    Png,
    Jpeg { quality: u8 },
    Tiff,
    WebP,
}

impl SaveFormat {
    /// Parse a suffix such as `.png` or `.jpg[Q=90]`.
    pub fn from_suffix(suffix: &str) -> Result<Self, EngineError> {
        let unsupported = || EngineError::UnsupportedSuffix(suffix.to_string());
        let trimmed = suffix.trim();
        let (ext, options) = match trimmed.find('[') {
            Some(open) => {
                let rest = trimmed[open + 1..].strip_suffix(']').ok_or_else(unsupported)?;
                (&trimmed[..open], Some(rest))
            }
            None => (trimmed, None),
        };
        let ext = ext.rsplit('.').next().unwrap_or(ext).to_lowercase();

        let mut format = match ext.as_str() {
            "png" => SaveFormat::Png,
            "jpg" | "jpeg" => SaveFormat::Jpeg {
                quality: DEFAULT_JPEG_QUALITY,
            },
            "tif" | "tiff" => SaveFormat::Tiff,
            "webp" => SaveFormat::WebP,
            _ => return Err(unsupported()),
        };

        for option in options.into_iter().flat_map(|o| o.split(',')) {
            let option = option.trim();
            if option.is_empty() {
                continue;
            }
            let (key, value) = option.split_once('=').ok_or_else(|| {
                EngineError::InvalidArgument(format!("malformed save option {option:?}"))
            })?;
            match (&mut format, key.trim()) {
                (SaveFormat::Jpeg { quality }, "Q" | "q") => {
                    *quality = value
                        .trim()
                        .parse::<u8>()
                        .ok()
                        .filter(|q| (1..=100).contains(q))
                        .ok_or_else(|| {
                            EngineError::InvalidArgument(format!(
                                "JPEG quality must be 1-100, got {value:?}"
                            ))
                        })?;
                }
                (_, key) => {
                    return Err(EngineError::InvalidArgument(format!(
                        "unknown save option {key:?} for {}",
                        format.name()
                    )));
                }
            }
        }
        Ok(format)
    }

    /// Split a path such as `out.jpg[Q=90]` into the file path and its suffix.
    pub fn split_path(path: &Path) -> Result<(std::path::PathBuf, Self), EngineError> {
        let text = path.to_string_lossy();
        let (file, options) = match text.rfind('[') {
            Some(open) if text.ends_with(']') => (&text[..open], &text[open..]),
            _ => (&text[..], ""),
        };
        let file = std::path::PathBuf::from(file);
        let ext = file
            .extension()
            .and_then(|e| e.to_str())
            .ok_or_else(|| EngineError::UnsupportedSuffix(text.to_string()))?;
        let format = Self::from_suffix(&format!(".{ext}{options}"))?;
        Ok((file, format))
    }

    pub fn name(&self) -> &'static str {
        match self {
            SaveFormat::Png => "png",
            SaveFormat::Jpeg { .. } => "jpeg",
            SaveFormat::Tiff => "tiff",
            SaveFormat::WebP => "webp",
        }
    }

    /// Whether the encoder seeks back to patch its output.
    pub fn needs_seek(&self) -> bool {
        matches!(self, SaveFormat::Tiff)
    }

    /// Encode `img` into `writer`.
    pub fn encode<W: Write + Seek>(&self, img: &DynamicImage, writer: W) -> Result<(), ImageError> {
        match *self {
            SaveFormat::Png => img.write_with_encoder(PngEncoder::new(writer)),
            SaveFormat::Jpeg { quality } => {
                // JPEG has no alpha and no 16-bit samples
                let encoder = JpegEncoder::new_with_quality(writer, quality);
                match img {
                    DynamicImage::ImageLuma8(_) | DynamicImage::ImageRgb8(_) => {
                        img.write_with_encoder(encoder)
                    }
                    _ if img.color().has_color() => {
                        DynamicImage::ImageRgb8(img.to_rgb8()).write_with_encoder(encoder)
                    }
                    _ => DynamicImage::ImageLuma8(img.to_luma8()).write_with_encoder(encoder),
                }
            }
            SaveFormat::Tiff => img.write_with_encoder(TiffEncoder::new(writer)),
            SaveFormat::WebP => {
                let encoder = WebPEncoder::new_lossless(writer);
                match img {
                    DynamicImage::ImageLuma8(_)
                    | DynamicImage::ImageLumaA8(_)
                    | DynamicImage::ImageRgb8(_)
                    | DynamicImage::ImageRgba8(_) => img.write_with_encoder(encoder),
                    _ if img.color().has_alpha() => {
                        DynamicImage::ImageRgba8(img.to_rgba8()).write_with_encoder(encoder)
                    }
                    _ => DynamicImage::ImageRgb8(img.to_rgb8()).write_with_encoder(encoder),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_plain_suffixes() {
        assert_eq!(SaveFormat::from_suffix(".png").unwrap(), SaveFormat::Png);
        assert_eq!(SaveFormat::from_suffix(".TIF").unwrap(), SaveFormat::Tiff);
        assert_eq!(SaveFormat::from_suffix("webp").unwrap(), SaveFormat::WebP);
        assert_eq!(
            SaveFormat::from_suffix(".jpeg").unwrap(),
            SaveFormat::Jpeg { quality: 75 }
        );
    }

    #[test]
    fn parse_jpeg_quality() {
        assert_eq!(
            SaveFormat::from_suffix(".jpg[Q=90]").unwrap(),
            SaveFormat::Jpeg { quality: 90 }
        );
    }

    #[test]
    fn reject_bad_quality() {
        assert!(matches!(
            SaveFormat::from_suffix(".jpg[Q=0]"),
            Err(EngineError::InvalidArgument(_))
        ));
        assert!(matches!(
            SaveFormat::from_suffix(".jpg[Q=high]"),
            Err(EngineError::InvalidArgument(_))
        ));
    }

    #[test]
    fn reject_unknown_option() {
        assert!(matches!(
            SaveFormat::from_suffix(".png[compression=9]"),
            Err(EngineError::InvalidArgument(_))
        ));
    }

    #[test]
    fn reject_unknown_suffix() {
        assert!(matches!(
            SaveFormat::from_suffix(".bmp"),
            Err(EngineError::UnsupportedSuffix(_))
        ));
        assert!(matches!(
            SaveFormat::from_suffix(".jpg[Q=90"),
            Err(EngineError::UnsupportedSuffix(_))
        ));
    }

    #[test]
    fn split_path_with_options() {
        let (file, format) = SaveFormat::split_path(Path::new("/tmp/out.jpg[Q=50]")).unwrap();
        assert_eq!(file, Path::new("/tmp/out.jpg"));
        assert_eq!(format, SaveFormat::Jpeg { quality: 50 });
    }

    #[test]
    fn split_path_without_extension() {
        assert!(SaveFormat::split_path(Path::new("/tmp/out")).is_err());
    }

    #[test]
    fn only_tiff_needs_seek() {
        assert!(SaveFormat::Tiff.needs_seek());
        assert!(!SaveFormat::Png.needs_seek());
        assert!(!SaveFormat::Jpeg { quality: 75 }.needs_seek());
        assert!(!SaveFormat::WebP.needs_seek());
    }

    #[test]
    fn format_names() {
        assert_eq!(format_name(ImageFormat::Jpeg), "jpeg");
        assert_eq!(format_name(ImageFormat::Png), "png");
        assert_eq!(format_name(ImageFormat::Gif), "unknown");
    }
}
