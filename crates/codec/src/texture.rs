//! Raster textures through the `image` crate.

use crate::Decoded;
use crate::error::{ErrorKind, Result};
use exn::{OptionExt, ResultExt};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{ColorType, DynamicImage, ImageFormat, Rgb, RgbImage};
use std::io::Cursor;
use wold_metadata::models::TextureAttributes;

pub const FORMATS: &[&str] = &["png", "jpg", "jpeg", "bmp", "tga", "tif", "tiff"];

pub const DEFAULT_JPEG_QUALITY: u8 = 85;

pub fn read(bytes: &[u8]) -> Result<DynamicImage> {
    image::load_from_memory(bytes).or_raise(|| ErrorKind::malformed("image"))
}

pub fn decode(bytes: &[u8], format: &str) -> Result<Decoded<TextureAttributes>> {
    if !FORMATS.contains(&format) {
        exn::bail!(ErrorKind::Unsupported(format!("texture format `{format}`")));
    }
    Ok(Decoded::new(attributes(&read(bytes)?)))
}

pub fn attributes(image: &DynamicImage) -> TextureAttributes {
    let color = image.color();
    TextureAttributes {
        width: image.width(),
        height: image.height(),
        channels: color.channel_count(),
        has_alpha: color.has_alpha(),
        color_space: color_space(color).to_string(),
        has_mipmaps: false,
        compression: None,
    }
}

fn color_space(color: ColorType) -> &'static str {
    match color {
        ColorType::L8 | ColorType::La8 | ColorType::L16 | ColorType::La16 => "grayscale",
        ColorType::Rgb32F | ColorType::Rgba32F => "linear",
        _ => "sRGB",
    }
}

fn image_format(format: &str) -> Result<ImageFormat> {
    match FORMATS.contains(&format) {
        true => ImageFormat::from_extension(format).ok_or_raise(|| ErrorKind::Unsupported(format!("texture format `{format}`"))),
        false => exn::bail!(ErrorKind::Unsupported(format!("texture format `{format}`"))),
    }
}

/// Encode in `format`. JPEG output is written at the default quality with
/// any alpha flattened onto white.
pub fn encode(image: &DynamicImage, format: &str) -> Result<Vec<u8>> {
    compress(image, format, DEFAULT_JPEG_QUALITY)
}

/// Encode in `format`, using `quality` (1-100) where the format has one.
pub fn compress(image: &DynamicImage, format: &str, quality: u8) -> Result<Vec<u8>> {
    let target = image_format(format)?;
    let mut out = Cursor::new(Vec::new());
    match target {
        ImageFormat::Jpeg => {
            let flat = flatten_alpha(image);
            let encoder = JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100));
            flat.write_with_encoder(encoder).or_raise(|| ErrorKind::Encode("JPEG"))?;
        },
        other => image.write_to(&mut out, other).or_raise(|| ErrorKind::Encode("image"))?,
    }
    Ok(out.into_inner())
}

/// Composite onto an opaque white background. Images without alpha are
/// only converted to RGB.
pub fn flatten_alpha(image: &DynamicImage) -> DynamicImage {
    if !image.color().has_alpha() {
        return DynamicImage::ImageRgb8(image.to_rgb8());
    }
    let rgba = image.to_rgba8();
    let flat = RgbImage::from_fn(rgba.width(), rgba.height(), |x, y| {
        let [r, g, b, a] = rgba.get_pixel(x, y).0;
        let over = |c: u8| ((u16::from(c) * u16::from(a) + 255 * (255 - u16::from(a))) / 255) as u8;
        Rgb([over(r), over(g), over(b)])
    });
    DynamicImage::ImageRgb8(flat)
}

/// Successive halvings of `image`, largest first. Stops after `levels`
/// images or as soon as a side would drop below one pixel.
pub fn mipmaps(image: &DynamicImage, levels: usize) -> Vec<DynamicImage> {
    let mut out: Vec<DynamicImage> = Vec::with_capacity(levels);
    for _ in 0..levels {
        let current = out.last().unwrap_or(image);
        let (width, height) = (current.width() / 2, current.height() / 2);
        if width < 1 || height < 1 {
            break;
        }
        let next = current.resize_exact(width, height, FilterType::Lanczos3);
        out.push(next);
    }
    out
}

/// Scale so the longest side is `max_side`. Without `maintain_aspect` the
/// result is a `max_side` square.
pub fn resize(image: &DynamicImage, max_side: u32, maintain_aspect: bool) -> Result<DynamicImage> {
    if max_side == 0 {
        exn::bail!(ErrorKind::InvalidArgument("max_side must be at least 1".into()));
    }
    if !maintain_aspect {
        return Ok(image.resize_exact(max_side, max_side, FilterType::Lanczos3));
    }
    let ratio = f64::from(max_side) / f64::from(image.width().max(image.height()).max(1));
    let width = ((f64::from(image.width()) * ratio) as u32).max(1);
    let height = ((f64::from(image.height()) * ratio) as u32).max(1);
    Ok(image.resize_exact(width, height, FilterType::Lanczos3))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};
    use rstest::rstest;

    fn rgba(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgba8(RgbaImage::from_pixel(width, height, Rgba([10, 20, 30, 128])))
    }

    #[test]
    fn test_png_attributes() {
        let png = encode(&rgba(1024, 512), "png").unwrap();
        let decoded = decode(&png, "png").unwrap();
        assert_eq!(decoded.attributes.width, 1024);
        assert_eq!(decoded.attributes.height, 512);
        assert_eq!(decoded.attributes.channels, 4);
        assert!(decoded.attributes.has_alpha);
        assert_eq!(decoded.attributes.color_space, "sRGB");
        assert!(decoded.attributes.is_power_of_two());
    }

    #[test]
    fn test_mipmap_chain() {
        let sizes: Vec<(u32, u32)> = mipmaps(&rgba(1024, 512), 4).iter().map(|m| (m.width(), m.height())).collect();
        assert_eq!(sizes, [(512, 256), (256, 128), (128, 64), (64, 32)]);
    }

    #[rstest]
    #[case(1, 1, 4, 0)]
    #[case(4, 1, 4, 0)]
    #[case(4, 2, 4, 1)]
    #[case(8, 8, 2, 2)]
    fn test_mipmaps_stop_early(#[case] width: u32, #[case] height: u32, #[case] levels: usize, #[case] expected: usize) {
        assert_eq!(mipmaps(&rgba(width, height), levels).len(), expected);
    }

    #[test]
    fn test_jpeg_flattens_alpha_onto_white() {
        let jpeg = compress(&rgba(8, 8), "jpg", 90).unwrap();
        let decoded = read(&jpeg).unwrap();
        assert!(!decoded.color().has_alpha());
        let pixel = decoded.to_rgb8().get_pixel(4, 4).0;
        // Half-transparent dark blue over white lands around the midpoint.
        assert!(pixel.iter().all(|c| (120..=150).contains(c)), "{pixel:?}");
    }

    #[rstest]
    #[case(1024, 512, 256, true, (256, 128))]
    #[case(300, 600, 100, true, (50, 100))]
    #[case(300, 600, 64, false, (64, 64))]
    fn test_resize(#[case] w: u32, #[case] h: u32, #[case] max: u32, #[case] keep: bool, #[case] expected: (u32, u32)) {
        let out = resize(&rgba(w, h), max, keep).unwrap();
        assert_eq!((out.width(), out.height()), expected);
    }

    #[test]
    fn test_unsupported_target() {
        let err = encode(&rgba(2, 2), "psd").unwrap_err();
        assert!(matches!(&*err, ErrorKind::Unsupported(_)));
    }
}
