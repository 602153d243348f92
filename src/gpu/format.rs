//! Backend-independent pixel format properties and the compressed-format
//! fallback policy.

use super::structs::{FeatureType, PixelFormat};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatInfo {
    /// Bits per pixel for uncompressed formats, average bits (rounded down)
    /// for block formats.
    pub bpp: u32,
    /// Block width and height in texels, `(1, 1)` when uncompressed.
    pub block: (u32, u32),
    /// Bytes per block for compressed formats.
    pub block_bytes: u32,
    pub compressed: bool,
    pub alpha: bool,
    pub depth: bool,
    /// Feature the device must report for the format to be used natively.
    pub feature: Option<FeatureType>,
    /// Substitute used when the feature is missing.
    pub fallback: PixelFormat,
}

const fn plain(bpp: u32, alpha: bool, feature: Option<FeatureType>) -> FormatInfo {
    FormatInfo {
        bpp,
        block: (1, 1),
        block_bytes: 0,
        compressed: false,
        alpha,
        depth: false,
        feature,
        fallback: PixelFormat::RGBA8,
    }
}

const fn block(
    block: (u32, u32),
    block_bytes: u32,
    alpha: bool,
    feature: FeatureType,
) -> FormatInfo {
    FormatInfo {
        bpp: block_bytes * 8 / (block.0 * block.1),
        block,
        block_bytes,
        compressed: true,
        alpha,
        depth: false,
        feature: Some(feature),
        fallback: if alpha {
            PixelFormat::RGBA8
        } else {
            PixelFormat::RGB8
        },
    }
}

pub fn format_info(format: PixelFormat) -> FormatInfo {
    use FeatureType as F;
    match format {
        PixelFormat::Pvrtc4 => block((4, 4), 8, false, F::Pvrtc),
        PixelFormat::Pvrtc4A => block((4, 4), 8, true, F::Pvrtc),
        PixelFormat::Pvrtc2 => block((8, 4), 8, false, F::Pvrtc),
        PixelFormat::Pvrtc2A => block((8, 4), 8, true, F::Pvrtc),
        PixelFormat::Etc1 => block((4, 4), 8, false, F::Etc1),
        PixelFormat::Etc2Rgb => block((4, 4), 8, false, F::Etc2),
        PixelFormat::Etc2Rgba => block((4, 4), 16, true, F::Etc2),
        // DXT1 is uploaded through the RGBA variant.
        PixelFormat::S3tcDxt1 => block((4, 4), 8, true, F::S3tc),
        PixelFormat::S3tcDxt3 => block((4, 4), 16, true, F::S3tc),
        PixelFormat::S3tcDxt5 => block((4, 4), 16, true, F::S3tc),
        PixelFormat::AtcRgb => block((4, 4), 8, false, F::AmdCompressedAtc),
        PixelFormat::AtcExplicitAlpha => block((4, 4), 16, true, F::AmdCompressedAtc),
        PixelFormat::AtcInterpolatedAlpha => block((4, 4), 16, true, F::AmdCompressedAtc),
        PixelFormat::Astc4x4 => block((4, 4), 16, true, F::Astc),
        PixelFormat::Astc5x4 => block((5, 4), 16, true, F::Astc),
        PixelFormat::Astc5x5 => block((5, 5), 16, true, F::Astc),
        PixelFormat::Astc6x5 => block((6, 5), 16, true, F::Astc),
        PixelFormat::Astc6x6 => block((6, 6), 16, true, F::Astc),
        PixelFormat::Astc8x5 => block((8, 5), 16, true, F::Astc),
        PixelFormat::Astc8x6 => block((8, 6), 16, true, F::Astc),
        PixelFormat::Astc8x8 => block((8, 8), 16, true, F::Astc),
        PixelFormat::Astc10x5 => block((10, 5), 16, true, F::Astc),
        PixelFormat::Astc10x6 => block((10, 6), 16, true, F::Astc),
        PixelFormat::Astc10x8 => block((10, 8), 16, true, F::Astc),
        PixelFormat::Astc10x10 => block((10, 10), 16, true, F::Astc),
        PixelFormat::Astc12x10 => block((12, 10), 16, true, F::Astc),
        PixelFormat::Astc12x12 => block((12, 12), 16, true, F::Astc),
        PixelFormat::RGBA8 => plain(32, true, None),
        PixelFormat::BGRA8 => plain(32, true, Some(F::ImgFormatBgra8888)),
        PixelFormat::RGB8 => plain(24, false, None),
        PixelFormat::RGB565 => plain(16, false, None),
        PixelFormat::RGBA4 => plain(16, true, None),
        PixelFormat::RGB5A1 => plain(16, true, None),
        PixelFormat::R8 => plain(8, false, None),
        PixelFormat::RG8 => plain(16, false, None),
        PixelFormat::RGBA32F => plain(128, true, None),
        PixelFormat::D24S8 => FormatInfo {
            depth: true,
            ..plain(32, false, None)
        },
        PixelFormat::None => plain(0, false, None),
    }
}

impl PixelFormat {
    pub fn is_compressed(self) -> bool {
        format_info(self).compressed
    }

    pub fn is_depth(self) -> bool {
        format_info(self).depth
    }

    pub fn has_alpha(self) -> bool {
        format_info(self).alpha
    }

    /// Bytes needed for one `width` x `height` image of this format.
    pub fn data_size(self, width: u32, height: u32) -> usize {
        let info = format_info(self);
        if info.compressed {
            let bw = (width + info.block.0 - 1) / info.block.0;
            let bh = (height + info.block.1 - 1) / info.block.1;
            return (bw.max(1) * bh.max(1) * info.block_bytes) as usize;
        }
        width as usize * height as usize * info.bpp as usize / 8
    }
}

/// Pick the format a texture will actually be created with, given a
/// predicate over the device's cached feature set.
pub fn resolve_format(format: PixelFormat, supported: impl Fn(FeatureType) -> bool) -> PixelFormat {
    let info = format_info(format);
    match info.feature {
        Some(feature) if !supported(feature) => {
            log::warn!(
                "pixel format {:?} needs {:?}, substituting {:?}",
                format,
                feature,
                info.fallback
            );
            info.fallback
        }
        _ => format,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compressed_formats_fall_back_by_alpha() {
        let none = |_| false;
        assert_eq!(resolve_format(PixelFormat::Etc1, none), PixelFormat::RGB8);
        assert_eq!(resolve_format(PixelFormat::Etc2Rgba, none), PixelFormat::RGBA8);
        assert_eq!(resolve_format(PixelFormat::Astc8x8, none), PixelFormat::RGBA8);
        assert_eq!(resolve_format(PixelFormat::Pvrtc2, none), PixelFormat::RGB8);
        assert_eq!(resolve_format(PixelFormat::BGRA8, none), PixelFormat::RGBA8);
        assert_eq!(resolve_format(PixelFormat::RGB565, none), PixelFormat::RGB565);
    }

    #[test]
    fn supported_formats_are_kept() {
        let s3tc = |f| f == FeatureType::S3tc;
        assert_eq!(resolve_format(PixelFormat::S3tcDxt5, s3tc), PixelFormat::S3tcDxt5);
        assert_eq!(resolve_format(PixelFormat::AtcRgb, s3tc), PixelFormat::RGB8);
    }

    #[test]
    fn block_sizes_round_up() {
        assert_eq!(PixelFormat::S3tcDxt1.data_size(4, 4), 8);
        assert_eq!(PixelFormat::S3tcDxt5.data_size(5, 5), 64);
        assert_eq!(PixelFormat::Astc10x5.data_size(10, 10), 32);
        assert_eq!(PixelFormat::RGB8.data_size(3, 2), 18);
    }

    #[test]
    fn every_astc_block_is_sixteen_bytes() {
        assert_eq!(format_info(PixelFormat::Astc5x4).block, (5, 4));
        assert_eq!(format_info(PixelFormat::Astc12x12).block, (12, 12));
        assert_eq!(PixelFormat::Astc6x5.data_size(12, 10), 4 * 16);
        assert_eq!(PixelFormat::Astc10x8.data_size(20, 9), 4 * 16);
        assert_eq!(PixelFormat::Astc12x10.data_size(13, 10), 2 * 16);
        assert_eq!(PixelFormat::Astc10x10.data_size(1, 1), 16);

        let astc: Vec<_> = PixelFormat::ALL
            .into_iter()
            .filter(|f| format_info(*f).feature == Some(FeatureType::Astc))
            .collect();
        assert_eq!(astc.len(), 14);
        for format in astc {
            assert_eq!(resolve_format(format, |_| false), PixelFormat::RGBA8);
            assert_eq!(resolve_format(format, |f| f == FeatureType::Astc), format);
        }
    }
}
