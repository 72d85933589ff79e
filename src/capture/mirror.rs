//! Horizontal line mirroring, in place.

use crate::capture::frame::PixelFormat;
use crate::error::{Result, SdkError};

/// Longest scanline, in bytes, that can be mirrored. The scratch line lives on
/// the stack so the real-time path never allocates.
pub const MAX_MIRROR_LINE_BYTES: usize = 1920 * 4;

/// Reverses the pixel order of every `line_width`-pixel line in `buffer`.
pub fn mirror_in_place(buffer: &mut [u8], line_width: usize, format: PixelFormat) -> Result<()> {
    let (element, line_bytes) = match format {
        PixelFormat::Gray8 => (1, line_width),
        PixelFormat::Depth1mm | PixelFormat::Shift | PixelFormat::Gray16 => (2, line_width * 2),
        PixelFormat::Rgb888 => (3, line_width * 3),
        PixelFormat::Yuv422 | PixelFormat::Yuyv => {
            if line_width % 2 != 0 {
                return Err(SdkError::InvalidArgument(format!(
                    "{format:?} lines need an even width, got {line_width}"
                )));
            }
            (4, line_width * 2)
        }
    };

    if line_bytes == 0 {
        return Err(SdkError::InvalidArgument("zero line width".into()));
    }
    if line_bytes > MAX_MIRROR_LINE_BYTES {
        return Err(SdkError::BufferTooSmall {
            need: line_bytes,
            have: MAX_MIRROR_LINE_BYTES,
        });
    }
    if buffer.len() % line_bytes != 0 {
        return Err(SdkError::InvalidArgument(format!(
            "buffer of {} bytes is not a whole number of {line_bytes}-byte lines",
            buffer.len()
        )));
    }

    let mut scratch = [0u8; MAX_MIRROR_LINE_BYTES];
    for line in buffer.chunks_exact_mut(line_bytes) {
        let scratch = &mut scratch[..line_bytes];
        scratch.copy_from_slice(line);
        for (dst, src) in line
            .chunks_exact_mut(element)
            .zip(scratch.chunks_exact(element).rev())
        {
            dst.copy_from_slice(src);
        }
        match format {
            // U Y0 V Y1: after reversing macropixels the lumas are still in
            // their old order.
            PixelFormat::Yuv422 => line.chunks_exact_mut(4).for_each(|px| px.swap(1, 3)),
            // Y0 U Y1 V
            PixelFormat::Yuyv => line.chunks_exact_mut(4).for_each(|px| px.swap(0, 2)),
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 + 3) as u8).collect()
    }

    #[test]
    fn gray8_line_is_reversed() {
        let mut buf = vec![1, 2, 3, 4, 5, 6];
        mirror_in_place(&mut buf, 3, PixelFormat::Gray8).unwrap();
        assert_eq!(buf, vec![3, 2, 1, 6, 5, 4]);
    }

    #[test]
    fn depth_keeps_sample_byte_order() {
        let mut buf = vec![0x01, 0x02, 0x03, 0x04];
        mirror_in_place(&mut buf, 2, PixelFormat::Depth1mm).unwrap();
        assert_eq!(buf, vec![0x03, 0x04, 0x01, 0x02]);
    }

    #[test]
    fn rgb_keeps_channel_order() {
        let mut buf = vec![1, 2, 3, 4, 5, 6];
        mirror_in_place(&mut buf, 2, PixelFormat::Rgb888).unwrap();
        assert_eq!(buf, vec![4, 5, 6, 1, 2, 3]);
    }

    #[test]
    fn yuv422_swaps_lumas() {
        // U0 Y0 V0 Y1 | U1 Y2 V1 Y3
        let mut buf = vec![10, 1, 20, 2, 30, 3, 40, 4];
        mirror_in_place(&mut buf, 4, PixelFormat::Yuv422).unwrap();
        // Pixels read right to left: Y3 Y2 Y1 Y0
        assert_eq!(buf, vec![30, 4, 40, 3, 10, 2, 20, 1]);
    }

    #[test]
    fn yuyv_swaps_lumas() {
        // Y0 U0 Y1 V0 | Y2 U1 Y3 V1
        let mut buf = vec![1, 10, 2, 20, 3, 30, 4, 40];
        mirror_in_place(&mut buf, 4, PixelFormat::Yuyv).unwrap();
        assert_eq!(buf, vec![4, 30, 3, 40, 2, 10, 1, 20]);
    }

    #[test]
    fn mirror_twice_is_identity() {
        let formats = [
            PixelFormat::Gray8,
            PixelFormat::Gray16,
            PixelFormat::Depth1mm,
            PixelFormat::Shift,
            PixelFormat::Rgb888,
            PixelFormat::Yuv422,
            PixelFormat::Yuyv,
        ];
        for format in formats {
            let widths = [2usize, 6, 64, 640, MAX_MIRROR_LINE_BYTES / 4];
            for width in widths {
                let line = match format {
                    PixelFormat::Yuv422 | PixelFormat::Yuyv => width * 2,
                    other => width * other.bytes_per_pixel(),
                };
                let original = pattern(line * 3);
                let mut buf = original.clone();
                mirror_in_place(&mut buf, width, format).unwrap();
                mirror_in_place(&mut buf, width, format).unwrap();
                assert_eq!(buf, original, "{format:?} width {width}");
            }
        }
    }

    #[test]
    fn line_ceiling_is_enforced() {
        let width = MAX_MIRROR_LINE_BYTES / 2 + 1;
        let mut buf = vec![0u8; width * 2];
        let err = mirror_in_place(&mut buf, width, PixelFormat::Gray16).unwrap_err();
        assert!(matches!(err, SdkError::BufferTooSmall { .. }));
    }

    #[test]
    fn partial_lines_rejected() {
        let mut buf = vec![0u8; 7];
        assert!(matches!(
            mirror_in_place(&mut buf, 2, PixelFormat::Gray16),
            Err(SdkError::InvalidArgument(_))
        ));
        let mut odd = vec![0u8; 6];
        assert!(mirror_in_place(&mut odd, 3, PixelFormat::Yuyv).is_err());
    }
}
