//! Colour conversion to RGB888.

use super::Progress;
use crate::capture::frame::PixelFormat;
use crate::error::{Result, SdkError};

#[inline]
fn clamp_u8(value: i32) -> u8 {
    value.clamp(0, 255) as u8
}

/// BT.601 studio range.
#[inline]
fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = 298 * (y as i32 - 16);
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    [
        clamp_u8((c + 409 * e + 128) >> 8),
        clamp_u8((c - 100 * d - 208 * e + 128) >> 8),
        clamp_u8((c + 516 * d + 128) >> 8),
    ]
}

/// Converts whole macropixels (4 input bytes, 6 output bytes). `format` is
/// [`PixelFormat::Yuv422`] or [`PixelFormat::Yuyv`].
pub fn yuv_to_rgb888(input: &[u8], output: &mut [u8], format: PixelFormat) -> Result<Progress> {
    let order: fn(&[u8]) -> (u8, u8, u8, u8) = match format {
        PixelFormat::Yuv422 => |px| (px[1], px[3], px[0], px[2]),
        PixelFormat::Yuyv => |px| (px[0], px[2], px[1], px[3]),
        other => return Err(SdkError::Unsupported(format!("{other:?} is not a YUV format"))),
    };
    if input.len() < 4 {
        return Err(SdkError::InputBufferTooSmall);
    }

    let available = input.len() / 4;
    let count = available.min(output.len() / 6);
    for (px, rgb) in input
        .chunks_exact(4)
        .zip(output.chunks_exact_mut(6))
        .take(count)
    {
        let (y0, y1, u, v) = order(px);
        rgb[..3].copy_from_slice(&yuv_to_rgb(y0, u, v));
        rgb[3..].copy_from_slice(&yuv_to_rgb(y1, u, v));
    }

    let progress = Progress {
        consumed: count * 4,
        produced: count * 6,
    };
    if count < available {
        return Err(SdkError::OutputBufferOverflow {
            consumed: progress.consumed,
            produced: progress.produced,
        });
    }
    Ok(progress)
}

/// Converts a complete buffer of `format` pixels to RGB888.
pub fn to_rgb888(data: &[u8], format: PixelFormat) -> Result<Vec<u8>> {
    match format {
        PixelFormat::Rgb888 => Ok(data.to_vec()),
        PixelFormat::Gray8 => Ok(data.iter().flat_map(|&g| [g, g, g]).collect()),
        PixelFormat::Yuv422 | PixelFormat::Yuyv => {
            let mut rgb = vec![0u8; data.len() / 4 * 6];
            yuv_to_rgb888(data, &mut rgb, format)?;
            Ok(rgb)
        }
        other => Err(SdkError::Unsupported(format!("no RGB conversion for {other:?}"))),
    }
}
