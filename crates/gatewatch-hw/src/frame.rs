//! Pixel-format conversion to packed RGB and dark-frame detection.

use gatewatch_core::Frame;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("buffer too short: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("odd frame width {0} for 4:2:2 data")]
    OddWidth(u32),
}

fn check_len(buf: &[u8], expected: usize) -> Result<(), FrameError> {
    if buf.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: buf.len(),
        });
    }
    Ok(())
}

/// BT.601 limited-range YCbCr to RGB, integer arithmetic.
fn ycbcr_to_rgb(y: u8, cb: u8, cr: u8) -> [u8; 3] {
    let c = (y as i32 - 16).max(0) * 298;
    let d = cb as i32 - 128;
    let e = cr as i32 - 128;
    let clamp = |v: i32| ((v + 128) >> 8).clamp(0, 255) as u8;
    [clamp(c + 409 * e), clamp(c - 100 * d - 208 * e), clamp(c + 516 * d)]
}

/// Packed YUYV 4:2:2 (`[Y0, U, Y1, V]` per pixel pair) to RGB.
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    if width % 2 != 0 {
        return Err(FrameError::OddWidth(width));
    }
    let pixels = width as usize * height as usize;
    check_len(yuyv, pixels * 2)?;

    let mut rgb = Vec::with_capacity(pixels * 3);
    for chunk in yuyv[..pixels * 2].chunks_exact(4) {
        let (y0, u, y1, v) = (chunk[0], chunk[1], chunk[2], chunk[3]);
        rgb.extend_from_slice(&ycbcr_to_rgb(y0, u, v));
        rgb.extend_from_slice(&ycbcr_to_rgb(y1, u, v));
    }
    Ok(rgb)
}

/// 8-bit greyscale replicated into three channels.
pub fn grey_to_rgb(grey: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let pixels = width as usize * height as usize;
    check_len(grey, pixels)?;
    Ok(grey[..pixels].iter().flat_map(|&g| [g, g, g]).collect())
}

/// 16-bit little-endian greyscale, keeping the high byte.
pub fn y16_to_rgb(y16: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let pixels = width as usize * height as usize;
    check_len(y16, pixels * 2)?;
    Ok(y16[..pixels * 2]
        .chunks_exact(2)
        .flat_map(|px| [px[1], px[1], px[1]])
        .collect())
}

/// Rec.601 luma of one RGB pixel.
fn luma(px: &[u8]) -> u8 {
    ((px[0] as u32 * 299 + px[1] as u32 * 587 + px[2] as u32 * 114) / 1000) as u8
}

/// Mean luma, 0-255.
pub fn avg_brightness(frame: &Frame) -> f32 {
    let pixels: Vec<u8> = frame.data.chunks_exact(3).map(luma).collect();
    if pixels.is_empty() {
        return 0.0;
    }
    pixels.iter().map(|&p| p as f32).sum::<f32>() / pixels.len() as f32
}

/// True when more than `threshold_pct` of the pixels have luma below 32.
pub fn is_dark_frame(frame: &Frame, threshold_pct: f32) -> bool {
    let total = frame.data.len() / 3;
    if total == 0 {
        return true;
    }
    let dark = frame.data.chunks_exact(3).filter(|px| luma(px) < 32).count();
    dark as f32 / total as f32 > threshold_pct
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yuyv_neutral_chroma_is_grey() {
        // Y=235 is white, Y=16 black in limited range
        let rgb = yuyv_to_rgb(&[235, 128, 16, 128], 2, 1).unwrap();
        assert_eq!(rgb, vec![255, 255, 255, 0, 0, 0]);
    }

    #[test]
    fn test_yuyv_red_dominant() {
        let rgb = yuyv_to_rgb(&[81, 90, 81, 240], 2, 1).unwrap();
        assert!(rgb[0] > 200 && rgb[1] < 40 && rgb[2] < 40, "got {rgb:?}");
    }

    #[test]
    fn test_yuyv_short_buffer() {
        assert!(matches!(
            yuyv_to_rgb(&[0; 6], 2, 2),
            Err(FrameError::InvalidLength { expected: 8, actual: 6 })
        ));
        assert!(matches!(yuyv_to_rgb(&[0; 6], 3, 1), Err(FrameError::OddWidth(3))));
    }

    #[test]
    fn test_grey_and_y16() {
        assert_eq!(grey_to_rgb(&[7, 9], 2, 1).unwrap(), vec![7, 7, 7, 9, 9, 9]);
        assert_eq!(y16_to_rgb(&[0xFF, 0x12, 0x00, 0xAB], 2, 1).unwrap(), vec![0x12, 0x12, 0x12, 0xAB, 0xAB, 0xAB]);
    }

    #[test]
    fn test_dark_frame_detection() {
        let dark = Frame::new(vec![5u8; 10 * 10 * 3], 10, 10);
        assert!(is_dark_frame(&dark, 0.95));

        let mut data = vec![5u8; 10 * 10 * 3];
        data[..30 * 3].fill(200);
        let lit = Frame::new(data, 10, 10);
        assert!(!is_dark_frame(&lit, 0.95));

        assert!(is_dark_frame(&Frame::new(Vec::new(), 0, 0), 0.95));
    }

    #[test]
    fn test_avg_brightness() {
        let frame = Frame::new(vec![100u8; 4 * 3], 2, 2);
        assert!((avg_brightness(&frame) - 99.0).abs() < 1.5);
    }
}
