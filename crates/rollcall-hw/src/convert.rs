//! Raw capture buffers to 8-bit grayscale, and dark-frame detection.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("{format} buffer too short: expected {expected}, got {actual}")]
    TooShort {
        format: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("MJPG decode failed: {0}")]
    Mjpg(#[from] image::ImageError),
    #[error("MJPG frame is {actual_w}x{actual_h}, stream negotiated {width}x{height}")]
    SizeMismatch {
        width: u32,
        height: u32,
        actual_w: u32,
        actual_h: u32,
    },
}

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed (2 bytes/pixel, extract Y channel).
    Yuyv,
    /// 8-bit grayscale.
    Grey,
    /// 16-bit little-endian grayscale.
    Y16,
    /// Motion JPEG, one JPEG image per buffer.
    Mjpg,
}

impl PixelFormat {
    pub fn from_fourcc(fourcc: &[u8; 4]) -> Option<Self> {
        match fourcc {
            b"YUYV" => Some(Self::Yuyv),
            b"GREY" => Some(Self::Grey),
            b"Y16 " | b"Y16\0" => Some(Self::Y16),
            b"MJPG" => Some(Self::Mjpg),
            _ => None,
        }
    }

    /// Convert one buffer of this format into `width * height` grayscale bytes.
    pub fn to_grayscale(self, buf: &[u8], width: u32, height: u32) -> Result<Vec<u8>, ConvertError> {
        match self {
            Self::Yuyv => yuyv_to_grayscale(buf, width, height),
            Self::Grey => grey_to_grayscale(buf, width, height),
            Self::Y16 => y16_to_grayscale(buf, width, height),
            Self::Mjpg => mjpg_to_grayscale(buf, width, height),
        }
    }
}

/// Convert packed YUYV (4:2:2) to grayscale by extracting the Y channel.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V].
pub fn yuyv_to_grayscale(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, ConvertError> {
    let expected = width as usize * height as usize * 2;
    check_len("YUYV", yuyv, expected)?;
    Ok(yuyv[..expected].iter().step_by(2).copied().collect())
}

pub fn grey_to_grayscale(buf: &[u8], width: u32, height: u32) -> Result<Vec<u8>, ConvertError> {
    let pixels = width as usize * height as usize;
    check_len("GREY", buf, pixels)?;
    Ok(buf[..pixels].to_vec())
}

/// Keep the high byte of each little-endian 16-bit sample.
pub fn y16_to_grayscale(buf: &[u8], width: u32, height: u32) -> Result<Vec<u8>, ConvertError> {
    let pixels = width as usize * height as usize;
    check_len("Y16", buf, pixels * 2)?;
    Ok(buf[..pixels * 2]
        .chunks_exact(2)
        .map(|px| u16::from_le_bytes([px[0], px[1]]) >> 8)
        .map(|v| v as u8)
        .collect())
}

pub fn mjpg_to_grayscale(buf: &[u8], width: u32, height: u32) -> Result<Vec<u8>, ConvertError> {
    let gray = image::load_from_memory_with_format(buf, image::ImageFormat::Jpeg)?.to_luma8();
    let (actual_w, actual_h) = gray.dimensions();
    if (actual_w, actual_h) != (width, height) {
        return Err(ConvertError::SizeMismatch {
            width,
            height,
            actual_w,
            actual_h,
        });
    }
    Ok(gray.into_raw())
}

fn check_len(format: &'static str, buf: &[u8], expected: usize) -> Result<(), ConvertError> {
    if buf.len() < expected {
        return Err(ConvertError::TooShort {
            format,
            expected,
            actual: buf.len(),
        });
    }
    Ok(())
}

/// True when more than `threshold_pct` of the pixels fall in the darkest
/// bucket (0–31). Cameras emit such frames while exposure settles.
pub fn is_dark_frame(gray: &[u8], threshold_pct: f32) -> bool {
    if gray.is_empty() {
        return true;
    }
    let dark_count = gray.iter().filter(|&&p| p < 32).count();
    (dark_count as f32 / gray.len() as f32) > threshold_pct
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yuyv_to_grayscale() {
        // 4x2 image = 8 pixels, 16 YUYV bytes
        let yuyv: Vec<u8> = (0..16).collect();
        let gray = yuyv_to_grayscale(&yuyv, 4, 2).unwrap();
        assert_eq!(gray, vec![0, 2, 4, 6, 8, 10, 12, 14]);
    }

    #[test]
    fn test_short_buffers_rejected() {
        assert!(matches!(
            yuyv_to_grayscale(&[100, 128], 2, 1),
            Err(ConvertError::TooShort { format: "YUYV", expected: 4, actual: 2 })
        ));
        assert!(grey_to_grayscale(&[1, 2, 3], 2, 2).is_err());
        assert!(y16_to_grayscale(&[0; 7], 2, 2).is_err());
    }

    #[test]
    fn test_y16_keeps_high_byte() {
        let buf = [0x34, 0x12, 0xff, 0xab];
        assert_eq!(y16_to_grayscale(&buf, 2, 1).unwrap(), vec![0x12, 0xab]);
    }

    #[test]
    fn test_grey_truncates_padding() {
        let buf = [1, 2, 3, 4, 0, 0];
        assert_eq!(PixelFormat::Grey.to_grayscale(&buf, 2, 2).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_mjpg_decodes_to_luma() {
        let img = image::GrayImage::from_pixel(8, 4, image::Luma([200]));
        let mut jpeg = Vec::new();
        image::DynamicImage::ImageLuma8(img)
            .write_to(&mut std::io::Cursor::new(&mut jpeg), image::ImageFormat::Jpeg)
            .unwrap();

        let gray = mjpg_to_grayscale(&jpeg, 8, 4).unwrap();
        assert_eq!(gray.len(), 32);
        assert!(gray.iter().all(|&p| (195..=205).contains(&p)));
        assert!(matches!(
            mjpg_to_grayscale(&jpeg, 16, 4),
            Err(ConvertError::SizeMismatch { .. })
        ));
    }

    #[test]
    fn test_fourcc_mapping() {
        assert_eq!(PixelFormat::from_fourcc(b"YUYV"), Some(PixelFormat::Yuyv));
        assert_eq!(PixelFormat::from_fourcc(b"Y16 "), Some(PixelFormat::Y16));
        assert_eq!(PixelFormat::from_fourcc(b"RGB3"), None);
    }

    #[test]
    fn test_dark_frame_thresholds() {
        assert!(is_dark_frame(&[0u8; 1000], 0.95));
        assert!(!is_dark_frame(&[128u8; 1000], 0.95));
        assert!(is_dark_frame(&[], 0.95));

        // 96% dark is dark, 94% is not
        let mut gray = vec![10u8; 960];
        gray.extend(vec![128u8; 40]);
        assert!(is_dark_frame(&gray, 0.95));
        let mut gray = vec![10u8; 940];
        gray.extend(vec![128u8; 60]);
        assert!(!is_dark_frame(&gray, 0.95));
    }
}
