//! Image utility functions

use image::{DynamicImage, GrayImage};

use crate::error::{Result, VisionError};

/// Decode image from bytes (JPEG, PNG, etc.)
pub fn decode_image(data: &[u8]) -> Result<DynamicImage> {
    let img = image::load_from_memory(data)?;
    Ok(img)
}

/// Encode a binary mask (0/255 per pixel) to PNG bytes
pub fn encode_mask_png(width: u32, height: u32, mask: &[u8]) -> Result<Vec<u8>> {
    let gray = GrayImage::from_raw(width, height, mask.to_vec())
        .ok_or(VisionError::Image("mask buffer does not match its dimensions".to_string()))?;
    let mut buffer = std::io::Cursor::new(Vec::new());
    DynamicImage::ImageLuma8(gray).write_to(&mut buffer, image::ImageFormat::Png)?;
    Ok(buffer.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_png_round_trip() {
        let mask = vec![0, 255, 255, 0];
        let png = encode_mask_png(2, 2, &mask).unwrap();
        let decoded = decode_image(&png).unwrap().to_luma8();
        assert_eq!(decoded.into_raw(), mask);
    }
}
