use base64::Engine;
use image::ImageReader;
use ndarray::{Array3, ArrayView3};
use std::io::Cursor;
use thiserror::Error;

const DATA_URL_PREFIX: &[u8] = b"data:";

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("payload is empty")]
    EmptyPayload,
    #[error("invalid data URL: missing `,` separator")]
    InvalidDataUrl,
    #[error("invalid base64 in data URL: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("unrecognized image format")]
    UnsupportedFormat,
    #[error("malformed image: {0}")]
    Malformed(#[from] image::ImageError),
    #[error("decoded image has inconsistent dimensions: {0}")]
    Shape(#[from] ndarray::ShapeError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PixelGrid {
    pixels: Array3<u8>,
}

impl PixelGrid {
    pub fn from_array(pixels: Array3<u8>) -> Self {
        Self { pixels }
    }

    pub fn height(&self) -> usize {
        self.pixels.shape()[0]
    }

    pub fn width(&self) -> usize {
        self.pixels.shape()[1]
    }

    pub fn view(&self) -> ArrayView3<'_, u8> {
        self.pixels.view()
    }

    pub fn to_rgb_image(&self) -> Option<image::RgbImage> {
        let (height, width) = (self.height() as u32, self.width() as u32);
        image::RgbImage::from_raw(width, height, self.pixels.iter().copied().collect())
    }
}

pub fn decode(bytes: &[u8]) -> Result<PixelGrid, DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError::EmptyPayload);
    }

    let image_bytes = if bytes.starts_with(DATA_URL_PREFIX) {
        decode_data_url(bytes)?
    } else {
        bytes.to_vec()
    };

    let reader = ImageReader::new(Cursor::new(image_bytes))
        .with_guessed_format()
        .map_err(|_| DecodeError::UnsupportedFormat)?;
    if reader.format().is_none() {
        return Err(DecodeError::UnsupportedFormat);
    }

    let rgb = reader.decode()?.to_rgb8();
    let (width, height) = rgb.dimensions();
    let pixels = Array3::from_shape_vec((height as usize, width as usize, 3), rgb.into_raw())?;

    Ok(PixelGrid { pixels })
}

fn decode_data_url(bytes: &[u8]) -> Result<Vec<u8>, DecodeError> {
    let separator = bytes
        .iter()
        .position(|b| *b == b',')
        .ok_or(DecodeError::InvalidDataUrl)?;
    let encoded: Vec<u8> = bytes[separator + 1..]
        .iter()
        .copied()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();

    Ok(base64::engine::general_purpose::STANDARD.decode(encoded)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};

    fn encoded_image(format: image::ImageFormat) -> Vec<u8> {
        let img = ImageBuffer::<Rgb<u8>, Vec<u8>>::from_fn(4, 2, |x, y| {
            Rgb([x as u8 * 10, y as u8 * 100, 7])
        });
        let mut image_data: Vec<u8> = Vec::new();
        img.write_to(&mut Cursor::new(&mut image_data), format)
            .unwrap();
        image_data
    }

    #[test]
    fn test_decode_png_keeps_rgb_layout() {
        let grid = decode(&encoded_image(image::ImageFormat::Png)).unwrap();

        assert_eq!(grid.height(), 2);
        assert_eq!(grid.width(), 4);
        assert_eq!(grid.view().shape(), &[2, 4, 3]);
        assert_eq!(grid.view()[[1, 3, 0]], 30);
        assert_eq!(grid.view()[[1, 3, 1]], 100);
        assert_eq!(grid.view()[[1, 3, 2]], 7);
    }

    #[test]
    fn test_decode_data_url() {
        let png = encoded_image(image::ImageFormat::Png);
        let data_url = format!(
            "data:image/png;base64,{}",
            base64::engine::general_purpose::STANDARD.encode(&png)
        );

        let from_url = decode(data_url.as_bytes()).unwrap();
        let from_raw = decode(&png).unwrap();
        assert_eq!(from_url, from_raw);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(decode(&[]), Err(DecodeError::EmptyPayload)));
        assert!(matches!(
            decode(b"definitely not an image"),
            Err(DecodeError::UnsupportedFormat)
        ));
        assert!(matches!(
            decode(b"data:image/png;base64"),
            Err(DecodeError::InvalidDataUrl)
        ));
        assert!(matches!(
            decode(b"data:image/png;base64,@@@"),
            Err(DecodeError::Base64(_))
        ));
    }

    #[test]
    fn test_decode_truncated_png_is_malformed() {
        let png = encoded_image(image::ImageFormat::Png);
        let truncated = &png[..png.len() / 2];

        assert!(matches!(decode(truncated), Err(DecodeError::Malformed(_))));
    }

    #[test]
    fn test_to_rgb_image_round_trips_dimensions() {
        let grid = decode(&encoded_image(image::ImageFormat::Png)).unwrap();
        let rgb = grid.to_rgb_image().unwrap();

        assert_eq!(rgb.dimensions(), (4, 2));
        assert_eq!(rgb.get_pixel(3, 1), &Rgb([30, 100, 7]));
    }
}
