use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::DynamicImage;

use crate::config::ImageConfig;

#[derive(Debug, thiserror::Error)]
pub enum PreprocessError {
    #[error("Image decode error: {0}")]
    Decode(String),
    #[error("Image encode error: {0}")]
    Encode(String),
}

/// Shrinks client images to a bounding box and re-encodes them as JPEG.
#[derive(Clone, Debug)]
pub struct ImagePreprocessor {
    max_width: u32,
    max_height: u32,
    quality: u8,
}

impl ImagePreprocessor {
    pub fn new(config: &ImageConfig) -> Self {
        Self {
            max_width: config.max_width.max(1),
            max_height: config.max_height.max(1),
            quality: config.jpeg_quality.clamp(1, 100),
        }
    }

    /// Accepts plain base64 or a `data:<mime>;base64,` URL as produced by browsers.
    pub fn decode_base64(payload: &str) -> Result<Vec<u8>, PreprocessError> {
        let trimmed = payload.trim();
        let data = match trimmed.strip_prefix("data:") {
            Some(rest) => rest
                .split_once(',')
                .map(|(_, data)| data)
                .ok_or_else(|| PreprocessError::Decode("data URL without payload".to_string()))?,
            None => trimmed,
        };
        let compact: String = data.chars().filter(|c| !c.is_ascii_whitespace()).collect();
        STANDARD
            .decode(compact.as_bytes())
            .map_err(|e| PreprocessError::Decode(e.to_string()))
    }

    pub fn compress_base64(&self, payload: &str) -> Result<String, PreprocessError> {
        let raw = Self::decode_base64(payload)?;
        let jpeg = self.compress(&raw)?;
        Ok(STANDARD.encode(jpeg))
    }

    pub fn compress(&self, raw: &[u8]) -> Result<Vec<u8>, PreprocessError> {
        let decoded =
            image::load_from_memory(raw).map_err(|e| PreprocessError::Decode(e.to_string()))?;
        let fitted = self.fit(decoded);

        // JPEG carries no alpha channel.
        let rgb = DynamicImage::ImageRgb8(fitted.to_rgb8());

        let mut buffer = Vec::new();
        let encoder = JpegEncoder::new_with_quality(&mut buffer, self.quality);
        rgb.write_with_encoder(encoder)
            .map_err(|e| PreprocessError::Encode(e.to_string()))?;

        log::debug!(
            "Compressed image {}x{} to {} bytes at quality {}",
            rgb.width(),
            rgb.height(),
            buffer.len(),
            self.quality
        );
        Ok(buffer)
    }

    fn fit(&self, img: DynamicImage) -> DynamicImage {
        if img.width() <= self.max_width && img.height() <= self.max_height {
            return img;
        }
        img.resize(self.max_width, self.max_height, FilterType::Lanczos3)
    }
}

impl Default for ImagePreprocessor {
    fn default() -> Self {
        Self::new(&ImageConfig::default())
    }
}
