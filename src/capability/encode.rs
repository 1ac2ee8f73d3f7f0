//! Image encoding: `DynamicImage` → PNG bytes → base64 `ImageData`.
//!
//! Normalized assets are stored as PNG so the payload sent to the vision
//! model is lossless and independent of the codec the spreadsheet used.
//! `detail: "high"` asks GPT-4-class models for the full tile budget.

use crate::pipeline::images::ImageAsset;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use image::DynamicImage;
use std::io::Cursor;
use tracing::debug;

/// Encode an image as PNG bytes.
pub fn encode_png(img: &DynamicImage) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;
    Ok(buf)
}

/// Wrap a normalized asset as a base64 PNG attachment for the vision API.
pub fn to_image_data(asset: &ImageAsset) -> ImageData {
    let b64 = STANDARD.encode(&asset.payload);
    debug!(
        "Encoded image {} ({}x{}) → {} bytes base64",
        asset.media_path,
        asset.width,
        asset.height,
        b64.len()
    );
    ImageData::new(b64, "image/png").with_detail("high")
}
