//! Sharing a room: link, QR code and clipboard

use anyhow::{anyhow, Result};
use qrcode::render::unicode::Dense1x2;
use qrcode::QrCode;

/// QR code of `link` drawn with half-block characters, two rows per line.
pub fn qr_text(link: &str) -> Result<String> {
    let code = QrCode::new(link.as_bytes()).map_err(|e| anyhow!("Failed to encode QR code: {}", e))?;
    Ok(code
        .render::<Dense1x2>()
        .dark_color(Dense1x2::Light)
        .light_color(Dense1x2::Dark)
        .quiet_zone(true)
        .build())
}

pub fn copy_to_clipboard(text: &str) -> Result<()> {
    let mut clipboard =
        arboard::Clipboard::new().map_err(|e| anyhow!("Clipboard unavailable: {}", e))?;
    clipboard
        .set_text(text.to_string())
        .map_err(|e| anyhow!("Failed to copy: {}", e))
}
