//! Multimodal input encoding: images as base64 data URLs, documents as inline text.

use crate::core::message::{ContentPart, ImageUrl, MessageContent};
use crate::error::{QwenError, Result};
use base64::prelude::*;
use std::path::Path;
use tokio::fs;

/// Label placed between the caller's prompt and an inlined document.
const DOCUMENT_LABEL: &str = "Document content:";

/// MIME type guessed from the file extension; unknown extensions are sent as JPEG.
pub fn image_mime(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("bmp") => "image/bmp",
        _ => "image/jpeg",
    }
}

async fn read_input(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).await.map_err(|e| {
        QwenError::InvalidInput(format!("Cannot read file {}: {}", path.display(), e))
    })
}

pub async fn image_part(path: &Path) -> Result<ContentPart> {
    let bytes = read_input(path).await?;
    let url = format!(
        "data:{};base64,{}",
        image_mime(path),
        BASE64_STANDARD.encode(bytes)
    );
    Ok(ContentPart::ImageUrl {
        image_url: ImageUrl { url },
    })
}

/// Text part followed by one image part per path, in order.
pub async fn image_content<P: AsRef<Path>>(message: &str, paths: &[P]) -> Result<MessageContent> {
    let mut parts = Vec::with_capacity(paths.len() + 1);
    parts.push(ContentPart::Text {
        text: message.to_string(),
    });
    for path in paths {
        parts.push(image_part(path.as_ref()).await?);
    }
    Ok(MessageContent::Parts(parts))
}

/// Prompt with the UTF-8 document appended after a label line.
pub async fn document_prompt(message: &str, path: &Path) -> Result<String> {
    let bytes = read_input(path).await?;
    let text = String::from_utf8(bytes).map_err(|_| {
        QwenError::InvalidInput(format!(
            "Document {} is not valid UTF-8 text",
            path.display()
        ))
    })?;
    Ok(format!("{}\n\n{}\n{}", message, DOCUMENT_LABEL, text))
}
