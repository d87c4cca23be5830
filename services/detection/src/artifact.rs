//! Annotated-image payload codec.
//!
//! The detection backend returns the annotated image either as bare base64 or
//! as a data URL (`data:image/png;base64,...`). Decoding yields the raw bytes
//! and the file extension to store them under.

use base64::{engine::general_purpose::STANDARD, Engine};
use thiserror::Error;

/// Extension used when the payload carries no data-URL prefix
pub const DEFAULT_EXTENSION: &str = "jpg";

/// Errors that can occur while decoding an artifact payload.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ArtifactError {
    #[error("Annotated image is not valid base64: {0}")]
    MalformedArtifact(String),
}

/// A decoded annotated image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedArtifact {
    /// Raw image bytes
    pub bytes: Vec<u8>,
    /// File extension without the leading dot
    pub extension: String,
}

/// Decode a base64 or data-URL payload into bytes and an extension.
pub fn decode(payload: &str) -> Result<DecodedArtifact, ArtifactError> {
    let (data, extension) = match split_data_url(payload) {
        Some((subtype, data)) => (data, subtype.to_string()),
        None => (payload, DEFAULT_EXTENSION.to_string()),
    };

    let bytes = STANDARD
        .decode(data.trim())
        .map_err(|e| ArtifactError::MalformedArtifact(e.to_string()))?;

    Ok(DecodedArtifact { bytes, extension })
}

/// Encode bytes as a `data:image/<subtype>;base64,` URL.
pub fn encode(bytes: &[u8], subtype: &str) -> String {
    format!("data:image/{};base64,{}", subtype, STANDARD.encode(bytes))
}

/// Match `data:image/<subtype>;base64,<data>`, where subtype is a word
/// (ASCII alphanumerics or underscore). Returns `(subtype, data)`.
fn split_data_url(payload: &str) -> Option<(&str, &str)> {
    let rest = payload.strip_prefix("data:image/")?;
    let (subtype, data) = rest.split_once(";base64,")?;

    let is_word = !subtype.is_empty()
        && subtype
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');

    if !is_word || data.is_empty() {
        return None;
    }

    Some((subtype, data))
}
