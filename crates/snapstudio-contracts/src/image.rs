use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

pub const DEFAULT_MIME_TYPE: &str = "image/png";

/// Encoded image payload exchanged between the session, the dispatcher and
/// the backends.
///
/// The payload is held as base64 text because that is the shape every wire
/// format we talk to uses. Clones share the same buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    mime_type: Arc<str>,
    data: Arc<str>,
}

impl ImageRef {
    pub fn from_base64(mime_type: impl AsRef<str>, data: impl AsRef<str>) -> Self {
        let mime_type = mime_type.as_ref().trim();
        Self {
            mime_type: Arc::from(if mime_type.is_empty() {
                DEFAULT_MIME_TYPE
            } else {
                mime_type
            }),
            data: Arc::from(data.as_ref().trim()),
        }
    }

    pub fn from_bytes(mime_type: impl AsRef<str>, bytes: &[u8]) -> Self {
        Self::from_base64(mime_type, BASE64.encode(bytes))
    }

    pub fn from_path(path: &Path) -> anyhow::Result<Self> {
        let bytes =
            std::fs::read(path).with_context(|| format!("failed reading {}", path.display()))?;
        if bytes.is_empty() {
            bail!("image file is empty: {}", path.display());
        }
        let mime = mime_for_path(path).unwrap_or(DEFAULT_MIME_TYPE);
        Ok(Self::from_bytes(mime, &bytes))
    }

    /// Accepts `data:<mime>;base64,<payload>` or a bare base64 payload, which
    /// is assumed to be PNG.
    pub fn from_data_url(raw: &str) -> anyhow::Result<Self> {
        let trimmed = raw.trim();
        let Some(rest) = trimmed.strip_prefix("data:") else {
            if trimmed.is_empty() {
                bail!("image data is empty");
            }
            return Ok(Self::from_base64(DEFAULT_MIME_TYPE, trimmed));
        };
        let Some((header, payload)) = rest.split_once(',') else {
            bail!("data URL is missing its payload separator");
        };
        let Some(mime) = header.strip_suffix(";base64") else {
            bail!("only base64 data URLs are supported");
        };
        if payload.trim().is_empty() {
            bail!("data URL payload is empty");
        }
        Ok(Self::from_base64(mime, payload))
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn base64(&self) -> &str {
        &self.data
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn to_data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.data)
    }

    pub fn decode(&self) -> anyhow::Result<Vec<u8>> {
        BASE64
            .decode(self.data.as_bytes())
            .context("image base64 decode failed")
    }

    /// File extension matching the MIME type, `png` when unknown.
    pub fn extension(&self) -> &'static str {
        match self.mime_type.to_ascii_lowercase().as_str() {
            "image/jpeg" | "image/jpg" => "jpg",
            "image/webp" => "webp",
            "image/gif" => "gif",
            _ => "png",
        }
    }
}

pub fn mime_for_path(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        "heic" => Some("image/heic"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::ImageRef;

    #[test]
    fn data_url_splits_mime_and_payload() -> anyhow::Result<()> {
        let image = ImageRef::from_data_url("data:image/jpeg;base64,AAEC")?;
        assert_eq!(image.mime_type(), "image/jpeg");
        assert_eq!(image.base64(), "AAEC");
        assert_eq!(image.decode()?, vec![0, 1, 2]);
        assert_eq!(image.to_data_url(), "data:image/jpeg;base64,AAEC");
        assert_eq!(image.extension(), "jpg");
        Ok(())
    }

    #[test]
    fn bare_payload_defaults_to_png() -> anyhow::Result<()> {
        let image = ImageRef::from_data_url("AAEC")?;
        assert_eq!(image.mime_type(), "image/png");
        assert_eq!(image.extension(), "png");
        Ok(())
    }

    #[test]
    fn malformed_data_urls_are_rejected() {
        assert!(ImageRef::from_data_url("").is_err());
        assert!(ImageRef::from_data_url("data:image/png;base64,").is_err());
        assert!(ImageRef::from_data_url("data:image/png,AAEC").is_err());
        assert!(ImageRef::from_data_url("data:image/png;base64").is_err());
    }

    #[test]
    fn from_path_guesses_mime_from_extension() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("product.JPG");
        std::fs::write(&path, [0xff, 0xd8, 0xff])?;
        let image = ImageRef::from_path(&path)?;
        assert_eq!(image.mime_type(), "image/jpeg");
        assert_eq!(image.decode()?, vec![0xff, 0xd8, 0xff]);

        let empty = temp.path().join("empty.png");
        std::fs::write(&empty, [])?;
        assert!(ImageRef::from_path(&empty).is_err());
        Ok(())
    }
}
