//! Uploaded pictures: property photos, profile pictures, KTP cards and payment proofs.

use std::io;
use std::path::{Path, PathBuf};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use ulid::Ulid;

use crate::limits::MAX_IMAGE_BYTES;

#[derive(Debug)]
pub enum ImageError {
    UnsupportedType(String),
    /// The bytes do not look like the declared type.
    ContentMismatch(&'static str),
    TooLarge(usize),
    Empty,
    Encoding(String),
    Io(io::Error),
}

impl std::fmt::Display for ImageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImageError::UnsupportedType(t) => {
                write!(f, "unsupported image type {t} (jpeg, png or gif only)")
            }
            ImageError::ContentMismatch(t) => write!(f, "data is not a valid {t} image"),
            ImageError::TooLarge(n) => {
                write!(f, "image of {n} bytes exceeds the {MAX_IMAGE_BYTES} byte limit")
            }
            ImageError::Empty => write!(f, "image is empty"),
            ImageError::Encoding(e) => write!(f, "bad base64: {e}"),
            ImageError::Io(e) => write!(f, "image storage: {e}"),
        }
    }
}

impl std::error::Error for ImageError {}

impl From<io::Error> for ImageError {
    fn from(e: io::Error) -> Self {
        ImageError::Io(e)
    }
}

/// File extension for an accepted content type.
pub fn extension(content_type: &str) -> Option<&'static str> {
    match content_type.to_ascii_lowercase().as_str() {
        "image/jpeg" | "image/jpg" => Some("jpg"),
        "image/png" => Some("png"),
        "image/gif" => Some("gif"),
        _ => None,
    }
}

fn matches_signature(ext: &str, data: &[u8]) -> bool {
    match ext {
        "jpg" => data.starts_with(&[0xFF, 0xD8, 0xFF]),
        "png" => data.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]),
        "gif" => data.starts_with(b"GIF87a") || data.starts_with(b"GIF89a"),
        _ => false,
    }
}

/// Check type, size and magic bytes. Returns the extension to store under.
pub fn validate(content_type: &str, data: &[u8]) -> Result<&'static str, ImageError> {
    let ext = extension(content_type)
        .ok_or_else(|| ImageError::UnsupportedType(content_type.to_string()))?;
    if data.is_empty() {
        return Err(ImageError::Empty);
    }
    if data.len() > MAX_IMAGE_BYTES {
        return Err(ImageError::TooLarge(data.len()));
    }
    if !matches_signature(ext, data) {
        return Err(ImageError::ContentMismatch(ext));
    }
    Ok(ext)
}

pub fn file_name(id: Ulid, ext: &str) -> String {
    format!("IMG-{id}.{ext}")
}

pub fn decode_base64(data: &str) -> Result<Vec<u8>, ImageError> {
    STANDARD
        .decode(data.trim())
        .map_err(|e| ImageError::Encoding(e.to_string()))
}

pub fn encode_base64(data: &[u8]) -> String {
    STANDARD.encode(data)
}

/// One directory of image files per site.
pub struct ImageStore {
    dir: PathBuf,
}

impl ImageStore {
    pub fn open(dir: &Path) -> io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    /// Write via a temp file and rename, so a crash never leaves a partial image.
    pub async fn write(&self, file_name: &str, data: &[u8]) -> io::Result<()> {
        let path = self.dir.join(file_name);
        let tmp = path.with_extension("part");
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &path).await
    }

    pub async fn read(&self, file_name: &str) -> io::Result<Vec<u8>> {
        tokio::fs::read(self.dir.join(file_name)).await
    }

    pub async fn remove(&self, file_name: &str) -> io::Result<()> {
        match tokio::fs::remove_file(self.dir.join(file_name)).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const PNG: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 13];

    #[test]
    fn accepted_types() {
        assert_eq!(extension("image/jpeg"), Some("jpg"));
        assert_eq!(extension("IMAGE/PNG"), Some("png"));
        assert_eq!(extension("image/gif"), Some("gif"));
        assert_eq!(extension("image/webp"), None);
        assert_eq!(extension("application/pdf"), None);
    }

    #[test]
    fn validate_checks_size_and_signature() {
        assert_eq!(validate("image/png", PNG).unwrap(), "png");
        assert!(matches!(validate("image/jpeg", PNG), Err(ImageError::ContentMismatch("jpg"))));
        assert!(matches!(validate("image/png", &[]), Err(ImageError::Empty)));
        assert!(matches!(validate("text/plain", PNG), Err(ImageError::UnsupportedType(_))));

        let mut big = PNG.to_vec();
        big.resize(MAX_IMAGE_BYTES + 1, 0);
        assert!(matches!(validate("image/png", &big), Err(ImageError::TooLarge(_))));
    }

    #[test]
    fn base64_roundtrip_and_errors() {
        let encoded = encode_base64(PNG);
        assert_eq!(decode_base64(&encoded).unwrap(), PNG);
        assert!(decode_base64("not base64!!").is_err());
    }

    #[tokio::test]
    async fn store_write_read_remove() {
        let dir = std::env::temp_dir().join(format!("staybook_test_images_{}", Ulid::new()));
        let store = ImageStore::open(&dir).unwrap();
        let name = file_name(Ulid::new(), "png");

        store.write(&name, PNG).await.unwrap();
        assert_eq!(store.read(&name).await.unwrap(), PNG);
        assert!(!dir.join(&name).with_extension("part").exists());

        store.remove(&name).await.unwrap();
        assert!(store.read(&name).await.is_err());
        store.remove(&name).await.unwrap();
    }
}
