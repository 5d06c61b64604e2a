use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ids::ImageId;

/// Which rendition of a source image an artifact holds.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum VariantKind {
    Thumbnail,
    Cache,
}

impl VariantKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Thumbnail => "thumbnail",
            Self::Cache => "cache",
        }
    }
}

impl fmt::Display for VariantKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output codec for derived artifacts.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum EncodeFormat {
    Jpeg,
    Png,
    Webp,
}

impl EncodeFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Jpeg => "jpeg",
            Self::Png => "png",
            Self::Webp => "webp",
        }
    }

    /// File extension used on disk.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Jpeg => "jpg",
            Self::Png => "png",
            Self::Webp => "webp",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::Webp => "image/webp",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "jpeg" | "jpg" => Some(Self::Jpeg),
            "png" => Some(Self::Png),
            "webp" => Some(Self::Webp),
            _ => None,
        }
    }
}

impl fmt::Display for EncodeFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The parameters that uniquely identify a derived artifact.
///
/// Two specs with equal fields always produce the same [`Fingerprint`], so
/// concurrent producers converge on a single stored file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactSpec {
    pub image_id: ImageId,
    pub variant: VariantKind,
    pub width: u32,
    pub height: u32,
    pub quality: u8,
    pub format: EncodeFormat,
}

impl ArtifactSpec {
    /// The canonical serialization hashed into the fingerprint. The field
    /// order is fixed: image id (simple uuid), variant, `WxH`, quality,
    /// format. Changing this string breaks every cache on disk.
    pub fn canonical_string(&self) -> String {
        format!(
            "v1:{}:{}:{}x{}:q{}:{}",
            self.image_id.as_uuid().simple(),
            self.variant,
            self.width,
            self.height,
            self.quality,
            self.format
        )
    }
}

/// Hex-encoded SHA-256 of an [`ArtifactSpec`]'s canonical string.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Wrap an already-computed digest. The value must be 64 lowercase hex
    /// characters; anything else is rejected.
    pub fn from_hex(hex: String) -> Option<Self> {
        let valid = hex.len() == 64
            && hex
                .bytes()
                .all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
        valid.then_some(Self(hex))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Two-character shard directory prefix.
    pub fn shard(&self) -> &str {
        &self.0[..2]
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Fingerprint").field(&self.0).finish()
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn canonical_string_is_stable() {
        let image_id = ImageId(
            Uuid::parse_str("01234567-89ab-cdef-0123-456789abcdef").unwrap(),
        );
        let spec = ArtifactSpec {
            image_id,
            variant: VariantKind::Thumbnail,
            width: 300,
            height: 300,
            quality: 85,
            format: EncodeFormat::Jpeg,
        };
        assert_eq!(
            spec.canonical_string(),
            "v1:0123456789abcdef0123456789abcdef:thumbnail:300x300:q85:jpeg"
        );
    }

    #[test]
    fn fingerprint_rejects_bad_hex() {
        assert!(Fingerprint::from_hex("abc".into()).is_none());
        assert!(Fingerprint::from_hex("Z".repeat(64)).is_none());
        let ok = Fingerprint::from_hex("a1".repeat(32)).unwrap();
        assert_eq!(ok.shard(), "a1");
    }
}
