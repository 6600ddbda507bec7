//! Request fingerprints.
//!
//! A SHA-256 digest over a length-prefixed encoding of every canonical
//! field that influences the output. Source images and masks contribute
//! their own digests. Nothing request-scoped (task ids, timestamps) is
//! included, so identical requests always collide.

use crate::request::CanonicalRequest;
use sha2::{Digest, Sha256};
use std::fmt;

/// Encoding version, bumped whenever the field list changes.
const VERSION: &[u8] = b"imagegen-fp-v1";

/// Stable identity of a canonical request.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 32]);

struct Encoder(Sha256);

impl Encoder {
    fn field(&mut self, value: &[u8]) {
        self.0.update((value.len() as u64).to_le_bytes());
        self.0.update(value);
    }

    fn optional(&mut self, value: Option<&[u8]>) {
        match value {
            Some(v) => {
                self.0.update([1u8]);
                self.field(v);
            }
            None => self.0.update([0u8]),
        }
    }
}

impl Fingerprint {
    /// Fingerprint a canonical request.
    pub fn of(request: &CanonicalRequest) -> Self {
        let mut enc = Encoder(Sha256::new());
        enc.field(VERSION);
        enc.field(request.operation.as_str().as_bytes());
        enc.field(request.prompt.as_bytes());
        enc.field(request.model_id.as_bytes());
        enc.field(request.size.token().as_bytes());
        enc.field(request.quality.as_str().as_bytes());
        enc.optional(request.style.map(|s| s.as_str().as_bytes()));
        enc.field(request.output_format.as_str().as_bytes());
        enc.optional(request.background.map(|b| b.as_str().as_bytes()));
        enc.optional(request.moderation.map(|m| m.as_str().as_bytes()));
        let source = request.source_image.as_deref().map(|b| Sha256::digest(b));
        enc.optional(source.as_ref().map(|d| d.as_slice()));
        let mask = request.mask.as_deref().map(|b| Sha256::digest(b));
        enc.optional(mask.as_ref().map(|d| d.as_slice()));
        Self(enc.0.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First 16 hex characters, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }

    /// Parse a 64-character hex fingerprint.
    pub fn from_hex(value: &str) -> Option<Self> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(value, &mut bytes).ok()?;
        Some(Self(bytes))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.short())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use imagegen_mcp_common::params::{
        Background, ImageSize, Moderation, Operation, OutputFormat, Quality, Style,
    };
    use proptest::prelude::*;

    fn base() -> CanonicalRequest {
        CanonicalRequest {
            operation: Operation::Generate,
            prompt: "a red fox".to_string(),
            model_id: "gpt-image-1".to_string(),
            size: ImageSize::Square,
            quality: Quality::Auto,
            style: Some(Style::Vivid),
            output_format: OutputFormat::Png,
            background: Some(Background::Auto),
            moderation: None,
            source_image: None,
            mask: None,
        }
    }

    #[test]
    fn test_hex_round_trip() {
        let fp = Fingerprint::of(&base());
        assert_eq!(fp.to_hex().len(), 64);
        assert_eq!(Fingerprint::from_hex(&fp.to_hex()), Some(fp));
        assert_eq!(Fingerprint::from_hex("zz"), None);
        assert!(fp.to_hex().starts_with(&fp.short()));
    }

    #[test]
    fn test_each_field_changes_the_fingerprint() {
        let original = Fingerprint::of(&base());
        let variants: Vec<CanonicalRequest> = vec![
            CanonicalRequest {
                prompt: "a red fox ".to_string(),
                ..base()
            },
            CanonicalRequest {
                model_id: "imagen-4".to_string(),
                ..base()
            },
            CanonicalRequest {
                size: ImageSize::Landscape,
                ..base()
            },
            CanonicalRequest {
                quality: Quality::High,
                ..base()
            },
            CanonicalRequest {
                style: None,
                ..base()
            },
            CanonicalRequest {
                output_format: OutputFormat::Webp,
                ..base()
            },
            CanonicalRequest {
                background: Some(Background::Opaque),
                ..base()
            },
            CanonicalRequest {
                moderation: Some(Moderation::Low),
                ..base()
            },
            CanonicalRequest {
                moderation: Some(Moderation::Auto),
                ..base()
            },
            CanonicalRequest {
                operation: Operation::Edit,
                ..base()
            },
            CanonicalRequest {
                source_image: Some(vec![1, 2, 3]),
                ..base()
            },
            CanonicalRequest {
                mask: Some(vec![]),
                ..base()
            },
        ];
        for variant in variants {
            assert_ne!(Fingerprint::of(&variant), original, "{variant:?}");
        }
    }

    #[test]
    fn test_moderation_levels_fingerprint_differently() {
        let auto = CanonicalRequest {
            moderation: Some(Moderation::Auto),
            ..base()
        };
        let low = CanonicalRequest {
            moderation: Some(Moderation::Low),
            ..base()
        };
        assert_ne!(Fingerprint::of(&auto), Fingerprint::of(&low));
    }

    #[test]
    fn test_source_and_mask_are_not_interchangeable() {
        let a = CanonicalRequest {
            source_image: Some(vec![7]),
            ..base()
        };
        let b = CanonicalRequest {
            mask: Some(vec![7]),
            ..base()
        };
        assert_ne!(Fingerprint::of(&a), Fingerprint::of(&b));
    }

    proptest! {
        /// Equal requests always fingerprint equally.
        #[test]
        fn deterministic(
            prompt in ".{0,200}",
            image in proptest::collection::vec(any::<u8>(), 0..64),
        ) {
            let request = CanonicalRequest {
                prompt,
                source_image: Some(image),
                ..base()
            };
            prop_assert_eq!(Fingerprint::of(&request), Fingerprint::of(&request.clone()));
        }

        /// Moving text between adjacent fields cannot produce a collision.
        #[test]
        fn length_prefix_prevents_shifting(a in "[a-z]{1,10}", b in "[a-z]{1,10}") {
            let left = CanonicalRequest {
                prompt: format!("{a}{b}"),
                model_id: String::new(),
                ..base()
            };
            let right = CanonicalRequest {
                prompt: a.clone(),
                model_id: b.clone(),
                ..base()
            };
            prop_assert_ne!(Fingerprint::of(&left), Fingerprint::of(&right));
        }
    }
}
