//! Canonical request vocabulary shared by every provider.
//!
//! Tool arguments are parsed into these types once; the translator in the
//! server crate maps them to each provider's wire values.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A tool argument did not match any canonical value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid {field} '{value}'. Valid options: {}", .valid.join(", "))]
pub struct ParseParamError {
    /// Request field being parsed
    pub field: &'static str,
    /// Value supplied by the caller
    pub value: String,
    /// Accepted spellings
    pub valid: &'static [&'static str],
}

macro_rules! canonical_enum {
    (
        $(#[$meta:meta])*
        $name:ident, $field:literal {
            $( $(#[$vmeta:meta])* $variant:ident => $token:literal $(| $alias:literal)* ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(rename_all = "lowercase")]
        pub enum $name {
            $( $(#[$vmeta])* $(#[serde(alias = $alias)])* $variant, )+
        }

        impl $name {
            /// Every value, in declaration order.
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            const TOKENS: &'static [&'static str] = &[$($token),+];

            /// Canonical wire token.
            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $token,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseParamError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_lowercase().as_str() {
                    $($token $(| $alias)* => Ok($name::$variant),)+
                    _ => Err(ParseParamError {
                        field: $field,
                        value: s.to_string(),
                        valid: Self::TOKENS,
                    }),
                }
            }
        }
    };
}

canonical_enum! {
    /// Requested operation.
    Operation, "operation" {
        Generate => "generate",
        Edit => "edit",
    }
}

canonical_enum! {
    /// Quality tier.
    Quality, "quality" {
        Auto => "auto",
        High => "high",
        Medium => "medium",
        Low => "low",
    }
}

canonical_enum! {
    /// Rendering style, only honoured by some models.
    Style, "style" {
        Vivid => "vivid",
        Natural => "natural",
    }
}

canonical_enum! {
    /// Encoded image format.
    OutputFormat, "output_format" {
        Png => "png",
        Jpeg => "jpeg" | "jpg",
        Webp => "webp",
    }
}

canonical_enum! {
    /// Background treatment.
    Background, "background" {
        Auto => "auto",
        Transparent => "transparent",
        Opaque => "opaque",
    }
}

canonical_enum! {
    /// Provider-side moderation strictness.
    Moderation, "moderation" {
        Auto => "auto",
        Low => "low",
    }
}

impl OutputFormat {
    /// MIME type for the encoded bytes.
    pub fn mime_type(self) -> &'static str {
        match self {
            OutputFormat::Png => "image/png",
            OutputFormat::Jpeg => "image/jpeg",
            OutputFormat::Webp => "image/webp",
        }
    }

    /// File extension used by the artifact store.
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Png => "png",
            OutputFormat::Jpeg => "jpg",
            OutputFormat::Webp => "webp",
        }
    }

    /// Reverse of [`OutputFormat::mime_type`].
    pub fn from_mime(mime: &str) -> Option<Self> {
        match mime.trim().to_lowercase().as_str() {
            "image/png" => Some(OutputFormat::Png),
            "image/jpeg" | "image/jpg" => Some(OutputFormat::Jpeg),
            "image/webp" => Some(OutputFormat::Webp),
            _ => None,
        }
    }

    /// Whether the format can carry an alpha channel.
    pub fn supports_transparency(self) -> bool {
        !matches!(self, OutputFormat::Jpeg)
    }
}

/// Smallest explicit edge length accepted.
pub const MIN_EDGE: u32 = 64;

/// Largest explicit edge length accepted.
pub const MAX_EDGE: u32 = 4096;

/// Output dimensions.
///
/// The three named sizes are the pixel sizes every provider in the catalog
/// understands; anything else is carried as an explicit width and height and
/// must appear in the model's supported sizes to be accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ImageSize {
    /// Let the provider choose.
    Auto,
    /// 1024x1024
    Square,
    /// 1536x1024
    Landscape,
    /// 1024x1536
    Portrait,
    /// Any other `WxH`.
    Custom { width: u32, height: u32 },
}

impl ImageSize {
    /// Pixel dimensions, `None` for `Auto`.
    pub fn dimensions(self) -> Option<(u32, u32)> {
        match self {
            ImageSize::Auto => None,
            ImageSize::Square => Some((1024, 1024)),
            ImageSize::Landscape => Some((1536, 1024)),
            ImageSize::Portrait => Some((1024, 1536)),
            ImageSize::Custom { width, height } => Some((width, height)),
        }
    }

    /// Build a size from pixel dimensions, folding the named sizes.
    pub fn from_dimensions(width: u32, height: u32) -> Self {
        match (width, height) {
            (1024, 1024) => ImageSize::Square,
            (1536, 1024) => ImageSize::Landscape,
            (1024, 1536) => ImageSize::Portrait,
            (width, height) => ImageSize::Custom { width, height },
        }
    }

    /// Canonical token: `auto` or `WxH`.
    pub fn token(self) -> String {
        match self.dimensions() {
            None => "auto".to_string(),
            Some((w, h)) => format!("{w}x{h}"),
        }
    }
}

impl fmt::Display for ImageSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.token())
    }
}

const SIZE_TOKENS: &[&str] = &["auto", "square", "landscape", "portrait", "<width>x<height>"];

impl FromStr for ImageSize {
    type Err = ParseParamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseParamError {
            field: "size",
            value: s.to_string(),
            valid: SIZE_TOKENS,
        };
        let lowered = s.trim().to_lowercase();
        match lowered.as_str() {
            "auto" => return Ok(ImageSize::Auto),
            "square" => return Ok(ImageSize::Square),
            "landscape" => return Ok(ImageSize::Landscape),
            "portrait" => return Ok(ImageSize::Portrait),
            _ => {}
        }
        let (w, h) = lowered.split_once('x').ok_or_else(err)?;
        let width: u32 = w.trim().parse().map_err(|_| err())?;
        let height: u32 = h.trim().parse().map_err(|_| err())?;
        if !(MIN_EDGE..=MAX_EDGE).contains(&width) || !(MIN_EDGE..=MAX_EDGE).contains(&height) {
            return Err(err());
        }
        Ok(ImageSize::from_dimensions(width, height))
    }
}

impl Serialize for ImageSize {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.token())
    }
}

impl<'de> Deserialize<'de> for ImageSize {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_named_sizes_parse_from_aliases_and_pixels() {
        assert_eq!("square".parse::<ImageSize>().unwrap(), ImageSize::Square);
        assert_eq!("1024x1024".parse::<ImageSize>().unwrap(), ImageSize::Square);
        assert_eq!("Landscape".parse::<ImageSize>().unwrap(), ImageSize::Landscape);
        assert_eq!("1536x1024".parse::<ImageSize>().unwrap(), ImageSize::Landscape);
        assert_eq!("1024X1536".parse::<ImageSize>().unwrap(), ImageSize::Portrait);
        assert_eq!(" auto ".parse::<ImageSize>().unwrap(), ImageSize::Auto);
    }

    #[test]
    fn test_explicit_size() {
        let size: ImageSize = "1792x1024".parse().unwrap();
        assert_eq!(
            size,
            ImageSize::Custom {
                width: 1792,
                height: 1024,
            }
        );
        assert_eq!(size.token(), "1792x1024");
    }

    #[test]
    fn test_invalid_sizes() {
        for bad in ["", "big", "1024", "x1024", "0x0", "10x10", "99999x1024", "axb"] {
            let err = bad.parse::<ImageSize>().unwrap_err();
            assert_eq!(err.field, "size", "{bad}");
        }
    }

    #[test]
    fn test_size_serde_uses_tokens() {
        let json = serde_json::to_string(&ImageSize::Landscape).unwrap();
        assert_eq!(json, "\"1536x1024\"");
        let back: ImageSize = serde_json::from_str("\"portrait\"").unwrap();
        assert_eq!(back, ImageSize::Portrait);
        assert!(serde_json::from_str::<ImageSize>("\"huge\"").is_err());
    }

    #[test]
    fn test_enum_parsing_is_case_insensitive() {
        assert_eq!("HIGH".parse::<Quality>().unwrap(), Quality::High);
        assert_eq!("Natural".parse::<Style>().unwrap(), Style::Natural);
        assert_eq!("jpg".parse::<OutputFormat>().unwrap(), OutputFormat::Jpeg);
        assert_eq!("transparent".parse::<Background>().unwrap(), Background::Transparent);
        assert_eq!("low".parse::<Moderation>().unwrap(), Moderation::Low);
    }

    #[test]
    fn test_parse_error_lists_options() {
        let err = "ultra".parse::<Quality>().unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("quality"));
        assert!(msg.contains("auto, high, medium, low"));
    }

    #[test]
    fn test_all_tokens_round_trip() {
        for q in Quality::ALL {
            assert_eq!(q.as_str().parse::<Quality>().unwrap(), *q);
        }
        for f in OutputFormat::ALL {
            assert_eq!(f.as_str().parse::<OutputFormat>().unwrap(), *f);
            assert_eq!(OutputFormat::from_mime(f.mime_type()), Some(*f));
        }
        for b in Background::ALL {
            assert_eq!(b.as_str().parse::<Background>().unwrap(), *b);
        }
    }

    #[test]
    fn test_output_format_serde_alias() {
        let f: OutputFormat = serde_json::from_str("\"jpg\"").unwrap();
        assert_eq!(f, OutputFormat::Jpeg);
        assert_eq!(serde_json::to_string(&f).unwrap(), "\"jpeg\"");
    }

    #[test]
    fn test_transparency_support() {
        assert!(OutputFormat::Png.supports_transparency());
        assert!(OutputFormat::Webp.supports_transparency());
        assert!(!OutputFormat::Jpeg.supports_transparency());
    }
}
