//! Canonical parameter translation.
//!
//! Pure tables mapping canonical request values to each provider family's
//! wire values, and provider-reported values back to canonical ones.

use crate::providers::{ProviderKind, ReportedParameters};
use crate::request::CanonicalRequest;
use imagegen_mcp_common::models::ModelCapabilityDescriptor;
use imagegen_mcp_common::params::{Background, ImageSize, Moderation, OutputFormat, Quality, Style};
use serde::{Deserialize, Serialize};

/// Canonical size to Imagen aspect ratio.
///
/// A fixed lookup, not geometry. Imagen accepts only `1:1`, `3:4`, `4:3`,
/// `9:16` and `16:9`, so the 3:2 landscape and 2:3 portrait presets are sent
/// as `16:9` and `9:16` rather than their exact ratios, which Vertex rejects.
/// `Auto` and explicit sizes leave the ratio unset; Imagen then renders 1:1.
pub const IMAGEN_ASPECT_RATIOS: &[(ImageSize, &str)] = &[
    (ImageSize::Square, "1:1"),
    (ImageSize::Landscape, "16:9"),
    (ImageSize::Portrait, "9:16"),
];

/// Canonical quality to Imagen quality tier. `Auto` leaves the tier unset.
pub const IMAGEN_QUALITY_TIERS: &[(Quality, &str)] = &[
    (Quality::High, "premium"),
    (Quality::Medium, "standard"),
    (Quality::Low, "fast"),
];

pub fn imagen_aspect_ratio(size: ImageSize) -> Option<&'static str> {
    IMAGEN_ASPECT_RATIOS
        .iter()
        .find(|(s, _)| *s == size)
        .map(|(_, ratio)| *ratio)
}

/// Map an Imagen aspect ratio back to the closest canonical size.
pub fn size_from_imagen_aspect_ratio(ratio: &str) -> Option<ImageSize> {
    match ratio.trim() {
        "1:1" => Some(ImageSize::Square),
        "16:9" | "4:3" => Some(ImageSize::Landscape),
        "9:16" | "3:4" => Some(ImageSize::Portrait),
        _ => None,
    }
}

pub fn imagen_quality_tier(quality: Quality) -> Option<&'static str> {
    IMAGEN_QUALITY_TIERS
        .iter()
        .find(|(q, _)| *q == quality)
        .map(|(_, tier)| *tier)
}

pub fn quality_from_imagen_tier(tier: &str) -> Option<Quality> {
    IMAGEN_QUALITY_TIERS
        .iter()
        .find(|(_, t)| *t == tier.trim())
        .map(|(q, _)| *q)
}

/// Wire parameters for an OpenAI-style request.
///
/// OpenAI-style providers accept the canonical tokens verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenAiParams {
    pub model: String,
    pub size: String,
    pub quality: &'static str,
    pub style: Option<&'static str>,
    pub output_format: &'static str,
    pub background: Option<&'static str>,
    pub moderation: Option<&'static str>,
}

pub fn to_openai(request: &CanonicalRequest, model: &ModelCapabilityDescriptor) -> OpenAiParams {
    OpenAiParams {
        model: model.native_id.clone(),
        size: request.size.token(),
        quality: request.quality.as_str(),
        style: request.style.map(Style::as_str),
        output_format: request.output_format.as_str(),
        background: request.background.map(Background::as_str),
        moderation: request.moderation.map(Moderation::as_str),
    }
}

/// Wire parameters for an Imagen-style request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagenParams {
    /// Native model id, selected by quality tier
    pub model: String,
    pub aspect_ratio: Option<&'static str>,
    pub quality_tier: Option<&'static str>,
    pub mime_type: &'static str,
}

pub fn to_imagen(request: &CanonicalRequest, model: &ModelCapabilityDescriptor) -> ImagenParams {
    let quality_tier = imagen_quality_tier(request.quality);
    ImagenParams {
        model: model.native_model_for_tier(quality_tier).to_string(),
        aspect_ratio: imagen_aspect_ratio(request.size),
        quality_tier,
        mime_type: request.output_format.mime_type(),
    }
}

/// Parameters an image was actually produced with, in canonical terms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedParameters {
    pub size: ImageSize,
    pub quality: Quality,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<Style>,
    pub output_format: OutputFormat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background: Option<Background>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub moderation: Option<Moderation>,
}

/// Canonicalize what the provider reports, falling back to what was asked.
pub fn resolve_parameters(
    kind: ProviderKind,
    request: &CanonicalRequest,
    reported: &ReportedParameters,
) -> ResolvedParameters {
    let (size, quality) = match kind {
        ProviderKind::OpenAi => (
            reported.size.as_deref().and_then(|s| s.parse().ok()),
            reported.quality.as_deref().and_then(|q| q.parse().ok()),
        ),
        ProviderKind::Imagen => (
            reported.aspect_ratio.as_deref().and_then(size_from_imagen_aspect_ratio),
            reported.quality.as_deref().and_then(quality_from_imagen_tier),
        ),
    };
    let output_format = reported
        .output_format
        .as_deref()
        .and_then(|f| f.parse().ok())
        .or_else(|| reported.mime_type.as_deref().and_then(OutputFormat::from_mime));
    let background = reported.background.as_deref().and_then(|b| b.parse().ok());

    ResolvedParameters {
        size: size.unwrap_or(request.size),
        quality: quality.unwrap_or(request.quality),
        style: request.style,
        output_format: output_format.unwrap_or(request.output_format),
        background: background.or(request.background),
        moderation: request.moderation,
    }
}
