//! Model capability descriptors and the built-in model catalog.
//!
//! A descriptor states what a model accepts (sizes, quality tiers, formats and
//! optional flags) so requests can be validated before any provider is called.
//! Descriptors are either the built-in set below or loaded at startup from a
//! directory of JSON files, one descriptor per file.

use crate::error::ConfigError;
use crate::params::{ImageSize, Operation, OutputFormat, Quality};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Provider id of the OpenAI-style adapter.
pub const OPENAI_PROVIDER: &str = "openai";

/// Provider id of the Imagen-style adapter.
pub const GEMINI_PROVIDER: &str = "gemini";

/// Default prompt length limit for descriptors that do not state one.
pub const DEFAULT_MAX_PROMPT_LENGTH: usize = 4000;

/// What a model can do, keyed by its public model id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelCapabilityDescriptor {
    /// Public model id used in requests
    pub model_id: String,
    /// Owning provider id
    pub provider_id: String,
    /// Model name sent to the provider
    pub native_id: String,
    /// Alternative names accepted for `model_id`
    #[serde(default)]
    pub aliases: Vec<String>,
    /// Short description for listings
    #[serde(default)]
    pub description: String,
    pub supported_sizes: Vec<ImageSize>,
    pub supported_qualities: Vec<Quality>,
    pub supported_formats: Vec<OutputFormat>,
    #[serde(default)]
    pub supports_style: bool,
    #[serde(default)]
    pub supports_background: bool,
    #[serde(default)]
    pub supports_editing: bool,
    #[serde(default)]
    pub supports_moderation: bool,
    /// Maximum prompt length in characters
    #[serde(default = "default_max_prompt_length")]
    pub max_prompt_length: usize,
    /// Provider quality tier to native model id, for providers that expose
    /// tiers as separate model variants
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tier_variants: BTreeMap<String, String>,
    pub pricing: Pricing,
}

fn default_max_prompt_length() -> usize {
    DEFAULT_MAX_PROMPT_LENGTH
}

impl ModelCapabilityDescriptor {
    /// Whether `name` is this model's id or one of its aliases.
    pub fn matches(&self, name: &str) -> bool {
        self.model_id == name || self.aliases.iter().any(|a| a == name)
    }

    pub fn supports_size(&self, size: ImageSize) -> bool {
        self.supported_sizes.contains(&size)
    }

    pub fn supports_quality(&self, quality: Quality) -> bool {
        self.supported_qualities.contains(&quality)
    }

    pub fn supports_format(&self, format: OutputFormat) -> bool {
        self.supported_formats.contains(&format)
    }

    /// Whether the model can perform the operation at all.
    pub fn supports_operation(&self, operation: Operation) -> bool {
        match operation {
            Operation::Generate => true,
            Operation::Edit => self.supports_editing,
        }
    }

    /// Native model id for a provider tier, falling back to `native_id`.
    pub fn native_model_for_tier(&self, tier: Option<&str>) -> &str {
        tier.and_then(|t| self.tier_variants.get(t))
            .map(String::as_str)
            .unwrap_or(&self.native_id)
    }

    /// Check the descriptor is usable.
    pub fn check(&self) -> Result<(), String> {
        if self.model_id.trim().is_empty() {
            return Err("model_id is empty".to_string());
        }
        if self.provider_id.trim().is_empty() {
            return Err(format!("{}: provider_id is empty", self.model_id));
        }
        if self.native_id.trim().is_empty() {
            return Err(format!("{}: native_id is empty", self.model_id));
        }
        if self.supported_sizes.is_empty() {
            return Err(format!("{}: supported_sizes is empty", self.model_id));
        }
        if self.supported_qualities.is_empty() {
            return Err(format!("{}: supported_qualities is empty", self.model_id));
        }
        if self.supported_formats.is_empty() {
            return Err(format!("{}: supported_formats is empty", self.model_id));
        }
        Ok(())
    }
}

// =============================================================================
// Pricing
// =============================================================================

/// How a model is billed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Pricing {
    /// Flat price per image.
    PerImage { usd: f64 },
    /// Token-metered pricing.
    Tokens {
        /// USD per million text input tokens
        text_input_per_million: f64,
        /// USD per million image output tokens
        image_output_per_million: f64,
        /// Output tokens billed for one image
        tokens_per_image: u64,
    },
}

/// Usage counters reported by a provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u64>,
}

/// Estimated cost of one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostEstimate {
    pub estimated_cost_usd: f64,
    /// "per_image", "reported_tokens" or "estimated_tokens"
    pub basis: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
}

/// Rough token count for a prompt.
fn approximate_text_tokens(prompt: &str) -> u64 {
    let words = prompt.split_whitespace().count() as f64;
    (words * 1.3).ceil() as u64
}

fn round_usd(value: f64) -> f64 {
    (value * 1_000_000.0).round() / 1_000_000.0
}

impl Pricing {
    /// Estimate the cost of producing `images` images for `prompt`.
    ///
    /// Token pricing prefers the provider's reported counters and falls back
    /// to approximating from the prompt.
    ///
    /// # Example
    ///
    /// ```
    /// use imagegen_mcp_common::models::Pricing;
    ///
    /// let pricing = Pricing::PerImage { usd: 0.04 };
    /// let cost = pricing.estimate("a red fox", 2, None);
    /// assert!((cost.estimated_cost_usd - 0.08).abs() < 1e-9);
    /// ```
    pub fn estimate(&self, prompt: &str, images: u32, usage: Option<&TokenUsage>) -> CostEstimate {
        match *self {
            Pricing::PerImage { usd } => CostEstimate {
                estimated_cost_usd: round_usd(usd * f64::from(images)),
                basis: "per_image".to_string(),
                input_tokens: None,
                output_tokens: None,
            },
            Pricing::Tokens {
                text_input_per_million,
                image_output_per_million,
                tokens_per_image,
            } => {
                let reported = usage.and_then(|u| u.input_tokens.zip(u.output_tokens));
                let (input, output, basis) = match reported {
                    Some((input, output)) => (input, output, "reported_tokens"),
                    None => (
                        approximate_text_tokens(prompt),
                        tokens_per_image * u64::from(images),
                        "estimated_tokens",
                    ),
                };
                let cost = input as f64 * text_input_per_million / 1_000_000.0
                    + output as f64 * image_output_per_million / 1_000_000.0;
                CostEstimate {
                    estimated_cost_usd: round_usd(cost),
                    basis: basis.to_string(),
                    input_tokens: Some(input),
                    output_tokens: Some(output),
                }
            }
        }
    }
}

// =============================================================================
// Built-in Model Definitions
// =============================================================================

/// OpenAI GPT Image 1.
pub const GPT_IMAGE_1: &str = "gpt-image-1";

/// Imagen 4 on Vertex AI.
pub const IMAGEN_4: &str = "imagen-4";

/// Imagen 3 on Vertex AI.
pub const IMAGEN_3: &str = "imagen-3";

const STANDARD_SIZES: &[ImageSize] = &[
    ImageSize::Auto,
    ImageSize::Square,
    ImageSize::Landscape,
    ImageSize::Portrait,
];

fn gpt_image_1() -> ModelCapabilityDescriptor {
    ModelCapabilityDescriptor {
        model_id: GPT_IMAGE_1.to_string(),
        provider_id: OPENAI_PROVIDER.to_string(),
        native_id: "gpt-image-1".to_string(),
        aliases: vec!["gpt-image".to_string()],
        description: "OpenAI GPT Image 1: generation and mask-based editing".to_string(),
        supported_sizes: STANDARD_SIZES.to_vec(),
        supported_qualities: Quality::ALL.to_vec(),
        supported_formats: OutputFormat::ALL.to_vec(),
        supports_style: true,
        supports_background: true,
        supports_editing: true,
        supports_moderation: true,
        max_prompt_length: 32000,
        tier_variants: BTreeMap::new(),
        pricing: Pricing::Tokens {
            text_input_per_million: 5.0,
            image_output_per_million: 40.0,
            tokens_per_image: 1750,
        },
    }
}

fn imagen_4() -> ModelCapabilityDescriptor {
    ModelCapabilityDescriptor {
        model_id: IMAGEN_4.to_string(),
        provider_id: GEMINI_PROVIDER.to_string(),
        native_id: "imagen-4.0-generate-001".to_string(),
        aliases: vec!["imagen_4".to_string(), "imagen-4.0".to_string(), "imagen4".to_string()],
        description: "Google Imagen 4 on Vertex AI".to_string(),
        supported_sizes: STANDARD_SIZES.to_vec(),
        supported_qualities: Quality::ALL.to_vec(),
        supported_formats: vec![OutputFormat::Png, OutputFormat::Jpeg],
        supports_style: false,
        supports_background: false,
        supports_editing: false,
        supports_moderation: false,
        max_prompt_length: 2000,
        tier_variants: BTreeMap::from([
            ("premium".to_string(), "imagen-4.0-ultra-generate-001".to_string()),
            ("standard".to_string(), "imagen-4.0-generate-001".to_string()),
            ("fast".to_string(), "imagen-4.0-fast-generate-001".to_string()),
        ]),
        pricing: Pricing::PerImage { usd: 0.04 },
    }
}

fn imagen_3() -> ModelCapabilityDescriptor {
    ModelCapabilityDescriptor {
        model_id: IMAGEN_3.to_string(),
        provider_id: GEMINI_PROVIDER.to_string(),
        native_id: "imagen-3.0-generate-002".to_string(),
        aliases: vec!["imagen_3".to_string(), "imagen-3.0".to_string(), "imagen3".to_string()],
        description: "Google Imagen 3 on Vertex AI".to_string(),
        supported_sizes: STANDARD_SIZES.to_vec(),
        supported_qualities: Quality::ALL.to_vec(),
        supported_formats: vec![OutputFormat::Png, OutputFormat::Jpeg],
        supports_style: false,
        supports_background: false,
        supports_editing: false,
        supports_moderation: false,
        max_prompt_length: 480,
        tier_variants: BTreeMap::new(),
        pricing: Pricing::PerImage { usd: 0.02 },
    }
}

/// The built-in catalog.
pub fn builtin_models() -> Vec<ModelCapabilityDescriptor> {
    vec![gpt_image_1(), imagen_4(), imagen_3()]
}

// =============================================================================
// Loading
// =============================================================================

/// Parse one descriptor from JSON.
pub fn descriptor_from_json(
    path: &Path,
    json: &str,
) -> Result<ModelCapabilityDescriptor, ConfigError> {
    let descriptor: ModelCapabilityDescriptor =
        serde_json::from_str(json).map_err(|e| ConfigError::ModelDefinition {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
    descriptor.check().map_err(|message| ConfigError::ModelDefinition {
        path: path.to_path_buf(),
        message,
    })?;
    Ok(descriptor)
}

/// Load every `*.json` file in `dir` as one descriptor, sorted by file name.
pub fn load_model_dir(dir: &Path) -> Result<Vec<ModelCapabilityDescriptor>, ConfigError> {
    let read_err = |path: &Path, e: std::io::Error| ConfigError::ModelDefinition {
        path: path.to_path_buf(),
        message: e.to_string(),
    };

    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(|e| read_err(dir, e))? {
        let path = entry.map_err(|e| read_err(dir, e))?.path();
        if path.extension().is_some_and(|ext| ext == "json") {
            paths.push(path);
        }
    }
    paths.sort();

    let mut descriptors = Vec::with_capacity(paths.len());
    for path in paths {
        let json = std::fs::read_to_string(&path).map_err(|e| read_err(&path, e))?;
        descriptors.push(descriptor_from_json(&path, &json)?);
    }

    if descriptors.is_empty() {
        return Err(ConfigError::ModelDefinition {
            path: dir.to_path_buf(),
            message: "no model definitions found".to_string(),
        });
    }
    Ok(descriptors)
}


#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;

    fn builtin_name_strategy() -> impl Strategy<Value = String> {
        let names: Vec<String> = builtin_models()
            .into_iter()
            .flat_map(|m| {
                let mut all = m.aliases.clone();
                all.push(m.model_id.clone());
                all
            })
            .collect();
        proptest::sample::select(names)
    }

    proptest! {
        /// Every id or alias matches exactly one built-in descriptor.
        #[test]
        fn name_matches_exactly_one_model(name in builtin_name_strategy()) {
            let matching = builtin_models().into_iter().filter(|m| m.matches(&name)).count();
            prop_assert_eq!(matching, 1);
        }

        /// Per-image cost scales linearly with the image count.
        #[test]
        fn per_image_cost_is_linear(usd in 0.001f64..1.0, images in 1u32..10) {
            let pricing = Pricing::PerImage { usd };
            let one = pricing.estimate("p", 1, None).estimated_cost_usd;
            let many = pricing.estimate("p", images, None).estimated_cost_usd;
            prop_assert!((many - one * f64::from(images)).abs() < 1e-5);
        }
    }
}
