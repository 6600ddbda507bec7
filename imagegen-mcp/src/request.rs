//! Canonical image requests.
//!
//! Tool arguments arrive as loosely typed strings. [`CanonicalRequest::build`]
//! resolves them against the chosen model's capabilities and the configured
//! defaults, producing the normalized request that the fingerprint, the cache
//! and every provider adapter work from.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use imagegen_mcp_common::config::ImageDefaults;
use imagegen_mcp_common::error::Error;
use imagegen_mcp_common::models::ModelCapabilityDescriptor;
use imagegen_mcp_common::params::{
    Background, ImageSize, Moderation, Operation, OutputFormat, ParseParamError, Quality, Style,
};
use std::fmt;
use std::str::FromStr;

/// Caller-supplied parameters, before defaults and validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageRequest {
    pub operation: Operation,
    pub prompt: String,
    pub model: Option<String>,
    pub size: Option<String>,
    pub quality: Option<String>,
    pub style: Option<String>,
    pub output_format: Option<String>,
    pub background: Option<String>,
    pub moderation: Option<String>,
    /// Source image for edits, base64 or a `data:` URL
    pub image_data: Option<String>,
    /// Optional edit mask, base64 or a `data:` URL
    pub mask_data: Option<String>,
}

impl ImageRequest {
    /// A generation request with every optional parameter unset.
    pub fn generate(prompt: impl Into<String>) -> Self {
        Self {
            operation: Operation::Generate,
            prompt: prompt.into(),
            model: None,
            size: None,
            quality: None,
            style: None,
            output_format: None,
            background: None,
            moderation: None,
            image_data: None,
            mask_data: None,
        }
    }

    /// An edit request for the given source image.
    pub fn edit(prompt: impl Into<String>, image_data: impl Into<String>) -> Self {
        Self {
            operation: Operation::Edit,
            image_data: Some(image_data.into()),
            ..Self::generate(prompt)
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

/// Validation error details for a request field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// The field that failed validation.
    pub field: String,
    /// Description of the validation failure.
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl From<ParseParamError> for ValidationError {
    fn from(err: ParseParamError) -> Self {
        ValidationError::new(err.field, err.to_string())
    }
}

/// Fold a list of validation errors into one error naming the first field.
pub fn validation_failure(errors: Vec<ValidationError>) -> Error {
    let field = errors
        .first()
        .map(|e| e.field.clone())
        .unwrap_or_else(|| "request".to_string());
    let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
    Error::validation(field, messages.join("; "))
}

/// A fully resolved request. Every field the model supports has a value.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalRequest {
    pub operation: Operation,
    pub prompt: String,
    /// Resolved model id (never an alias)
    pub model_id: String,
    pub size: ImageSize,
    pub quality: Quality,
    /// `None` when the model has no style control
    pub style: Option<Style>,
    pub output_format: OutputFormat,
    /// `None` when the model has no background control
    pub background: Option<Background>,
    /// `None` when the model has no moderation control
    pub moderation: Option<Moderation>,
    pub source_image: Option<Vec<u8>>,
    pub mask: Option<Vec<u8>>,
}

fn parse_opt<T>(value: Option<&str>, errors: &mut Vec<ValidationError>) -> Option<T>
where
    T: FromStr<Err = ParseParamError>,
{
    let raw = value.map(str::trim).filter(|v| !v.is_empty())?;
    match raw.parse() {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            errors.push(ValidationError::from(e));
            None
        }
    }
}

/// Pick a value for a parameter every model must support.
///
/// An explicit value must be supported. A default the model lacks falls
/// back to `Auto`-like preferred values, then the model's first option.
fn pick_supported<T: Copy + PartialEq + fmt::Display>(
    field: &str,
    explicit: Option<T>,
    default: T,
    supported: &[T],
    preferred: &[T],
    model_id: &str,
    errors: &mut Vec<ValidationError>,
) -> Option<T> {
    if let Some(value) = explicit {
        if supported.contains(&value) {
            return Some(value);
        }
        let options: Vec<String> = supported.iter().map(|v| v.to_string()).collect();
        errors.push(ValidationError::new(
            field,
            format!(
                "'{value}' is not supported by model '{model_id}'. Supported: {}",
                options.join(", ")
            ),
        ));
        return None;
    }
    if supported.contains(&default) {
        return Some(default);
    }
    preferred
        .iter()
        .find(|p| supported.contains(*p))
        .or_else(|| supported.first())
        .copied()
}

/// Resolve a parameter only some models expose.
///
/// `neutral` is the value that means "no preference", which is accepted
/// (and dropped) on models without the control.
fn pick_optional<T: Copy + PartialEq + fmt::Display>(
    field: &str,
    explicit: Option<T>,
    default: T,
    neutral: Option<T>,
    supported: bool,
    model_id: &str,
    errors: &mut Vec<ValidationError>,
) -> Option<T> {
    match (explicit, supported) {
        (Some(value), true) => Some(value),
        (None, true) => Some(default),
        (Some(value), false) if Some(value) == neutral => None,
        (Some(value), false) => {
            errors.push(ValidationError::new(
                field,
                format!("model '{model_id}' does not support {field} (got '{value}')"),
            ));
            None
        }
        (None, false) => None,
    }
}

/// Decode base64 image input, accepting `data:<mime>;base64,` prefixes.
pub fn decode_image_input(field: &str, input: &str) -> Result<Vec<u8>, ValidationError> {
    let trimmed = input.trim();
    let payload = match trimmed.strip_prefix("data:") {
        Some(rest) => rest
            .split_once(',')
            .map(|(_, data)| data)
            .ok_or_else(|| ValidationError::new(field, "malformed data URL"))?,
        None => trimmed,
    };
    let compact: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.is_empty() {
        return Err(ValidationError::new(field, "image data cannot be empty"));
    }
    BASE64
        .decode(compact.as_bytes())
        .map_err(|e| ValidationError::new(field, format!("invalid base64 image data: {e}")))
}

impl CanonicalRequest {
    /// Validate `request` against `model` and fill in defaults.
    ///
    /// # Returns
    /// - `Ok(CanonicalRequest)` when every parameter is acceptable
    /// - `Err(Vec<ValidationError>)` with all validation errors
    pub fn build(
        request: &ImageRequest,
        model: &ModelCapabilityDescriptor,
        defaults: &ImageDefaults,
    ) -> Result<Self, Vec<ValidationError>> {
        let mut errors = Vec::new();
        let model_id = model.model_id.as_str();

        let prompt = request.prompt.trim().to_string();
        if prompt.is_empty() {
            errors.push(ValidationError::new("prompt", "Prompt cannot be empty"));
        } else {
            let length = prompt.chars().count();
            if length > model.max_prompt_length {
                errors.push(ValidationError::new(
                    "prompt",
                    format!(
                        "Prompt length {length} exceeds maximum {} for model {model_id}",
                        model.max_prompt_length
                    ),
                ));
            }
        }

        let size = parse_opt::<ImageSize>(request.size.as_deref(), &mut errors);
        let quality = parse_opt::<Quality>(request.quality.as_deref(), &mut errors);
        let style = parse_opt::<Style>(request.style.as_deref(), &mut errors);
        let output_format =
            parse_opt::<OutputFormat>(request.output_format.as_deref(), &mut errors);
        let background = parse_opt::<Background>(request.background.as_deref(), &mut errors);
        let moderation = parse_opt::<Moderation>(request.moderation.as_deref(), &mut errors);

        let size = pick_supported(
            "size",
            size,
            defaults.size,
            &model.supported_sizes,
            &[ImageSize::Auto, ImageSize::Square],
            model_id,
            &mut errors,
        );
        let quality = pick_supported(
            "quality",
            quality,
            defaults.quality,
            &model.supported_qualities,
            &[Quality::Auto],
            model_id,
            &mut errors,
        );
        let output_format = pick_supported(
            "output_format",
            output_format,
            defaults.output_format,
            &model.supported_formats,
            &[OutputFormat::Png],
            model_id,
            &mut errors,
        );
        let style = pick_optional(
            "style",
            style,
            defaults.style,
            None,
            model.supports_style,
            model_id,
            &mut errors,
        );
        let background = pick_optional(
            "background",
            background,
            defaults.background,
            Some(Background::Auto),
            model.supports_background,
            model_id,
            &mut errors,
        );
        let moderation = pick_optional(
            "moderation",
            moderation,
            defaults.moderation,
            Some(Moderation::Auto),
            model.supports_moderation,
            model_id,
            &mut errors,
        );

        if let (Some(Background::Transparent), Some(format)) = (background, output_format) {
            if !format.supports_transparency() {
                errors.push(ValidationError::new(
                    "background",
                    format!("transparent background requires png or webp output, not {format}"),
                ));
            }
        }

        let (source_image, mask) = match request.operation {
            Operation::Generate => {
                if request.image_data.is_some() || request.mask_data.is_some() {
                    errors.push(ValidationError::new(
                        "image_data",
                        "source images are only accepted for edits",
                    ));
                }
                (None, None)
            }
            Operation::Edit => {
                let source = match request.image_data.as_deref() {
                    Some(data) => decode_image_input("image_data", data)
                        .map_err(|e| errors.push(e))
                        .ok(),
                    None => {
                        errors.push(ValidationError::new(
                            "image_data",
                            "an edit requires a source image",
                        ));
                        None
                    }
                };
                let mask = request.mask_data.as_deref().and_then(|data| {
                    decode_image_input("mask_data", data)
                        .map_err(|e| errors.push(e))
                        .ok()
                });
                (source, mask)
            }
        };

        match (size, quality, output_format) {
            (Some(size), Some(quality), Some(output_format)) if errors.is_empty() => Ok(Self {
                operation: request.operation,
                prompt,
                model_id: model.model_id.clone(),
                size,
                quality,
                style,
                output_format,
                background,
                moderation,
                source_image,
                mask,
            }),
            _ => Err(errors),
        }
    }
}
