//! Per-endpoint options: pooling, description, metadata

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum metadata length in characters, as enforced by ngrok
pub const MAX_METADATA_CHARS: usize = 4096;

/// Maximum description length in characters
pub const MAX_DESCRIPTION_CHARS: usize = 256;

/// Options the user attaches to one endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointOptions {
    /// Load balance traffic across endpoints sharing the same URL
    pub pooling_enabled: bool,
    /// Human readable description
    pub description: String,
    /// Opaque user data forwarded verbatim (often JSON, never parsed)
    pub metadata: String,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("metadata is {len} characters, the limit is {max}")]
    MetadataTooLong { len: usize, max: usize },

    #[error("description is {len} characters, the limit is {max}")]
    DescriptionTooLong { len: usize, max: usize },
}

/// Every violation found in one set of options
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid endpoint options: {}", join_errors(.0))]
pub struct ValidationErrors(pub Vec<ValidationError>);

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl EndpointOptions {
    pub fn new(
        pooling_enabled: bool,
        description: impl Into<String>,
        metadata: impl Into<String>,
    ) -> Self {
        Self {
            pooling_enabled,
            description: description.into(),
            metadata: metadata.into(),
        }
    }

    /// Trim the description; metadata is kept byte for byte
    pub fn normalized(mut self) -> Self {
        let trimmed = self.description.trim();
        if trimmed.len() != self.description.len() {
            self.description = trimmed.to_string();
        }
        self
    }
}

/// Check option limits; lengths are counted in characters, not bytes
pub fn validate(options: &EndpointOptions) -> std::result::Result<(), ValidationErrors> {
    let mut errors = Vec::new();

    let metadata_len = options.metadata.chars().count();
    if metadata_len > MAX_METADATA_CHARS {
        errors.push(ValidationError::MetadataTooLong {
            len: metadata_len,
            max: MAX_METADATA_CHARS,
        });
    }

    let description_len = options.description.chars().count();
    if description_len > MAX_DESCRIPTION_CHARS {
        errors.push(ValidationError::DescriptionTooLong {
            len: description_len,
            max: MAX_DESCRIPTION_CHARS,
        });
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ValidationErrors(errors))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(validate(&EndpointOptions::default()).is_ok());
    }

    #[test]
    fn test_metadata_limit_is_inclusive() {
        let at_limit = EndpointOptions::new(false, "", "x".repeat(MAX_METADATA_CHARS));
        assert!(validate(&at_limit).is_ok());

        let over = EndpointOptions::new(false, "", "x".repeat(MAX_METADATA_CHARS + 1));
        let err = validate(&over).unwrap_err();
        assert_eq!(
            err.0,
            vec![ValidationError::MetadataTooLong {
                len: MAX_METADATA_CHARS + 1,
                max: MAX_METADATA_CHARS
            }]
        );
    }

    #[test]
    fn test_lengths_count_characters_not_bytes() {
        // 4096 two-byte characters is 8192 bytes but still within the limit
        let wide = EndpointOptions::new(false, "é".repeat(256), "é".repeat(MAX_METADATA_CHARS));
        assert!(validate(&wide).is_ok());
    }

    #[test]
    fn test_reports_every_violation() {
        let bad = EndpointOptions::new(
            true,
            "d".repeat(MAX_DESCRIPTION_CHARS + 1),
            "m".repeat(MAX_METADATA_CHARS + 10),
        );
        let err = validate(&bad).unwrap_err();
        assert_eq!(err.0.len(), 2);
        let msg = err.to_string();
        assert!(msg.contains("metadata is 4106 characters"));
        assert!(msg.contains("description is 257 characters"));
    }

    #[test]
    fn test_invalid_json_metadata_is_accepted() {
        let opts = EndpointOptions::new(false, "", r#"{"container": "nginx", "#);
        assert!(validate(&opts).is_ok());
    }

    #[test]
    fn test_normalized_trims_description_only() {
        let opts = EndpointOptions::new(false, "  nginx endpoint \n", "  {\"a\":1} ").normalized();
        assert_eq!(opts.description, "nginx endpoint");
        assert_eq!(opts.metadata, "  {\"a\":1} ");
    }
}
