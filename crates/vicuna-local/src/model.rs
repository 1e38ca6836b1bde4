//! Model identifiers understood by the session.

use std::fmt;

use crate::error::{Result, VicunaError};

/// Identifier of the model weights a session runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum ModelId {
    /// ggml-vicuna-7b-4bit-rev1
    #[default]
    Vicuna7B,
    /// ggml-vicuna-13b-4bit-rev1
    Vicuna13B,
    /// Any other weights file, accepted only when validation is waived.
    Custom(String),
}

impl ModelId {
    /// Models known to work with the bundled executable.
    pub fn supported() -> [ModelId; 2] {
        [ModelId::Vicuna7B, ModelId::Vicuna13B]
    }

    /// Parse an identifier.
    ///
    /// Unknown identifiers fail with [`VicunaError::UnsupportedModel`] unless
    /// `allow_unsupported` is set, in which case they become [`ModelId::Custom`].
    pub fn parse(id: &str, allow_unsupported: bool) -> Result<Self> {
        let id = id.trim();
        if let Some(known) = Self::supported().into_iter().find(|m| m.as_str() == id) {
            return Ok(known);
        }

        if allow_unsupported && !id.is_empty() {
            return Ok(ModelId::Custom(id.to_string()));
        }

        Err(VicunaError::UnsupportedModel {
            model: id.to_string(),
            supported: Self::supported()
                .iter()
                .map(ModelId::as_str)
                .collect::<Vec<_>>()
                .join(", "),
        })
    }

    /// The identifier as it appears in file names and download URLs.
    pub fn as_str(&self) -> &str {
        match self {
            ModelId::Vicuna7B => "ggml-vicuna-7b-4bit-rev1",
            ModelId::Vicuna13B => "ggml-vicuna-13b-4bit-rev1",
            ModelId::Custom(id) => id,
        }
    }

    /// Whether this is one of the supported models.
    pub fn is_supported(&self) -> bool {
        !matches!(self, ModelId::Custom(_))
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
