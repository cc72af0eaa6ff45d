use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;

use crate::llm::media::{GeneratedImage, SourceImage};
use crate::studio::error::GenerationError;
use crate::studio::theme::Theme;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QualityMode {
    #[default]
    Standard,
    HighQuality,
}

impl QualityMode {
    pub fn as_str(self) -> &'static str {
        match self {
            QualityMode::Standard => "standard",
            QualityMode::HighQuality => "high",
        }
    }
}

impl fmt::Display for QualityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QualityMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "standard" | "std" => Ok(QualityMode::Standard),
            "high" | "hq" | "high-quality" | "high_quality" => Ok(QualityMode::HighQuality),
            other => Err(format!("unknown quality mode '{other}'")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub theme: Theme,
    pub prompt: String,
    pub source: Arc<SourceImage>,
    pub quality: QualityMode,
}

/// The remote rendering backend. One call renders one theme.
#[async_trait]
pub trait ImageGenerator: Send + Sync {
    async fn generate(&self, request: GenerationRequest) -> Result<GeneratedImage, GenerationError>;
}
