use serde::{Deserialize, Serialize};

/// Provider-agnostic model alias accepted on every inbound request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ModelAlias {
    Haiku,
    Sonnet,
    Opus,
}

impl ModelAlias {
    pub fn as_str(self) -> &'static str {
        match self {
            ModelAlias::Haiku => "haiku",
            ModelAlias::Sonnet => "sonnet",
            ModelAlias::Opus => "opus",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "haiku" => Some(ModelAlias::Haiku),
            "sonnet" => Some(ModelAlias::Sonnet),
            "opus" => Some(ModelAlias::Opus),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub display_name: String,
    pub context_window: usize,
}
