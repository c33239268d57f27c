use serde::{Deserialize, Serialize};
use std::fmt;

/// Which kind of provider an entity was discovered on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Messaging,
    Web,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Messaging => "messaging",
            SourceKind::Web => "web",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "messaging" | "telegram" => Some(SourceKind::Messaging),
            "web" => Some(SourceKind::Web),
            _ => None,
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A discoverable channel or page.
///
/// `canonical_id` is the dedup key (channel username or normalised URL) and
/// never changes once the entity has been discovered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    canonical_id: String,
    pub display_title: Option<String>,
    pub source_kind: SourceKind,
    /// Numeric id assigned by the provider, when it exposes one.
    pub provider_id: Option<i64>,
}

impl Entity {
    pub fn new(canonical_id: impl Into<String>, source_kind: SourceKind) -> Self {
        Self {
            canonical_id: canonical_id.into(),
            display_title: None,
            source_kind,
            provider_id: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.display_title = Some(title.into());
        self
    }

    pub fn with_provider_id(mut self, id: i64) -> Self {
        self.provider_id = Some(id);
        self
    }

    pub fn canonical_id(&self) -> &str {
        &self.canonical_id
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source_kind, self.canonical_id)
    }
}
