use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

/// Provenance namespace of a stateful record. `World` is reserved for a
/// future shared-world layer and never produced by this engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Origin {
    Pack,
    Campaign,
    World,
}

/// A namespaced identifier, `{origin}:{local_id}`. Ids are plain strings in
/// storage and in LLM traffic; this wrapper only guarantees the prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(String);

impl Id {
    pub fn new(origin: Origin, local: &str) -> Self {
        Id(format!("{origin}:{local}"))
    }

    /// Accepts an already-namespaced id verbatim, otherwise prefixes it
    /// with the given origin. Narrator-introduced local ids go through here
    /// at commit time.
    pub fn namespaced(raw: &str, default_origin: Origin) -> Self {
        match raw.split_once(':') {
            Some((prefix, _)) if prefix.parse::<Origin>().is_ok() => Id(raw.to_string()),
            _ => Id::new(default_origin, raw),
        }
    }

    pub fn origin(&self) -> Option<Origin> {
        self.0.split_once(':')?.0.parse().ok()
    }

    pub fn local(&self) -> &str {
        self.0.split_once(':').map(|(_, l)| l).unwrap_or(&self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Id {
    fn from(raw: &str) -> Self {
        Id(raw.to_string())
    }
}

impl From<String> for Id {
    fn from(raw: String) -> Self {
        Id(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespacing_leaves_qualified_ids_alone() {
        let id = Id::namespaced("pack:neon_quarter", Origin::Campaign);
        assert_eq!(id.as_str(), "pack:neon_quarter");
        assert_eq!(id.origin(), Some(Origin::Pack));
    }

    #[test]
    fn namespacing_prefixes_bare_ids() {
        let id = Id::namespaced("dead_courier", Origin::Campaign);
        assert_eq!(id.as_str(), "campaign:dead_courier");
        assert_eq!(id.local(), "dead_courier");
    }

    #[test]
    fn unknown_prefix_is_treated_as_local_text() {
        // "viktor:the_fence" is a display name quirk, not a namespace.
        let id = Id::namespaced("viktor:the_fence", Origin::Campaign);
        assert_eq!(id.as_str(), "campaign:viktor:the_fence");
    }
}
