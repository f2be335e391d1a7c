//! Tag vocabulary persisted on watched objects (as annotations).
//!
//! These keys are a stable contract with the people writing primaries and secondaries.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Payload encoding of a target: `raw`, `json` or `yaml`. Absent means raw.
pub const KIND: &str = "kmerge.io/type";
/// Presence marks the primary (merge destination).
pub const PRIMARY: &str = "kmerge.io/primary";
/// Logical name shared by a primary and its secondaries.
pub const NAME: &str = "kmerge.io/name";
/// Comma separated namespaces a primary collects secondaries from. Absent or empty means all.
pub const FROM_NAMESPACES: &str = "namespace.kmerge.io/from";
/// Reserved. Nothing reads it yet.
pub const TO_NAMESPACES: &str = "namespace.kmerge.io/to";
/// Hex digest of the last merged payload, written by the pipeline only.
pub const HASH: &str = "kmerge.io/hash";

/// Declared payload encoding, selecting the merge strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    #[default]
    Raw,
    Json,
    Yaml,
}

#[derive(Debug, thiserror::Error)]
#[error("unknown merge kind: {0} (expect raw, json or yaml)")]
pub struct UnknownKind(pub String);

impl Kind {
    pub const ALL: [Kind; 3] = [Kind::Raw, Kind::Json, Kind::Yaml];

    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Raw => "raw",
            Kind::Json => "json",
            Kind::Yaml => "yaml",
        }
    }

    /// Resolve the kind tag of an object. Absent, empty and unrecognised values all map to raw;
    /// the last one is logged.
    pub fn from_tag(value: Option<&str>) -> Kind {
        match value.map(str::trim) {
            None | Some("") => Kind::Raw,
            Some(v) => v.parse().unwrap_or_else(|e: UnknownKind| {
                warn!(error = %e, "falling back to raw merge");
                Kind::Raw
            }),
        }
    }
}

impl FromStr for Kind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            // "text" is what older primaries carry
            "raw" | "text" => Ok(Kind::Raw),
            "json" => Ok(Kind::Json),
            "yaml" | "yml" => Ok(Kind::Yaml),
            _ => Err(UnknownKind(s.to_string())),
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parse the source namespace filter tag. Items are trimmed and empty items dropped, so an
/// empty set means "all namespaces".
pub fn parse_namespace_filter(value: Option<&str>) -> BTreeSet<String> {
    value
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_tag_defaults_to_raw() {
        assert_eq!(Kind::from_tag(None), Kind::Raw);
        assert_eq!(Kind::from_tag(Some("  ")), Kind::Raw);
        assert_eq!(Kind::from_tag(Some("toml")), Kind::Raw);
        assert_eq!(Kind::from_tag(Some("text")), Kind::Raw);
        assert_eq!(Kind::from_tag(Some("JSON")), Kind::Json);
        assert_eq!(Kind::from_tag(Some("yaml")), Kind::Yaml);
    }

    #[test]
    fn kind_display_parses_back() {
        for k in Kind::ALL {
            assert_eq!(k.to_string().parse::<Kind>().unwrap(), k);
        }
        assert!("xml".parse::<Kind>().is_err());
    }

    #[test]
    fn namespace_filter_trims_and_skips_empty_items() {
        let f = parse_namespace_filter(Some(" ns1, ns2 ,,ns1"));
        assert_eq!(f.into_iter().collect::<Vec<_>>(), vec!["ns1".to_string(), "ns2".to_string()]);
        assert!(parse_namespace_filter(None).is_empty());
        assert!(parse_namespace_filter(Some(" , ")).is_empty());
    }
}
