use serde::{Deserialize, Serialize};

/// How two resourceVersion tokens are compared.
///
/// The store only promises equality semantics. Kubernetes happens to hand out
/// etcd revisions, so ordering can be recovered when both tokens are plain
/// unsigned integers; anything else falls back to equality.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum VersionOrdering {
    /// Tokens are opaque; any difference is a change.
    Opaque,
    /// Numeric ordering when both tokens parse as `u64`, equality otherwise.
    #[default]
    Numeric,
}

impl VersionOrdering {
    /// Whether `observed` is a change relative to the `recorded` token.
    /// Older or equal numeric versions are not.
    pub fn supersedes(&self, observed: &str, recorded: &str) -> bool {
        match self {
            VersionOrdering::Opaque => observed != recorded,
            VersionOrdering::Numeric => match (observed.parse::<u64>(), recorded.parse::<u64>()) {
                (Ok(o), Ok(r)) => o > r,
                _ => observed != recorded,
            },
        }
    }
}

impl std::str::FromStr for VersionOrdering {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "opaque" | "equality" => Ok(VersionOrdering::Opaque),
            "numeric" => Ok(VersionOrdering::Numeric),
            other => Err(format!("unknown version ordering: {other} (expect numeric or opaque)")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opaque_tokens_compare_by_equality() {
        let o = VersionOrdering::Opaque;
        assert!(!o.supersedes("v1", "v1"));
        assert!(o.supersedes("v2", "v1"));
        // no ordering: an "older" token is still a change
        assert!(o.supersedes("9", "10"));
    }

    #[test]
    fn numeric_tokens_are_ordered() {
        let n = VersionOrdering::Numeric;
        assert!(n.supersedes("11", "10"));
        assert!(!n.supersedes("10", "10"));
        assert!(!n.supersedes("9", "10"));
    }

    #[test]
    fn non_numeric_tokens_fall_back_to_equality() {
        let n = VersionOrdering::Numeric;
        assert!(n.supersedes("v2", "v1"));
        assert!(!n.supersedes("v1", "v1"));
        assert!(n.supersedes("10", "v1"));
    }

    #[test]
    fn parses_from_env_strings() {
        assert_eq!("numeric".parse::<VersionOrdering>().unwrap(), VersionOrdering::Numeric);
        assert_eq!("Opaque".parse::<VersionOrdering>().unwrap(), VersionOrdering::Opaque);
        assert!("lexical".parse::<VersionOrdering>().is_err());
    }
}
