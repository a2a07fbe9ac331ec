use rand::Rng;

/// Who this process is on the shared network. Created once at orchestrator
/// construction and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    pub peer_id: String,
    pub display_name: String,
}

impl LocalIdentity {
    /// Generates a fresh `peer-<hex>` id for the given display name.
    pub fn generate(display_name: impl Into<String>) -> Self {
        Self {
            peer_id: tagged_id("peer"),
            display_name: display_name.into(),
        }
    }

    /// Builds an identity from a caller-supplied peer id. Useful when the id
    /// must be stable across runs (or deterministic in tests).
    pub fn new(peer_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            display_name: display_name.into(),
        }
    }
}

/// `<tag>-<16 hex chars>`. Ids are compared lexicographically for the glare
/// tie-break, so all that matters is that they are unique and ordered.
pub(crate) fn tagged_id(tag: &str) -> String {
    format!("{}-{}", tag, hex::encode(rand::rng().random::<[u8; 8]>()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_carry_tag_and_hex_suffix() {
        let id = tagged_id("peer");
        assert!(id.starts_with("peer-"));
        let suffix = &id["peer-".len()..];
        assert_eq!(suffix.len(), 16);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn generated_ids_are_unique() {
        let a = LocalIdentity::generate("a");
        let b = LocalIdentity::generate("b");
        assert_ne!(a.peer_id, b.peer_id);
    }
}
