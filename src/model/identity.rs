use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::EntityKind;

/// Maximum number of characters of a raw external name kept verbatim.
/// Longer names are truncated and suffixed with 8 hex digits of the full
/// name's hash, bounding the stored name at 99 characters while keeping
/// distinct long names distinct.
const EXTERNAL_NAME_KEEP: usize = 88;
const EXTERNAL_NAME_TRIGGER: usize = 90;

/// Deterministic 256-bit entity identity.
///
/// Computed as SHA-256 over a length-prefixed serialization of the identity
/// tuple `(kind, absolute path, qualified name, start line, end line)` — see
/// [`entity_identity`]. Two runs over the same bytes produce the same id;
/// edits that preserve the tuple preserve the id.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId([u8; 32]);

impl EntityId {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex rendering — the form used in store rows and query output.
    pub fn to_hex(&self) -> String {
        let mut s = String::with_capacity(64);
        for b in self.0 {
            s.push_str(&format!("{:02x}", b));
        }
        s
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Append one field to the hasher as `(u64 big-endian length, bytes)`.
///
/// The length prefix makes the serialization unambiguous: `("ab", "c")` and
/// `("a", "bc")` hash differently even though their concatenations collide.
fn put_field(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_be_bytes());
    hasher.update(bytes);
}

/// Compute the identity of a declared entity from its identity tuple.
///
/// Field order is fixed: kind, absolute file path, fully-qualified name,
/// start line, end line.
pub fn entity_identity(
    kind: EntityKind,
    path: &Path,
    qualified_name: &str,
    start_line: u32,
    end_line: u32,
) -> EntityId {
    let mut hasher = Sha256::new();
    put_field(&mut hasher, kind.as_str().as_bytes());
    put_field(&mut hasher, path.to_string_lossy().as_bytes());
    put_field(&mut hasher, qualified_name.as_bytes());
    put_field(&mut hasher, &start_line.to_be_bytes());
    put_field(&mut hasher, &end_line.to_be_bytes());
    EntityId(hasher.finalize().into())
}

/// Compute the identity of an External placeholder: `(kind, canonical name)`.
///
/// The canonical name is the sanitized form returned by
/// [`sanitize_external_name`], so interning by canonical name and hashing
/// agree on what "the same external" means.
pub fn external_identity(canonical_name: &str) -> EntityId {
    let mut hasher = Sha256::new();
    put_field(&mut hasher, EntityKind::External.as_str().as_bytes());
    put_field(&mut hasher, canonical_name.as_bytes());
    EntityId(hasher.finalize().into())
}

/// Bound an external symbol name for storage.
///
/// Names up to 90 characters pass through unchanged. Longer names (method
/// chains on generated code can run to hundreds of characters) are truncated
/// to 88 characters plus `...` plus the first 8 hex digits of the full
/// name's SHA-256, yielding exactly 99 characters and a vanishing collision
/// probability between distinct raw names.
pub fn sanitize_external_name(raw: &str) -> String {
    let char_count = raw.chars().count();
    if char_count <= EXTERNAL_NAME_TRIGGER {
        return raw.to_owned();
    }
    let truncated: String = raw.chars().take(EXTERNAL_NAME_KEEP).collect();
    let digest = Sha256::digest(raw.as_bytes());
    let suffix: String = digest
        .iter()
        .take(4)
        .map(|b| format!("{:02x}", b))
        .collect();
    format!("{}...{}", truncated, suffix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_identity_is_deterministic() {
        let p = PathBuf::from("/project/src/a.py");
        let a = entity_identity(EntityKind::Function, &p, "f", 1, 3);
        let b = entity_identity(EntityKind::Function, &p, "f", 1, 3);
        assert_eq!(a, b);
    }

    #[test]
    fn test_identity_changes_with_each_tuple_field() {
        let p = PathBuf::from("/project/src/a.py");
        let base = entity_identity(EntityKind::Function, &p, "f", 1, 3);
        assert_ne!(base, entity_identity(EntityKind::Method, &p, "f", 1, 3));
        assert_ne!(
            base,
            entity_identity(EntityKind::Function, &PathBuf::from("/project/src/b.py"), "f", 1, 3)
        );
        assert_ne!(base, entity_identity(EntityKind::Function, &p, "g", 1, 3));
        assert_ne!(base, entity_identity(EntityKind::Function, &p, "f", 2, 3));
        assert_ne!(base, entity_identity(EntityKind::Function, &p, "f", 1, 4));
    }

    #[test]
    fn test_length_prefix_prevents_field_bleed() {
        // Same concatenation, different field boundaries — must not collide.
        let p = PathBuf::from("/p");
        let a = entity_identity(EntityKind::Class, &p, "ab", 1, 1);
        let b = entity_identity(EntityKind::Class, &PathBuf::from("/pa"), "b", 1, 1);
        assert_ne!(a, b);
    }

    #[test]
    fn test_short_external_name_passes_through() {
        assert_eq!(sanitize_external_name("numpy"), "numpy");
        let exactly_90: String = "x".repeat(90);
        assert_eq!(sanitize_external_name(&exactly_90), exactly_90);
    }

    #[test]
    fn test_long_external_name_is_bounded() {
        let long: String = "a".repeat(300);
        let sanitized = sanitize_external_name(&long);
        assert_eq!(sanitized.chars().count(), 99);
        assert!(sanitized.contains("..."));
    }

    #[test]
    fn test_distinct_long_names_do_not_collide() {
        // Same 88-char prefix, different tails — the hash suffix keeps them apart.
        let prefix = "p".repeat(95);
        let a = format!("{}alpha", prefix);
        let b = format!("{}beta", prefix);
        let sa = sanitize_external_name(&a);
        let sb = sanitize_external_name(&b);
        assert_ne!(sa, sb);
        assert_ne!(external_identity(&sa), external_identity(&sb));
    }

    #[test]
    fn test_external_identity_ignores_line_info() {
        // Externals are interned by name only — same name, same id.
        assert_eq!(external_identity("numpy"), external_identity("numpy"));
        assert_ne!(external_identity("numpy"), external_identity("pandas"));
    }

    #[test]
    fn test_hex_rendering_roundtrip_length() {
        let p = PathBuf::from("/project/x.ts");
        let id = entity_identity(EntityKind::Class, &p, "X", 1, 10);
        assert_eq!(id.to_hex().len(), 64);
        assert!(id.to_hex().chars().all(|c| c.is_ascii_hexdigit()));
    }
}
