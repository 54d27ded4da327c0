//! Short random identifiers used to tag VMs and snapshots.

const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// An opaque, randomly generated identifier for a live or pooled VM.
///
/// Tags are 8 alphanumeric characters, matching the reference runtime's `RandStringRunes(8)`.
/// Uniqueness is a property of the controller's maps (§3), not of this type.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VmId(String);

/// An opaque, randomly generated identifier for a snapshot, prefixed `ss_` by convention.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SnapshotId(String);

fn random_tag(len: usize) -> String {
    (0..len)
        .map(|_| ALPHABET[fastrand::usize(..ALPHABET.len())] as char)
        .collect()
}

impl VmId {
    /// Generate a fresh, random 8-character tag.
    pub fn generate() -> Self {
        Self(random_tag(8))
    }
}

impl std::fmt::Display for VmId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for VmId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl SnapshotId {
    /// Generate a fresh `ss_`-prefixed random identifier.
    pub fn generate() -> Self {
        Self(format!("ss_{}", random_tag(8)))
    }
}

impl std::fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SnapshotId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vm_id_is_eight_chars() {
        for _ in 0..50 {
            assert_eq!(VmId::generate().as_ref().len(), 8);
        }
    }

    #[test]
    fn vm_ids_are_practically_unique() {
        let a = VmId::generate();
        let b = VmId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn snapshot_id_has_prefix() {
        let id = SnapshotId::generate();
        assert!(id.as_ref().starts_with("ss_"));
        assert_eq!(id.as_ref().len(), 11);
    }
}
