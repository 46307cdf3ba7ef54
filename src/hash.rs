//! Content fingerprints. Everything the engine memoizes or addresses
//! (blobs, directory trees, parameter sets, process invocations) is keyed
//! by a [`Hash32`].

/// A 32-byte BLAKE3 hash.
///
/// Serves two purposes:
/// 1. Content addressing in the [`Store`](crate::Store): two digests are
///    equal iff their referenced content is byte-identical.
/// 2. Task identity: a fingerprint of a rule's concrete parameter values
///    determines which memoized result (if any) satisfies a request.
#[derive(
    Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, serde::Serialize, serde::Deserialize,
)]
pub struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    pub fn hash(buffer: impl AsRef<[u8]>) -> Self {
        blake3::Hasher::new()
            .update(buffer.as_ref())
            .finalize()
            .into()
    }

    pub fn hash_file(path: impl AsRef<std::path::Path>) -> std::io::Result<Self> {
        Ok(blake3::Hasher::new().update_mmap(path)?.finalize().into())
    }

    pub fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = vec![0u8; 64];

        for (i, &byte) in self.0.iter().enumerate() {
            acc[i * 2] = HEX[(byte >> 4) as usize];
            acc[i * 2 + 1] = HEX[(byte & 0xF) as usize];
        }

        String::from_utf8(acc).unwrap()
    }
}

impl std::fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

/// Adapter exposing BLAKE3 through `std::hash::Hasher`, so any `Hash` value
/// can be folded into a [`Hash32`] deterministically (no per-process seed).
#[derive(Default)]
pub(crate) struct Blake3Hasher(blake3::Hasher);

impl From<Blake3Hasher> for Hash32 {
    fn from(value: Blake3Hasher) -> Self {
        let bytes: [u8; 32] = value.0.finalize().into();
        Hash32::from(bytes)
    }
}

impl std::hash::Hasher for Blake3Hasher {
    fn finish(&self) -> u64 {
        let mut output = [0u8; 8];
        self.0.finalize_xof().fill(&mut output);
        u64::from_le_bytes(output)
    }

    fn write(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::hash::Hash;

    #[test]
    fn test_hash_is_stable() {
        assert_eq!(Hash32::hash(b"karakuri"), Hash32::hash(b"karakuri"));
        assert_ne!(Hash32::hash(b"karakuri"), Hash32::hash(b"karakuri2"));
    }

    #[test]
    fn test_hex_length() {
        let hex = Hash32::hash(b"abc").to_hex();
        assert_eq!(hex.len(), 64);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_hasher_adapter_deterministic() {
        let fingerprint = |value: &str| -> Hash32 {
            let mut hasher = Blake3Hasher::default();
            value.hash(&mut hasher);
            hasher.into()
        };

        assert_eq!(fingerprint("a"), fingerprint("a"));
        assert_ne!(fingerprint("a"), fingerprint("b"));
    }
}
