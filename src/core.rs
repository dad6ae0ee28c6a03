use std::fs;
use std::io;

use camino::Utf8Path;

/// A 32-byte BLAKE3 hash used for content-addressed change detection.
///
/// Every file a task reads or produces is fingerprinted with this hash.
/// Comparing the recorded hash against the live file is what decides
/// whether a task is out of date, so timestamps never enter the picture.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
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
    /// Hashes an in-memory buffer.
    pub fn hash(buffer: impl AsRef<[u8]>) -> Self {
        blake3::Hasher::new()
            .update(buffer.as_ref())
            .finalize()
            .into()
    }

    pub(crate) fn hash_file(path: impl AsRef<std::path::Path>) -> io::Result<Self> {
        Ok(blake3::Hasher::new()
            .update_mmap_rayon(path)?
            .finalize()
            .into())
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

    /// Parses the hex rendering produced by [`to_hex`](Self::to_hex).
    /// Returns `None` for anything that isn't 64 hex digits.
    pub(crate) fn from_hex(text: &str) -> Option<Self> {
        if text.len() != 64 {
            return None;
        }

        let mut acc = [0u8; 32];

        for (i, chunk) in text.as_bytes().chunks_exact(2).enumerate() {
            let hi = (chunk[0] as char).to_digit(16)?;
            let lo = (chunk[1] as char).to_digit(16)?;
            acc[i] = ((hi << 4) | lo) as u8;
        }

        Some(Hash32(acc))
    }
}

impl std::fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

/// The observed state of one file: content digest plus byte size.
///
/// The size is kept alongside the digest so that staleness checks can
/// reject a changed file on length alone, without hashing it.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Fingerprint {
    pub digest: Hash32,
    pub size: u64,
}

impl Fingerprint {
    /// Reads the live state of a file from the filesystem.
    pub fn of_file(path: impl AsRef<Utf8Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let size = fs::metadata(path)?.len();
        let digest = Hash32::hash_file(path)?;

        Ok(Self { digest, size })
    }
}
