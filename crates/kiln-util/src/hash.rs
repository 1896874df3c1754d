//! Canonical fingerprinting for deterministic rule-key computation.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use sha2::{Digest as _, Sha256};

use crate::error::UtilError;
use crate::path::RepoPath;

/// A 256-bit SHA-256 digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest([u8; 32]);

impl Digest {
    /// Wrap raw digest bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Borrow the raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Return the lowercase hex representation (64 characters).
    pub fn to_hex(&self) -> String {
        self.to_string()
    }

    /// The first two hex characters, used to shard on-disk directories.
    pub fn shard(&self) -> String {
        format!("{:02x}", self.0.first().copied().unwrap_or_default())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({self})")
    }
}

impl FromStr for Digest {
    type Err = UtilError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || UtilError::InvalidDigest {
            value: s.to_owned(),
        };
        if s.len() != 64 || !s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(invalid());
        }
        let mut bytes = [0u8; 32];
        for (slot, pair) in bytes.iter_mut().zip(s.as_bytes().chunks(2)) {
            let text = std::str::from_utf8(pair).map_err(|_| invalid())?;
            *slot = u8::from_str_radix(text, 16).map_err(|_| invalid())?;
        }
        Ok(Self(bytes))
    }
}

/// Compute the SHA-256 digest of a byte slice.
pub fn sha256_bytes(data: &[u8]) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update(data);
    Digest(hasher.finalize().into())
}

/// Compute the SHA-256 digest of a file using streaming reads.
///
/// Uses a 64 KiB buffer so large tool binaries and outputs are never loaded
/// into memory whole.
///
/// # Errors
/// Returns an error if the file cannot be opened or read.
pub fn sha256_file(path: &Path) -> Result<Digest, UtilError> {
    let file = std::fs::File::open(path).map_err(|source| UtilError::io(path, source))?;
    let mut reader = std::io::BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = std::io::Read::read(&mut reader, &mut buf)
            .map_err(|source| UtilError::io(path, source))?;
        if n == 0 {
            break;
        }
        let Some(chunk) = buf.get(..n) else {
            break; // unreachable: n is bounded by buf.len()
        };
        hasher.update(chunk);
    }
    Ok(Digest(hasher.finalize().into()))
}

/// Normalize `path` to the repository-relative POSIX form that
/// [`Fingerprint::put_path`] hashes.
///
/// # Errors
/// Returns an error if the path is absolute or escapes the repository root.
pub fn normalize_path(path: &Path) -> Result<String, UtilError> {
    RepoPath::new(path).map(|p| p.as_str().to_owned())
}

// One-byte markers that precede every value so that no two differently
// shaped values serialize to the same byte stream.
const MARK_BYTES: u8 = 0x01;
const MARK_STRING: u8 = 0x02;
const MARK_PATH: u8 = 0x03;
const MARK_BOOL: u8 = 0x04;
const MARK_U64: u8 = 0x05;
const MARK_ORDERED: u8 = 0x06;
const MARK_UNORDERED: u8 = 0x07;
const MARK_TAGGED: u8 = 0x08;
const MARK_DIGEST: u8 = 0x09;
const MARK_I64: u8 = 0x0a;

/// A value that can be fed into a [`Fingerprint`].
pub trait Fingerprintable {
    /// Append this value's canonical serialization to `fp`.
    fn fingerprint(&self, fp: &mut Fingerprint);
}

/// Incremental hasher over a canonical, length-prefixed serialization.
///
/// Every primitive is written as a type marker followed by a fixed-width or
/// length-prefixed payload, so canonicalization is total. Unordered
/// collections hash each element independently and sort the element digests,
/// making the result independent of iteration order.
#[derive(Clone, Default)]
pub struct Fingerprint {
    hasher: Sha256,
}

impl Fingerprint {
    /// Create an empty fingerprint.
    pub fn new() -> Self {
        Self::default()
    }

    fn raw(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    fn len_prefix(&mut self, len: usize) {
        self.raw(&(len as u64).to_le_bytes());
    }

    /// Append raw bytes.
    pub fn put_bytes(&mut self, data: &[u8]) -> &mut Self {
        self.raw(&[MARK_BYTES]);
        self.len_prefix(data.len());
        self.raw(data);
        self
    }

    /// Append a length-prefixed UTF-8 string.
    pub fn put_string(&mut self, value: &str) -> &mut Self {
        self.raw(&[MARK_STRING]);
        self.len_prefix(value.len());
        self.raw(value.as_bytes());
        self
    }

    /// Append a repository-relative path.
    pub fn put_path(&mut self, path: &RepoPath) -> &mut Self {
        self.raw(&[MARK_PATH]);
        self.len_prefix(path.as_str().len());
        self.raw(path.as_str().as_bytes());
        self
    }

    /// Append a boolean.
    pub fn put_bool(&mut self, value: bool) -> &mut Self {
        self.raw(&[MARK_BOOL, u8::from(value)]);
        self
    }

    /// Append an unsigned integer.
    pub fn put_u64(&mut self, value: u64) -> &mut Self {
        self.raw(&[MARK_U64]);
        self.raw(&value.to_le_bytes());
        self
    }

    /// Append a signed integer.
    pub fn put_i64(&mut self, value: i64) -> &mut Self {
        self.raw(&[MARK_I64]);
        self.raw(&value.to_le_bytes());
        self
    }

    /// Append a previously computed digest.
    pub fn put_digest(&mut self, digest: &Digest) -> &mut Self {
        self.raw(&[MARK_DIGEST]);
        self.raw(digest.as_bytes());
        self
    }

    /// Append a sequence whose order is significant.
    pub fn put_ordered<I>(&mut self, items: I) -> &mut Self
    where
        I: IntoIterator,
        I::Item: Fingerprintable,
    {
        let items: Vec<I::Item> = items.into_iter().collect();
        self.raw(&[MARK_ORDERED]);
        self.len_prefix(items.len());
        for item in &items {
            item.fingerprint(self);
        }
        self
    }

    /// Append a collection whose order is not significant.
    pub fn put_unordered<I>(&mut self, items: I) -> &mut Self
    where
        I: IntoIterator,
        I::Item: Fingerprintable,
    {
        let mut digests: Vec<Digest> = items
            .into_iter()
            .map(|item| {
                let mut child = Fingerprint::new();
                item.fingerprint(&mut child);
                child.finish()
            })
            .collect();
        digests.sort_unstable();
        self.raw(&[MARK_UNORDERED]);
        self.len_prefix(digests.len());
        for digest in &digests {
            self.raw(digest.as_bytes());
        }
        self
    }

    /// Append a value under a disambiguating tag (e.g. `"flag"` vs `"path"`).
    pub fn put_tagged<T: Fingerprintable + ?Sized>(&mut self, tag: &str, value: &T) -> &mut Self {
        self.raw(&[MARK_TAGGED]);
        self.len_prefix(tag.len());
        self.raw(tag.as_bytes());
        value.fingerprint(self);
        self
    }

    /// Finalize into a digest.
    pub fn finish(self) -> Digest {
        Digest(self.hasher.finalize().into())
    }
}

impl Fingerprintable for str {
    fn fingerprint(&self, fp: &mut Fingerprint) {
        fp.put_string(self);
    }
}

impl Fingerprintable for String {
    fn fingerprint(&self, fp: &mut Fingerprint) {
        fp.put_string(self);
    }
}

impl Fingerprintable for bool {
    fn fingerprint(&self, fp: &mut Fingerprint) {
        fp.put_bool(*self);
    }
}

impl Fingerprintable for u64 {
    fn fingerprint(&self, fp: &mut Fingerprint) {
        fp.put_u64(*self);
    }
}

impl Fingerprintable for i64 {
    fn fingerprint(&self, fp: &mut Fingerprint) {
        fp.put_i64(*self);
    }
}

impl Fingerprintable for Digest {
    fn fingerprint(&self, fp: &mut Fingerprint) {
        fp.put_digest(self);
    }
}

impl Fingerprintable for RepoPath {
    fn fingerprint(&self, fp: &mut Fingerprint) {
        fp.put_path(self);
    }
}

impl<T: Fingerprintable + ?Sized> Fingerprintable for &T {
    fn fingerprint(&self, fp: &mut Fingerprint) {
        (**self).fingerprint(fp);
    }
}

impl<A: Fingerprintable, B: Fingerprintable> Fingerprintable for (A, B) {
    fn fingerprint(&self, fp: &mut Fingerprint) {
        fp.raw(&[MARK_ORDERED]);
        fp.len_prefix(2);
        self.0.fingerprint(fp);
        self.1.fingerprint(fp);
    }
}

impl<T: Fingerprintable> Fingerprintable for [T] {
    fn fingerprint(&self, fp: &mut Fingerprint) {
        fp.put_ordered(self.iter());
    }
}

impl<T: Fingerprintable> Fingerprintable for Vec<T> {
    fn fingerprint(&self, fp: &mut Fingerprint) {
        fp.put_ordered(self.iter());
    }
}
