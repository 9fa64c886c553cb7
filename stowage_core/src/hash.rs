//! Identity and hashing.
//!
//! Every input is digested by at least two algorithms in a single pass (md5
//! and sha256, with blake3 as an optional third), so an identity can later be
//! recomputed under either algorithm without rehashing the bytes. Identities
//! are prefixed digest strings: `y` for file content, `x` for directory
//! name/placement, `z` for generated metadata records.

use crate::cancel::CancelFlag;
use crate::error::{Error, Result};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::LazyLock;
use unicode_normalization::UnicodeNormalization;

/// Chunk size for streamed content hashing. Bounds cancellation latency.
const CHUNK_SIZE: usize = 64 * 1024;

/// Supported hash algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    /// MD5, 128-bit. The primary identity digest.
    Md5,
    /// SHA-256, always computed alongside md5.
    Sha256,
    /// BLAKE3, 256-bit. Optional third digest.
    Blake3,
}

impl Algorithm {
    /// Returns the string representation of the algorithm (for records and config).
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Md5 => "md5",
            Algorithm::Sha256 => "sha256",
            Algorithm::Blake3 => "blake3",
        }
    }

    /// Parse algorithm from string.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "md5" => Ok(Algorithm::Md5),
            "sha256" => Ok(Algorithm::Sha256),
            "blake3" => Ok(Algorithm::Blake3),
            _ => Err(Error::invalid_algorithm(s)),
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The algorithms computed when the caller expresses no preference.
pub const DEFAULT_ALGORITHMS: &[Algorithm] = &[Algorithm::Md5, Algorithm::Sha256];

/// A bundle of digests computed together over one input, as uppercase hex.
///
/// md5 and sha256 are always present. blake3 is omitted entirely from the
/// serialized form when it was not computed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestSet {
    pub md5: String,
    pub sha256: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub blake3: Option<String>,
}

impl DigestSet {
    /// Look up the digest for one algorithm, if it was computed.
    pub fn get(&self, algorithm: Algorithm) -> Option<&str> {
        match algorithm {
            Algorithm::Md5 => Some(&self.md5),
            Algorithm::Sha256 => Some(&self.sha256),
            Algorithm::Blake3 => self.blake3.as_deref(),
        }
    }
}

/// Incremental state for all algorithms of one digesting pass.
struct MultiHasher {
    md5: Md5,
    sha256: Sha256,
    blake3: Option<blake3::Hasher>,
}

impl MultiHasher {
    /// md5 and sha256 are unconditional; blake3 only when requested.
    fn new(algorithms: &[Algorithm]) -> Self {
        Self {
            md5: Md5::new(),
            sha256: Sha256::new(),
            blake3: algorithms
                .contains(&Algorithm::Blake3)
                .then(blake3::Hasher::new),
        }
    }

    fn update(&mut self, data: &[u8]) {
        self.md5.update(data);
        self.sha256.update(data);
        if let Some(b3) = &mut self.blake3 {
            b3.update(data);
        }
    }

    fn finish(self) -> DigestSet {
        DigestSet {
            md5: hex::encode_upper(self.md5.finalize()),
            sha256: hex::encode_upper(self.sha256.finalize()),
            blake3: self
                .blake3
                .map(|b3| hex::encode_upper(b3.finalize().as_bytes())),
        }
    }
}

/// Digest set for empty input, computed once.
static EMPTY_DIGESTS: LazyLock<DigestSet> = LazyLock::new(|| {
    let mut hasher = MultiHasher::new(&[Algorithm::Md5, Algorithm::Sha256, Algorithm::Blake3]);
    hasher.update(b"");
    hasher.finish()
});

/// Digest a byte slice in memory.
pub fn digest_bytes(data: &[u8], algorithms: &[Algorithm]) -> DigestSet {
    let mut hasher = MultiHasher::new(algorithms);
    hasher.update(data);
    hasher.finish()
}

/// Digest a file's content by streaming it in fixed-size chunks.
///
/// All requested algorithms are fed in the same pass. The cancellation flag
/// is checked once per chunk, so cancellation latency is bounded by the chunk
/// size rather than the file size. An unreadable file fails with `Error::Io`;
/// callers treat that as recoverable and fall back to a name-based identity.
pub fn digest_content(
    path: &Path,
    algorithms: &[Algorithm],
    cancel: &CancelFlag,
) -> Result<DigestSet> {
    let mut file = File::open(path)?;
    let mut hasher = MultiHasher::new(algorithms);
    let mut buffer = vec![0u8; CHUNK_SIZE];

    loop {
        cancel.check()?;
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hasher.finish())
}

/// Digest a text value.
///
/// The text is Unicode-normalized to the canonical composed form (NFC) and
/// UTF-8 encoded before digesting. Absent or empty text returns the
/// precomputed empty-input digest set.
pub fn digest_text(text: Option<&str>, algorithms: &[Algorithm]) -> DigestSet {
    match text {
        None | Some("") => {
            let mut set = EMPTY_DIGESTS.clone();
            if !algorithms.contains(&Algorithm::Blake3) {
                set.blake3 = None;
            }
            set
        }
        Some(text) => {
            let normalized: String = text.nfc().collect();
            digest_bytes(normalized.as_bytes(), algorithms)
        }
    }
}

/// Digest a directory's identity from its name and its parent's name.
///
/// Two-layer scheme: name and parent name are digested independently, their
/// uppercase-hex forms concatenated, and the concatenation digested. The
/// identity therefore depends on placement without enumerating the
/// directory's contents.
pub fn digest_directory_identity(
    name: &str,
    parent_name: Option<&str>,
    algorithms: &[Algorithm],
) -> DigestSet {
    let name_set = digest_text(Some(name), algorithms);
    let parent_set = digest_text(parent_name, algorithms);

    let md5 = digest_bytes(
        format!("{}{}", name_set.md5, parent_set.md5).as_bytes(),
        &[Algorithm::Md5],
    )
    .md5;
    let sha256 = digest_bytes(
        format!("{}{}", name_set.sha256, parent_set.sha256).as_bytes(),
        &[Algorithm::Sha256],
    )
    .sha256;
    let blake3 = match (&name_set.blake3, &parent_set.blake3) {
        (Some(a), Some(b)) => {
            digest_bytes(format!("{}{}", a, b).as_bytes(), &[Algorithm::Blake3]).blake3
        }
        _ => None,
    };

    DigestSet { md5, sha256, blake3 }
}

/// Identity prefix, distinguishing how the underlying digest was derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityPrefix {
    /// `y`: file, content-derived.
    File,
    /// `x`: directory, name/placement-derived.
    Directory,
    /// `z`: generated (non-sidecar) metadata record.
    Generated,
}

impl IdentityPrefix {
    /// The single-character prefix.
    pub fn as_char(&self) -> char {
        match self {
            IdentityPrefix::File => 'y',
            IdentityPrefix::Directory => 'x',
            IdentityPrefix::Generated => 'z',
        }
    }
}

/// A prefixed identity string. Deterministic: identical input always yields
/// the identical identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The identity prefix character, if the string is non-empty.
    pub fn prefix(&self) -> Option<char> {
        self.0.chars().next()
    }

    /// Rebuild from a persisted string. Records are schema-checked before
    /// identities are read, so no further validation happens here.
    pub fn from_string(s: String) -> Self {
        Identity(s)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Build an identity from a digest set by selecting one algorithm's digest
/// and applying the prefix.
///
/// Fails with `Error::InvalidAlgorithm` if the set lacks the requested
/// algorithm.
pub fn select_identity(
    digests: &DigestSet,
    algorithm: Algorithm,
    prefix: IdentityPrefix,
) -> Result<Identity> {
    let digest = digests
        .get(algorithm)
        .ok_or_else(|| Error::invalid_algorithm(algorithm.as_str()))?;
    Ok(Identity(format!("{}{}", prefix.as_char(), digest)))
}
