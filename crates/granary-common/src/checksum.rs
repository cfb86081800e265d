//! Checksum utilities for file verification
//!
//! Every algorithm is exposed through one incremental [`ChecksumHasher`] so
//! that local files and streamed object bodies are hashed the same way.

use crate::error::{GranaryError, Result};
use crate::types::ChecksumAlgorithm;
use crc::{Crc, Digest as CrcDigest, CRC_32_CKSUM};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};
use std::io::Read;
use std::path::Path;

static CKSUM: Crc<u32> = Crc::<u32>::new(&CRC_32_CKSUM);

const READ_BUFFER_SIZE: usize = 64 * 1024;

enum HasherState {
    /// POSIX cksum: CRC over the data followed by its length, little end first
    Cksum {
        digest: CrcDigest<'static, u32>,
        length: u64,
    },
    Md5(md5::Context),
    Sha1(Sha1),
    Sha256(Sha256),
    Sha512(Sha512),
}

/// Incremental hasher for any [`ChecksumAlgorithm`]
pub struct ChecksumHasher {
    algorithm: ChecksumAlgorithm,
    state: HasherState,
}

impl ChecksumHasher {
    pub fn new(algorithm: ChecksumAlgorithm) -> Self {
        let state = match algorithm {
            ChecksumAlgorithm::Cksum => HasherState::Cksum {
                digest: CKSUM.digest(),
                length: 0,
            },
            ChecksumAlgorithm::Md5 => HasherState::Md5(md5::Context::new()),
            ChecksumAlgorithm::Sha1 => HasherState::Sha1(Sha1::new()),
            ChecksumAlgorithm::Sha256 => HasherState::Sha256(Sha256::new()),
            ChecksumAlgorithm::Sha512 => HasherState::Sha512(Sha512::new()),
        };
        Self { algorithm, state }
    }

    pub fn algorithm(&self) -> ChecksumAlgorithm {
        self.algorithm
    }

    pub fn update(&mut self, data: &[u8]) {
        match &mut self.state {
            HasherState::Cksum { digest, length } => {
                digest.update(data);
                *length += data.len() as u64;
            },
            HasherState::Md5(ctx) => ctx.consume(data),
            HasherState::Sha1(h) => h.update(data),
            HasherState::Sha256(h) => h.update(data),
            HasherState::Sha512(h) => h.update(data),
        }
    }

    /// Finish hashing; cksum renders as a decimal integer, the rest as lowercase hex
    pub fn finalize(self) -> String {
        match self.state {
            HasherState::Cksum { mut digest, length } => {
                let mut remaining = length;
                while remaining > 0 {
                    digest.update(&[(remaining & 0xff) as u8]);
                    remaining >>= 8;
                }
                digest.finalize().to_string()
            },
            HasherState::Md5(ctx) => format!("{:x}", ctx.compute()),
            HasherState::Sha1(h) => hex::encode(h.finalize()),
            HasherState::Sha256(h) => hex::encode(h.finalize()),
            HasherState::Sha512(h) => hex::encode(h.finalize()),
        }
    }
}

/// Compute checksum for a file
pub fn compute_file_checksum(
    path: impl AsRef<Path>,
    algorithm: ChecksumAlgorithm,
) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    compute_checksum(&mut file, algorithm)
}

/// Compute checksum for any readable source
pub fn compute_checksum<R: Read>(reader: &mut R, algorithm: ChecksumAlgorithm) -> Result<String> {
    let mut hasher = ChecksumHasher::new(algorithm);
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hasher.finalize())
}

pub fn compute_bytes_checksum(data: &[u8], algorithm: ChecksumAlgorithm) -> String {
    let mut hasher = ChecksumHasher::new(algorithm);
    hasher.update(data);
    hasher.finalize()
}

/// Compare two rendered checksums, ignoring surrounding whitespace and hex case
pub fn checksums_match(expected: &str, actual: &str) -> bool {
    expected.trim().eq_ignore_ascii_case(actual.trim())
}

/// Verify checksum for a file
pub fn verify_file_checksum(
    path: impl AsRef<Path>,
    expected: &str,
    algorithm: ChecksumAlgorithm,
) -> Result<()> {
    let path = path.as_ref();
    let actual = compute_file_checksum(path, algorithm)?;
    if checksums_match(expected, &actual) {
        Ok(())
    } else {
        Err(GranaryError::InvalidChecksum {
            file: path.display().to_string(),
            algorithm: algorithm.to_string(),
            expected: expected.to_string(),
            actual,
        })
    }
}
