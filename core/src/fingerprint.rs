//! Short, non-reversible identifiers for secrets that must show up in logs.

use sha2::{Digest, Sha256};

const FINGERPRINT_BYTES: usize = 8;

/// Hex encoding of the first eight bytes of the SHA-256 digest of `input`.
pub fn fingerprint(input: &[u8]) -> String {
    let digest = Sha256::digest(input);
    digest[..FINGERPRINT_BYTES]
        .iter()
        .map(|byte| format!("{:02x}", byte))
        .collect()
}
