use sha2::{Digest, Sha256};

/// Computes SHA-256 of `data` and returns the hex-encoded digest.
///
/// Both sides of the protocol use this for the `X-Chunk-Checksum` header and
/// the `serverChecksum` field of a chunk acknowledgment.
pub fn checksum_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Compares two hex digests, ignoring ASCII case.
pub fn checksums_match(local: &str, remote: &str) -> bool {
    !local.is_empty() && local.eq_ignore_ascii_case(remote)
}
