use crate::error::{Result, ServiceError};

/// Short content id: the low 64 bits of murmur3 over the input, rendered as
/// 16 lowercase hex characters.
pub fn content_id(bytes: &[u8]) -> String {
    format!("{:016x}", fastmurmur3::hash(bytes) as u64)
}

/// Content-addressed subpath for a hash, sharded by its first two hex
/// characters: `hh/<hash>`.
pub fn content_path(hash: &str) -> Result<String> {
    if hash.len() < 2 || !hash.is_ascii() {
        return Err(ServiceError::malformed(format!(
            "content hash '{hash}' is not a hex digest"
        )));
    }
    Ok(format!("{}/{}", &hash[..2], hash))
}
