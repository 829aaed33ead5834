use sha1::{Digest, Sha1};

/// Lowercase hex SHA-1 of the absolute request URL. The hash spreads entries
/// uniformly across filenames; it is not a security boundary.
pub fn cache_key(url: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(url.as_bytes());
    hex::encode(hasher.finalize())
}
