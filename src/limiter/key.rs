//! Request key validation.

use crate::error::{Error, Result};

/// Maximum accepted key length in bytes.
const MAX_KEY_LEN: usize = 256;

/// Validate a request key before any backend access.
///
/// A valid key is non-empty, at most 256 bytes, and consists of
/// alphanumeric characters, periods, underscores, and hyphens.
pub(crate) fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::InvalidKey("key cannot be empty"));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(Error::InvalidKey("key length exceeds maximum allowed length"));
    }
    let valid = key
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'));
    if !valid {
        return Err(Error::InvalidKey("key contains invalid characters"));
    }
    Ok(())
}
