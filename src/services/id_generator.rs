//! Random public identifiers for stored objects.
//!
//! Ids are 6 bytes from the operating system's secure random source,
//! hex encoded. There is no fallback generator: if the OS source fails the
//! upload fails.

use rand::{TryRngCore, rngs::OsRng};
use thiserror::Error;

/// Number of random bytes behind each id.
pub const ID_BYTES: usize = 6;

/// Length of an encoded id.
pub const ID_LEN: usize = ID_BYTES * 2;

#[derive(Debug, Error)]
#[error("secure random source unavailable: {0}")]
pub struct IdError(String);

/// Generate a fresh identifier.
pub fn new_id() -> Result<String, IdError> {
    let mut bytes = [0u8; ID_BYTES];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|err| IdError(err.to_string()))?;
    Ok(hex::encode(bytes))
}

/// Strip every character the generator never emits.
///
/// The result is safe to use as a file name or SQL key. It may be empty or
/// of the wrong length; callers decide what that means.
pub fn sanitize_id(raw: &str) -> String {
    raw.chars()
        .filter(|c| matches!(c, '0'..='9' | 'a'..='f'))
        .collect()
}

/// True when `id` has exactly the generator's shape.
pub fn is_well_formed(id: &str) -> bool {
    id.len() == ID_LEN && sanitize_id(id).len() == ID_LEN
}
