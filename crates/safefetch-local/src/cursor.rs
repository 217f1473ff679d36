//! Opaque pagination cursors: standard base64 of `v1:{offset}`.
//!
//! Not a secret, just a reversible encoding. Anything that is not exactly what [`encode`] would
//! have produced is rejected.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use safefetch_core::{Error, Result};

pub const MAX_CURSOR_LEN: usize = 64;
const PREFIX: &str = "v1:";

pub fn encode(offset: usize) -> String {
    STANDARD.encode(format!("{PREFIX}{offset}"))
}

pub fn decode(cursor: &str) -> Result<usize> {
    if cursor.is_empty() || cursor.len() > MAX_CURSOR_LEN {
        return Err(invalid("bad length"));
    }
    let raw = STANDARD
        .decode(cursor)
        .map_err(|e| invalid(&e.to_string()))?;
    let text = std::str::from_utf8(&raw).map_err(|_| invalid("not utf-8"))?;
    let digits = text
        .strip_prefix(PREFIX)
        .ok_or_else(|| invalid("unknown version"))?;
    let offset: usize = digits.parse().map_err(|_| invalid("bad offset"))?;
    // Reject `v1:007` and friends so every offset has exactly one spelling.
    if offset.to_string() != digits {
        return Err(invalid("non-canonical offset"));
    }
    Ok(offset)
}

fn invalid(why: &str) -> Error {
    Error::InvalidParams(format!("invalid cursor: {why}"))
}
