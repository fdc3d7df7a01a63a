//! Signed LEB128 encoding for stored nanosecond totals.
//!
//! A stored value must be exactly one encoded integer: truncated input,
//! overlong input and trailing bytes are all rejected.

/// Longest signed LEB128 encoding of an `i64`.
pub const MAX_ENCODED_LEN: usize = 10;

pub fn encode_nanos(value: i64) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(MAX_ENCODED_LEN);
    // Writing into a Vec cannot fail.
    let _ = leb128::write::signed(&mut buffer, value);
    buffer
}

pub fn decode_nanos(bytes: &[u8]) -> Result<i64, String> {
    if bytes.is_empty() {
        return Err("value is empty".to_string());
    }

    let mut reader = bytes;
    let value = leb128::read::signed(&mut reader).map_err(|err| match err {
        leb128::read::Error::IoError(_) => "value is truncated".to_string(),
        leb128::read::Error::Overflow => "value does not fit in 64 bits".to_string(),
    })?;

    if !reader.is_empty() {
        return Err(format!("{} trailing bytes after value", reader.len()));
    }

    Ok(value)
}
