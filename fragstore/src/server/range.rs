//! `Range` request header parsing (single byte ranges only).

use crate::chunk::range::ByteRange;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RangeError {
    /// Not a byte range header we can parse.
    Malformed(String),
    /// Syntactically fine, but outside the object or asking for several ranges.
    Unsatisfiable,
}

/// Resolves a `Range` header against an object of `size` bytes.
/// `Ok(None)` means no header: serve the whole object.
pub fn parse_range(header: Option<&str>, size: u64) -> Result<Option<ByteRange>, RangeError> {
    let Some(raw) = header else {
        return Ok(None);
    };
    let spec = raw
        .trim()
        .strip_prefix("bytes=")
        .ok_or_else(|| RangeError::Malformed(format!("unsupported range unit in {raw:?}")))?
        .trim();
    if spec.contains(',') {
        return Err(RangeError::Unsatisfiable);
    }
    let (first, last) = spec
        .split_once('-')
        .ok_or_else(|| RangeError::Malformed(format!("missing '-' in {raw:?}")))?;
    let (first, last) = (first.trim(), last.trim());
    let number = |s: &str| {
        s.parse::<u64>()
            .map_err(|_| RangeError::Malformed(format!("bad offset {s:?} in {raw:?}")))
    };

    if first.is_empty() {
        // bytes=-N: the last N bytes
        let n = number(last)?;
        if n == 0 || size == 0 {
            return Err(RangeError::Unsatisfiable);
        }
        return Ok(Some(ByteRange::new(size.saturating_sub(n), size)));
    }

    let start = number(first)?;
    let end = if last.is_empty() {
        size
    } else {
        let last = number(last)?;
        if last < start {
            return Err(RangeError::Malformed(format!("reversed range {raw:?}")));
        }
        last.saturating_add(1).min(size)
    };
    if start >= size {
        return Err(RangeError::Unsatisfiable);
    }
    Ok(Some(ByteRange::new(start, end)))
}
