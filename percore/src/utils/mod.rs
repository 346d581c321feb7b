pub(crate) mod thread;

use crate::error::{ParseError, ParseErrorKind};

#[allow(dead_code)]
pub(crate) const CACHE_LINE_SIZE: usize = 64;

/// Parses a human-readable size such as `512`, `64K`, `200M`, `1G`.
///
/// Suffixes are powers of 1024. Returns a typed positional error carrying
/// the offending substring, so config failures point at the exact token.
pub fn parse_size(s: &str) -> Result<u64, ParseError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(ParseError::new(ParseErrorKind::InvalidNumber, 0, s));
    }

    let digits_end = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    if digits_end == 0 {
        return Err(ParseError::new(ParseErrorKind::InvalidNumber, 0, s));
    }

    let value: u64 = s[..digits_end]
        .parse()
        .map_err(|_| ParseError::new(ParseErrorKind::InvalidNumber, 0, s))?;

    let suffix = &s[digits_end..];
    let shift = match suffix {
        "" => 0,
        "k" | "K" => 10,
        "m" | "M" => 20,
        "g" | "G" => 30,
        "t" | "T" => 40,
        _ => {
            return Err(ParseError::new(
                ParseErrorKind::InvalidSuffix,
                digits_end,
                s,
            ))
        }
    };

    value
        .checked_shl(shift)
        .filter(|v| v >> shift == value)
        .ok_or_else(|| ParseError::new(ParseErrorKind::InvalidNumber, 0, s))
}

/// Best-effort software prefetch of the cache line holding `p`.
///
/// Falls back to a no-op on architectures without a stable prefetch
/// intrinsic; the batch-copy in the cross-shard consumer does most of the
/// work there anyway.
#[inline(always)]
pub(crate) fn prefetch_read<T>(p: *const T) {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        use std::arch::x86_64::{_mm_prefetch, _MM_HINT_T0};
        _mm_prefetch(p as *const i8, _MM_HINT_T0);
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        let _ = p;
    }
}
