//! HTTP `Range` negotiation for downloads.
//!
//! A malformed header or one carrying multiple ranges falls back to a full
//! 200 response rather than an error; only a syntactically valid range that
//! starts past EOF is refused with 416.

/// Inclusive byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    /// Inclusive bounds, so a range is never empty.
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeOutcome {
    /// Respond 200 with the whole body.
    Full,
    /// Respond 206 with the given slice.
    Partial(ByteRange),
    /// Respond 416 with `Content-Range: bytes */len`.
    Unsatisfiable,
}

/// Negotiate a `Range` header against a known content length.
pub fn negotiate(header: Option<&str>, len: u64) -> RangeOutcome {
    let Some(raw) = header else {
        return RangeOutcome::Full;
    };
    let Some(spec) = raw.trim().strip_prefix("bytes=") else {
        return RangeOutcome::Full;
    };
    if spec.contains(',') {
        // multiple ranges are answered with the full body
        return RangeOutcome::Full;
    }

    let Some((start_raw, end_raw)) = spec.split_once('-') else {
        return RangeOutcome::Full;
    };

    let (start, end) = match (start_raw.trim(), end_raw.trim()) {
        // suffix form: the final n bytes
        ("", suffix) => {
            let Ok(n) = suffix.parse::<u64>() else {
                return RangeOutcome::Full;
            };
            if n == 0 || len == 0 {
                return RangeOutcome::Unsatisfiable;
            }
            (len.saturating_sub(n), len - 1)
        }
        (first, "") => {
            let Ok(start) = first.parse::<u64>() else {
                return RangeOutcome::Full;
            };
            if start >= len {
                return RangeOutcome::Unsatisfiable;
            }
            (start, len - 1)
        }
        (first, last) => {
            let (Ok(start), Ok(end)) = (first.parse::<u64>(), last.parse::<u64>()) else {
                return RangeOutcome::Full;
            };
            if start > end {
                return RangeOutcome::Full;
            }
            if start >= len {
                return RangeOutcome::Unsatisfiable;
            }
            (start, end.min(len - 1))
        }
    };

    RangeOutcome::Partial(ByteRange { start, end })
}
