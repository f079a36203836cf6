//! Go-style duration strings as used by the CRD timeouts (`90s`, `5m`, `1h30m`, `250ms`).

use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DurationError {
    #[error("invalid duration {0:?} (expected e.g. 30s, 5m, 1h30m)")]
    Invalid(String),
    /// A zero timeout would expire every bounded step immediately.
    #[error("duration {0:?} is zero")]
    Zero(String),
}

fn segment_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+)(ms|h|m|s)").expect("static duration pattern"))
}

/// Parse a duration made of one or more `<digits><unit>` segments.
pub fn parse(raw: &str) -> Result<Duration, DurationError> {
    let s = raw.trim();
    if s.is_empty() {
        return Err(DurationError::Invalid(raw.to_string()));
    }
    let mut total = Duration::ZERO;
    let mut consumed = 0usize;
    for cap in segment_re().captures_iter(s) {
        let whole = cap.get(0).ok_or_else(|| DurationError::Invalid(raw.to_string()))?;
        if whole.start() != consumed {
            return Err(DurationError::Invalid(raw.to_string()));
        }
        consumed = whole.end();
        let n: u64 = cap[1].parse().map_err(|_| DurationError::Invalid(raw.to_string()))?;
        let part = match &cap[2] {
            "ms" => Duration::from_millis(n),
            "s" => Duration::from_secs(n),
            "m" => Duration::from_secs(n.saturating_mul(60)),
            _ => Duration::from_secs(n.saturating_mul(3600)),
        };
        total = total.saturating_add(part);
    }
    if consumed != s.len() {
        return Err(DurationError::Invalid(raw.to_string()));
    }
    Ok(total)
}

/// Resolve an optional timeout, falling back to `default` when unset or zero.
/// Returns the parse error alongside the fallback so callers can report it.
pub fn resolve(raw: Option<&str>, default: Duration) -> (Duration, Option<DurationError>) {
    match raw {
        None | Some("") => (default, None),
        Some(s) => match parse(s) {
            Ok(d) if d.is_zero() => (default, Some(DurationError::Zero(s.to_string()))),
            Ok(d) => (d, None),
            Err(e) => (default, Some(e)),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_and_compound_segments() {
        assert_eq!(parse("90s"), Ok(Duration::from_secs(90)));
        assert_eq!(parse("5m"), Ok(Duration::from_secs(300)));
        assert_eq!(parse("1h30m"), Ok(Duration::from_secs(5400)));
        assert_eq!(parse("250ms"), Ok(Duration::from_millis(250)));
        assert_eq!(parse("1m500ms"), Ok(Duration::from_millis(60_500)));
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse("").is_err());
        assert!(parse("5").is_err());
        assert!(parse("5 minutes").is_err());
        assert!(parse("m5").is_err());
        assert!(parse("5m!").is_err());
    }

    #[test]
    fn resolve_falls_back_and_reports() {
        let d = Duration::from_secs(300);
        assert_eq!(resolve(None, d), (d, None));
        assert_eq!(resolve(Some(""), d), (d, None));
        assert_eq!(resolve(Some("10m"), d).0, Duration::from_secs(600));
        let (v, err) = resolve(Some("soon"), d);
        assert_eq!(v, d);
        assert!(err.is_some());
    }

    #[test]
    fn zero_timeouts_fall_back_to_default() {
        let d = Duration::from_secs(300);
        assert_eq!(parse("0s"), Ok(Duration::ZERO));
        assert_eq!(resolve(Some("0s"), d), (d, Some(DurationError::Zero("0s".into()))));
        assert_eq!(resolve(Some("0m0s"), d).0, d);
    }
}
