//! Millisecond time helpers: countdown-text parsing and deterministic
//! humanize jitter.
//!
//! The runtime never reads the wall clock itself; every dispatch receives
//! `now_ms` from its driver (the live pump or a test harness).

pub const MS_PER_SECOND: u64 = 1000;
pub const MS_PER_MINUTE: u64 = 60 * MS_PER_SECOND;

/// Upper bound for humanized jitter added to a scheduled delay.
pub const HUMANIZE_JITTER_MAX_MS: u64 = 45 * MS_PER_SECOND;

/// Parse a game countdown ("1:23:45", "23:45", possibly embedded in
/// surrounding text) into milliseconds. Returns `None` when no plausible
/// countdown token is present; callers fall back to a configured default.
pub fn parse_countdown_ms(text: &str) -> Option<u64> {
    for token in text.split(|c: char| !(c.is_ascii_digit() || c == ':')) {
        if let Some(ms) = parse_token(token) {
            return Some(ms);
        }
    }
    None
}

fn parse_token(token: &str) -> Option<u64> {
    let parts: Vec<&str> = token.split(':').collect();
    if parts.len() < 2 || parts.len() > 3 {
        return None;
    }

    let mut values = Vec::with_capacity(parts.len());
    for part in &parts {
        if part.is_empty() || part.len() > 3 {
            return None;
        }
        values.push(part.parse::<u64>().ok()?);
    }

    // Trailing components are minutes/seconds and must stay below 60.
    if values[1..].iter().any(|value| *value >= 60) {
        return None;
    }

    let seconds = match values.as_slice() {
        [minutes, secs] => minutes * 60 + secs,
        [hours, minutes, secs] => hours * 3600 + minutes * 60 + secs,
        _ => return None,
    };
    Some(seconds * MS_PER_SECOND)
}

/// Deterministic jitter for humanized scheduling, derived from SplitMix64-style
/// mixing of the seed and the nominal due time. Stable across runs so tests
/// can assert exact schedules.
pub fn humanize_jitter_ms(seed: u64, due_ms: u64, max_jitter_ms: u64) -> u64 {
    if max_jitter_ms == 0 {
        return 0;
    }
    let mut h = seed ^ due_ms.wrapping_mul(0x9e3779b97f4a7c15);
    h = (h ^ (h >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
    h = (h ^ (h >> 27)).wrapping_mul(0x94d049bb133111eb);
    h ^= h >> 31;
    h % (max_jitter_ms + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minutes_and_seconds() {
        assert_eq!(parse_countdown_ms("23:45"), Some((23 * 60 + 45) * 1000));
    }

    #[test]
    fn parses_hours_minutes_seconds() {
        assert_eq!(
            parse_countdown_ms("1:02:03"),
            Some((3600 + 2 * 60 + 3) * 1000)
        );
    }

    #[test]
    fn parses_countdown_embedded_in_text() {
        assert_eq!(
            parse_countdown_ms("next harvest ready in 4:30 from now"),
            Some((4 * 60 + 30) * 1000)
        );
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(parse_countdown_ms("soon"), None);
        assert_eq!(parse_countdown_ms("12345"), None);
        assert_eq!(parse_countdown_ms("1:99"), None);
        assert_eq!(parse_countdown_ms(""), None);
    }

    #[test]
    fn jitter_is_deterministic_and_bounded() {
        let a = humanize_jitter_ms(42, 1_000_000, 5000);
        let b = humanize_jitter_ms(42, 1_000_000, 5000);
        assert_eq!(a, b);
        assert!(a <= 5000);
        assert_eq!(humanize_jitter_ms(42, 1_000_000, 0), 0);
    }
}
