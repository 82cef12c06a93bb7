//! Numeric extraction from nvidia-smi text fields

use tracing::debug;

/// Reading used for a field that is absent or unparseable.
pub const SENTINEL: f64 = -1.0;

/// Extracts a number from a raw field such as `"45 %"`, `"11019 MiB"` or `"N/A"`.
///
/// Every character other than an ASCII digit or `.` is stripped and the
/// remainder parsed. An empty remainder, or one that is still not a number
/// (`"1.2.3"`), yields [`SENTINEL`].
pub fn sanitize(raw: &str) -> f64 {
    let digits: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect();

    if digits.is_empty() {
        return SENTINEL;
    }

    match digits.parse::<f64>() {
        Ok(value) => value,
        Err(e) => {
            debug!(raw, stripped = %digits, "Unparseable telemetry field: {}", e);
            SENTINEL
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strips_units() {
        assert_eq!(sanitize("45 %"), 45.0);
        assert_eq!(sanitize("11019 MiB"), 11019.0);
        assert_eq!(sanitize("64.17 W"), 64.17);
        assert_eq!(sanitize("1911 MHz"), 1911.0);
        assert_eq!(sanitize("83 C"), 83.0);
    }

    #[test]
    fn test_plain_numbers() {
        assert_eq!(sanitize("2"), 2.0);
        assert_eq!(sanitize("0"), 0.0);
        assert_eq!(sanitize("0.5"), 0.5);
        assert_eq!(sanitize(".5"), 0.5);
        assert_eq!(sanitize("5."), 5.0);
    }

    #[test]
    fn test_decoration_around_and_inside() {
        assert_eq!(sanitize("[12.5 W]"), 12.5);
        assert_eq!(sanitize("a1b2c3"), 123.0);
        // sign is decoration too
        assert_eq!(sanitize("-5 C"), 5.0);
    }

    #[test]
    fn test_absent_values_are_sentinel() {
        assert_eq!(sanitize(""), SENTINEL);
        assert_eq!(sanitize("N/A"), SENTINEL);
        assert_eq!(sanitize("[Not Supported]"), SENTINEL);
        assert_eq!(sanitize("   "), SENTINEL);
    }

    #[test]
    fn test_malformed_remainder_degrades_to_sentinel() {
        assert_eq!(sanitize("1.2.3"), SENTINEL);
        assert_eq!(sanitize("."), SENTINEL);
        assert_eq!(sanitize("v1.2.3 build"), SENTINEL);
    }
}
