/// Format an integer with comma thousands separators (`1234567` -> `1,234,567`).
pub fn group_thousands(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

/// Product of a tensor shape; a scalar (empty shape) has one element.
/// `None` when the product overflows `u64`.
pub fn checked_numel(shape: &[u64]) -> Option<u64> {
    shape.iter().try_fold(1u64, |acc, &d| acc.checked_mul(d))
}

/// Share of `part` in `whole` as a percentage. Zero when `whole` is zero.
pub fn percent_of(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    part as f64 / whole as f64 * 100.0
}

/// Human-readable parameter count (`7.0B`, `1.5M`, `12.3K`).
pub fn format_params(n: u64) -> String {
    match n {
        n if n >= 1_000_000_000 => format!("{:.1}B", n as f64 / 1e9),
        n if n >= 1_000_000 => format!("{:.1}M", n as f64 / 1e6),
        n if n >= 1_000 => format!("{:.1}K", n as f64 / 1e3),
        n => n.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_thousands() {
        assert_eq!(group_thousands(0), "0");
        assert_eq!(group_thousands(999), "999");
        assert_eq!(group_thousands(1_000), "1,000");
        assert_eq!(group_thousands(124_439_808), "124,439,808");
    }

    #[test]
    fn test_checked_numel() {
        assert_eq!(checked_numel(&[]), Some(1));
        assert_eq!(checked_numel(&[50_304, 768]), Some(38_633_472));
        assert_eq!(checked_numel(&[1 << 32, 1 << 32]), None);
        assert_eq!(checked_numel(&[0, 1 << 40, 1 << 40]), Some(0));
    }

    #[test]
    fn test_percent_of_zero_whole() {
        assert_eq!(percent_of(5, 0), 0.0);
        assert!((percent_of(1, 4) - 25.0).abs() < 1e-9);
    }

    #[test]
    fn test_format_params() {
        assert_eq!(format_params(7_000_000_000), "7.0B");
        assert_eq!(format_params(1_500_000), "1.5M");
        assert_eq!(format_params(12_300), "12.3K");
        assert_eq!(format_params(42), "42");
    }
}
