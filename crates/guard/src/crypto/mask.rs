//! Masking of sensitive values for display and logs.
//!
//! Masking is one-way and keyless; it never substitutes for encryption.

/// Characters left visible by [`mask_field`] by default.
pub const DEFAULT_VISIBLE: usize = 4;

/// At most this many `*` precede the visible tail.
const MAX_STARS: usize = 8;

/// Returned when nothing of the value may be shown.
const FULLY_MASKED: &str = "****";

/// Replace all but the last `show_last` characters of `value` with `*`.
///
/// Values no longer than `show_last` are masked completely. The star run is
/// capped so the output does not reveal the length of long values.
pub fn mask_field(value: &str, show_last: usize) -> String {
    let len = value.chars().count();
    if len == 0 || len <= show_last {
        return FULLY_MASKED.to_owned();
    }
    let stars = (len - show_last).min(MAX_STARS);
    let tail: String = value.chars().skip(len - show_last).collect();
    format!("{}{tail}", "*".repeat(stars))
}

/// Mask a social security number as `***-**-1234`.
///
/// Formatting characters are ignored; input that does not hold exactly nine
/// digits falls back to [`mask_field`].
pub fn mask_ssn(ssn: &str) -> String {
    if ssn.is_empty() {
        return "***-**-****".to_owned();
    }
    let digits: String = ssn.chars().filter(char::is_ascii_digit).collect();
    if digits.len() != 9 {
        return mask_field(ssn, DEFAULT_VISIBLE);
    }
    format!("***-**-{}", &digits[5..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_last_four() {
        assert_eq!(mask_field("555-0199", DEFAULT_VISIBLE), "****0199");
        assert_eq!(mask_field("abcdef", 2), "****ef");
    }

    #[test]
    fn short_values_are_fully_masked() {
        assert_eq!(mask_field("", DEFAULT_VISIBLE), "****");
        assert_eq!(mask_field("1234", DEFAULT_VISIBLE), "****");
        assert_eq!(mask_field("12", DEFAULT_VISIBLE), "****");
    }

    #[test]
    fn star_run_is_capped() {
        let id = "7c9e6679-7425-40de-944b-e07fc1f90ae7";
        assert_eq!(mask_field(id, DEFAULT_VISIBLE), "********0ae7");
    }

    #[test]
    fn counts_characters_not_bytes() {
        assert_eq!(mask_field("Zoë Núñez", 3), "******ñez");
    }

    #[test]
    fn ssn_shows_last_four_digits() {
        assert_eq!(mask_ssn("123-45-6789"), "***-**-6789");
        assert_eq!(mask_ssn("123456789"), "***-**-6789");
        assert_eq!(mask_ssn("123 45 6789"), "***-**-6789");
    }

    #[test]
    fn malformed_ssn_falls_back() {
        assert_eq!(mask_ssn(""), "***-**-****");
        assert_eq!(mask_ssn("12-345"), "**2345");
        assert_eq!(mask_ssn("1234567890"), "******7890");
    }
}
