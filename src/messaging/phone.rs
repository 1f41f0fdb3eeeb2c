//! Phone number normalization.
//!
//! Numbers are stored and compared as bare international digits
//! (`34600111222`): no `+`, no `00` prefix, no separators.

/// Shortest and longest digit strings accepted as a phone number.
const MIN_DIGITS: usize = 8;
const MAX_DIGITS: usize = 15;

/// Length of a national number that gets the default country code.
const NATIONAL_DIGITS: usize = 9;

/// Normalize `raw` to international digits, or `None` if it cannot be a
/// phone number.
pub fn normalize_phone(raw: &str, default_country_code: &str) -> Option<String> {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    let digits = digits.strip_prefix("00").unwrap_or(&digits).to_string();

    let digits = if digits.len() == NATIONAL_DIGITS {
        format!("{default_country_code}{digits}")
    } else {
        digits
    };

    (MIN_DIGITS..=MAX_DIGITS)
        .contains(&digits.len())
        .then_some(digits)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_formatting() {
        assert_eq!(normalize_phone("+34 600 11 12 22", "34").as_deref(), Some("34600111222"));
        assert_eq!(normalize_phone("0034-600-111-222", "34").as_deref(), Some("34600111222"));
        assert_eq!(normalize_phone("34600111222", "34").as_deref(), Some("34600111222"));
    }

    #[test]
    fn national_number_gets_country_code() {
        assert_eq!(normalize_phone("600 111 222", "34").as_deref(), Some("34600111222"));
        assert_eq!(normalize_phone("912345678", "351").as_deref(), Some("351912345678"));
    }

    #[test]
    fn rejects_non_numbers() {
        assert_eq!(normalize_phone("", "34"), None);
        assert_eq!(normalize_phone("hola", "34"), None);
        assert_eq!(normalize_phone("12345", "34"), None);
        assert_eq!(normalize_phone("1234567890123456", "34"), None);
    }
}
