//! Confirmation-code extraction.

use std::sync::LazyLock;

use regex::Regex;

/// Ordered matchers: specifically labeled patterns first, a bare 6-digit
/// run as the fallback. First match wins.
static PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)verification code[:\s]+(\d{6})",
        r"(?i)confirmation code[:\s]+(\d{6})",
        r"(?i)your code is[:\s]+(\d{6})",
        r"(?i)code[:\s]+(\d{6})",
        r"\b(\d{6})\b",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static pattern"))
    .collect()
});

/// Extract a 6-digit confirmation code from a message body.
pub fn extract_code(body: &str) -> Option<String> {
    for pattern in PATTERNS.iter() {
        if let Some(caps) = pattern.captures(body) {
            return Some(caps[1].to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labeled_verification_code() {
        assert_eq!(
            extract_code("Your verification code: 123456. It expires soon."),
            Some("123456".into())
        );
    }

    #[test]
    fn labeled_your_code_is() {
        assert_eq!(
            extract_code("Your code is 654321"),
            Some("654321".into())
        );
    }

    #[test]
    fn labeled_pattern_beats_earlier_bare_digits() {
        // An order id appears first, but the labeled code must win.
        let body = "Order 999999 confirmed.\nVerification code: 482910";
        assert_eq!(extract_code(body), Some("482910".into()));
    }

    #[test]
    fn bare_six_digit_fallback() {
        assert_eq!(extract_code("use 482910 to continue"), Some("482910".into()));
    }

    #[test]
    fn case_insensitive_labels() {
        assert_eq!(
            extract_code("VERIFICATION CODE: 111222"),
            Some("111222".into())
        );
    }

    #[test]
    fn no_code_present() {
        assert_eq!(extract_code("hello, nothing to see here 1234"), None);
    }

    #[test]
    fn seven_digit_run_is_not_a_code() {
        assert_eq!(extract_code("ref 1234567"), None);
    }
}
