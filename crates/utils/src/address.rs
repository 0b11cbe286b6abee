//! Lightweight email address checks used before forwarding.
//!
//! This is a shape filter (`local-part@domain.tld`), not a full RFC 5321
//! parser, it only rejects values that obviously cannot be replied to.

use std::sync::LazyLock;

use regex::Regex;

static ADDRESS_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("address pattern must compile")
});

/// Returns whether `address` has the `local-part@domain-with-dot` shape.
///
/// # Examples
///
/// ```rust
/// assert!(mailrelay_utils::is_valid_address("test@example.com"));
/// assert!(!mailrelay_utils::is_valid_address("invalid-email"));
/// ```
pub fn is_valid_address(address: &str) -> bool {
    ADDRESS_PATTERN.is_match(address)
}

/// Extracts the address from an SMTP path argument such as
/// `FROM:<alice@example.com> SIZE=1024`.
///
/// The `prefix` (e.g. `FROM:` or `TO:`) is matched case-insensitively,
/// surrounding angle brackets are removed and ESMTP parameters after the
/// path are ignored. Returns `None` when the prefix is missing.
pub fn parse_smtp_path<'a>(value: &'a str, prefix: &str) -> Option<&'a str> {
    let head = value.get(..prefix.len())?;
    if !head.eq_ignore_ascii_case(prefix) {
        return None;
    }
    let path = value[prefix.len()..].trim_start();
    let path = match path.strip_prefix('<') {
        Some(rest) => rest.split_once('>').map(|(inner, _)| inner)?,
        None => path.split_whitespace().next().unwrap_or_default(),
    };
    Some(path.trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_addresses() {
        assert!(is_valid_address("test@example.com"));
        assert!(is_valid_address("first.last+tag@sub.example.co.uk"));
        assert!(is_valid_address("a@b.c"));
    }

    #[test]
    fn test_invalid_addresses() {
        assert!(!is_valid_address("invalid-email"));
        assert!(!is_valid_address(""));
        assert!(!is_valid_address("user@localhost"));
        assert!(!is_valid_address("@example.com"));
        assert!(!is_valid_address("user@@example.com"));
        assert!(!is_valid_address("user name@example.com"));
        assert!(!is_valid_address("user@example.com "));
    }

    #[test]
    fn test_parse_smtp_path() {
        assert_eq!(
            parse_smtp_path("FROM:<alice@example.com>", "FROM:"),
            Some("alice@example.com")
        );
        assert_eq!(
            parse_smtp_path("from: <alice@example.com> SIZE=1024", "FROM:"),
            Some("alice@example.com")
        );
        assert_eq!(
            parse_smtp_path("TO:bob@example.com", "TO:"),
            Some("bob@example.com")
        );
        assert_eq!(parse_smtp_path("FROM:<>", "FROM:"), Some(""));
    }

    #[test]
    fn test_parse_smtp_path_invalid() {
        assert_eq!(parse_smtp_path("alice@example.com", "FROM:"), None);
        assert_eq!(parse_smtp_path("TO:<bob@example.com>", "FROM:"), None);
        assert_eq!(parse_smtp_path("FROM:<unterminated", "FROM:"), None);
        assert_eq!(parse_smtp_path("FR", "FROM:"), None);
    }
}
