//! Domain-suffix allow-list.
//!
//! Rules are tried in order and the first match wins:
//! - a rule starting with `.` matches any name ending in it (so a bare
//!   `example.com` does not match `.example.com`);
//! - a name equal to the rule matches;
//! - a name ending in `"." + rule` matches.

/// Return the first rule in `suffixes` that `domain` matches.
pub fn first_match<'a>(domain: &str, suffixes: &'a [String]) -> Option<&'a str> {
    suffixes
        .iter()
        .map(String::as_str)
        .find(|suffix| matches_suffix(domain, suffix))
}

fn matches_suffix(domain: &str, suffix: &str) -> bool {
    if suffix.is_empty() || !domain.ends_with(suffix) {
        return false;
    }
    if suffix.starts_with('.') || domain.len() == suffix.len() {
        return true;
    }
    domain.as_bytes()[domain.len() - suffix.len() - 1] == b'.'
}
