//! Subject validation and wildcard matching.
//!
//! Subjects are `.`-separated tokens. In a subscription pattern `*` matches
//! exactly one token and `>` matches one or more trailing tokens.

/// Single token wildcard.
pub const WILDCARD_ONE: &str = "*";
/// Trailing multi-token wildcard.
pub const WILDCARD_TAIL: &str = ">";

/// Returns true if `subject` is a valid publish subject: non-empty tokens, no
/// whitespace, no wildcards.
pub fn is_valid_subject(subject: &str) -> bool {
    valid_tokens(subject) && subject.split('.').all(|t| t != WILDCARD_ONE && t != WILDCARD_TAIL)
}

/// Returns true if `pattern` is a valid subscription pattern. Wildcards must
/// be whole tokens and `>` may only appear last.
pub fn is_valid_pattern(pattern: &str) -> bool {
    if !valid_tokens(pattern) {
        return false;
    }
    let tokens: Vec<&str> = pattern.split('.').collect();
    tokens.iter().enumerate().all(|(i, t)| {
        if *t == WILDCARD_TAIL {
            i == tokens.len() - 1
        } else {
            *t == WILDCARD_ONE || !(t.contains('*') || t.contains('>'))
        }
    })
}

fn valid_tokens(s: &str) -> bool {
    !s.is_empty()
        && !s.chars().any(char::is_whitespace)
        && s.split('.').all(|t| !t.is_empty())
}

/// Check if `subject` matches subscription `pattern`.
pub fn matches(pattern: &str, subject: &str) -> bool {
    let mut pattern = pattern.split('.');
    let mut subject = subject.split('.');
    loop {
        match (pattern.next(), subject.next()) {
            (Some(WILDCARD_TAIL), Some(_)) => return true,
            (Some(WILDCARD_ONE), Some(_)) => {}
            (Some(p), Some(s)) if p == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match() {
        assert!(matches("test.pubsub", "test.pubsub"));
        assert!(!matches("test.pubsub", "test.pubsub.more"));
        assert!(!matches("test.pubsub", "test"));
    }

    #[test]
    fn test_single_token_wildcard() {
        assert!(matches("orders.*.created", "orders.eu.created"));
        assert!(!matches("orders.*.created", "orders.eu.west.created"));
        assert!(!matches("orders.*", "orders"));
    }

    #[test]
    fn test_tail_wildcard() {
        assert!(matches("orders.>", "orders.eu"));
        assert!(matches("orders.>", "orders.eu.west.created"));
        assert!(!matches("orders.>", "orders"));
        assert!(matches(">", "anything.at.all"));
    }

    #[test]
    fn test_validation() {
        assert!(is_valid_subject("a.b.c"));
        assert!(!is_valid_subject(""));
        assert!(!is_valid_subject("a..b"));
        assert!(!is_valid_subject("a b"));
        assert!(!is_valid_subject("a.*"));

        assert!(is_valid_pattern("a.*.c"));
        assert!(is_valid_pattern("a.>"));
        assert!(!is_valid_pattern("a.>.c"));
        assert!(!is_valid_pattern("a.b*"));
        assert!(!is_valid_pattern(".a"));
    }
}
