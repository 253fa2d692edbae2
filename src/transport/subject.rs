//! Dot-separated subjects with `*` (one token) and `>` (rest) wildcards.

/// Check whether `subject` matches `pattern`.
///
/// Wildcards in `subject` are compared literally, so a filter subject such as
/// `A.1.EVENT.*` is covered by a stream pattern `A.>`.
pub fn matches(pattern: &str, subject: &str) -> bool {
    let mut pattern = pattern.split('.');
    let mut subject = subject.split('.');

    loop {
        match (pattern.next(), subject.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(s)) if p == s => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Check whether some subject could match both patterns.
pub fn overlaps(a: &str, b: &str) -> bool {
    let mut a = a.split('.');
    let mut b = b.split('.');

    loop {
        match (a.next(), b.next()) {
            (Some(">"), Some(_)) | (Some(_), Some(">")) => return true,
            (Some(x), Some(y)) if x == "*" || y == "*" || x == y => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Check that a token can name a collection: non-empty, no separator,
/// wildcard or whitespace.
pub fn is_valid_token(token: &str) -> bool {
    !token.is_empty() && !token.chars().any(|c| c == '.' || c == '*' || c == '>' || c.is_whitespace())
}

/// Check that a subject is non-empty and has no empty tokens.
pub fn is_valid(subject: &str) -> bool {
    !subject.is_empty() && subject.split('.').all(|t| !t.is_empty())
}
