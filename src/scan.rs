//! Tokenizing helpers for the tab-separated line protocol.
//!
//! Everything operates on borrowed `&str` slices of the assembled line;
//! nothing here copies.

/// Longest allowed name, including room for the NUL the exec path appends.
pub const NAME_BUF_SIZE: usize = 64;

/// Pulls the next tab-separated field off the front of `rest`, advancing
/// past the delimiter. Returns `None` once the line is exhausted.
pub fn next_field<'a>(rest: &mut &'a str) -> Option<&'a str> {
    if rest.is_empty() {
        return None;
    }
    match rest.find('\t') {
        Some(i) => {
            let field = &rest[..i];
            *rest = &rest[i + 1..];
            Some(field)
        }
        None => {
            let field = *rest;
            *rest = "";
            Some(field)
        }
    }
}

/// Iterates the remaining fields of a line tail. An empty tail yields no
/// fields (unlike `str::split`, which would yield one empty item).
pub fn fields(tail: &str) -> impl Iterator<Item = &str> {
    let mut rest = tail;
    std::iter::from_fn(move || next_field(&mut rest))
}

/// Service and fd names: `[A-Za-z0-9._-]`, nonempty, bounded.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() < NAME_BUF_SIZE
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
}

/// Lines starting with whitespace or `#` are comments, for config-file
/// compatibility.
pub fn is_comment(line: &str) -> bool {
    match line.bytes().next() {
        None => true,
        Some(b'#') => true,
        Some(b) => b.is_ascii_whitespace(),
    }
}

// === Tests === //

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn splits_and_advances() {
        let mut rest = "service.args\tfoo\ta b\tc";
        assert_eq!(next_field(&mut rest), Some("service.args"));
        assert_eq!(next_field(&mut rest), Some("foo"));
        assert_eq!(next_field(&mut rest), Some("a b"));
        assert_eq!(next_field(&mut rest), Some("c"));
        assert_eq!(next_field(&mut rest), None);
    }

    #[test]
    fn empty_fields_are_preserved_inside() {
        let mut rest = "a\t\tb";
        assert_eq!(next_field(&mut rest), Some("a"));
        assert_eq!(next_field(&mut rest), Some(""));
        assert_eq!(next_field(&mut rest), Some("b"));
        assert_eq!(next_field(&mut rest), None);
    }

    #[test]
    fn empty_tail_yields_nothing() {
        assert_eq!(fields("").count(), 0);
        assert_eq!(fields("one").count(), 1);
    }

    #[test]
    fn name_validation() {
        assert!(is_valid_name("sshd"));
        assert!(is_valid_name("db.primary-1_a"));
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("has space"));
        assert!(!is_valid_name("tab\there"));
        assert!(!is_valid_name(&"x".repeat(NAME_BUF_SIZE)));
        assert!(is_valid_name(&"x".repeat(NAME_BUF_SIZE - 1)));
    }

    #[test]
    fn comment_lines() {
        assert!(is_comment("# config header"));
        assert!(is_comment("  indented"));
        assert!(is_comment(""));
        assert!(!is_comment("statedump"));
    }
}
