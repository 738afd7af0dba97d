use std::sync::{Mutex, MutexGuard, PoisonError};

/// Escapes a raw argument into its wire form using the eight valid escape
/// characters. An empty argument becomes `\@`. The inverse lives in the
/// message parser, which decodes arguments as it recognizes them.
pub fn escape(input: &str) -> String {
    if input.is_empty() {
        return r"\@".to_owned();
    }
    let mut escaped = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '\\' => escaped.push_str(r"\\"),
            ' ' => escaped.push_str(r"\_"),
            '\0' => escaped.push_str(r"\0"),
            '\n' => escaped.push_str(r"\n"),
            '\r' => escaped.push_str(r"\r"),
            '\u{1b}' => escaped.push_str(r"\e"),
            '\t' => escaped.push_str(r"\t"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// Locks a mutex, recovering the guard if a previous holder panicked. The
/// server must keep running through a poisoned lock, so the poison flag is
/// ignored everywhere.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod strings {
    use super::*;

    #[test]
    fn test_escape() {
        assert_eq!(r"This\_is\_my\_foo\n", escape("This is my foo\n"));
        assert_eq!(r"a\\b\0c\td", escape("a\\b\0c\td"));
    }

    #[test]
    fn test_empty() {
        assert_eq!(r"\@", escape(""));
    }

    #[test]
    fn test_backslash_then_underscore() {
        // A literal backslash followed by a literal underscore stays two
        // separate escapes on the wire
        assert_eq!(r"\\_", escape(r"\_"));
    }
}
