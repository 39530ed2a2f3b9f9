//! POSIX shell quoting.
//!
//! Every string that ends up inside a generated script goes through [`quote`].
//! Single quotes are the only POSIX quoting form with no escape processing,
//! so a word is either left bare (when it only contains characters no shell
//! treats specially) or wrapped in single quotes, with embedded single quotes
//! spliced in as `'"'"'`.

use std::borrow::Cow;

/// Quote a single word for a POSIX shell.
pub fn quote(word: &str) -> Cow<'_, str> {
    if word.is_empty() {
        return Cow::Borrowed("''");
    }
    if word.bytes().all(is_bare_safe) {
        return Cow::Borrowed(word);
    }
    Cow::Owned(format!("'{}'", escape_for_single_quotes(word)))
}

/// Quote each word and join them with spaces, producing one command line.
pub fn quote_args<S: AsRef<str>>(words: &[S]) -> String {
    words
        .iter()
        .map(|w| quote(w.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Escape a string for placement between single quotes.
///
/// The caller supplies the surrounding quotes.
pub fn escape_for_single_quotes(s: &str) -> String {
    s.replace('\'', r#"'"'"'"#)
}

fn is_bare_safe(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.' | b'/' | b':' | b'=' | b'@' | b'%' | b'+' | b',')
}
