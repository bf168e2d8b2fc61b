//! Line-comment stripping for manifest text.
//!
//! Manifests may carry `//` comments. They are removed by a single pass
//! that tracks string literals, so a `//` inside `"http://example.com"` is
//! left alone. Block comments are not supported.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommentError {
    #[error("Unterminated string literal starting at byte {0}")]
    UnterminatedString(usize),

    #[error("Unexpected '/' at byte {0}")]
    UnexpectedSlash(usize),
}

/// Remove `//` line comments outside string literals.
///
/// The newline ending a comment is kept so that JSON error positions
/// still point at the right line.
pub fn strip_comments(text: &str) -> Result<String, CommentError> {
    let bytes = text.as_bytes();
    let mut out = String::with_capacity(text.len());
    let mut i = 0;
    // Start of the run of bytes that will be copied verbatim.
    let mut copy_from = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'"' => {
                let start = i;
                i += 1;
                loop {
                    match bytes.get(i) {
                        None => return Err(CommentError::UnterminatedString(start)),
                        Some(b'\\') => i += 2,
                        Some(b'"') => {
                            i += 1;
                            break;
                        }
                        Some(_) => i += 1,
                    }
                }
            }
            b'/' => {
                if bytes.get(i + 1) != Some(&b'/') {
                    return Err(CommentError::UnexpectedSlash(i));
                }
                out.push_str(&text[copy_from..i]);
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
                copy_from = i;
            }
            _ => i += 1,
        }
    }

    out.push_str(&text[copy_from..]);
    Ok(out)
}
