//! Tokenizer for whitespace-separated system tables (`crypttab`, `mtab`, `fstab`).

use crate::error::KeydriveResult;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

/// Read `path` and tokenize every non-empty, non-comment line.
///
/// A missing file reads as an empty table.
pub fn read_tab_file(path: &Path) -> KeydriveResult<Vec<Vec<String>>> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(tokenize(&contents)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(Vec::new()),
        Err(err) => Err(err.into()),
    }
}

/// Split `contents` into lines of whitespace-separated tokens, top to bottom.
pub fn tokenize(contents: &str) -> Vec<Vec<String>> {
    contents
        .lines()
        .map(strip_comment)
        .map(|line| {
            line.split_whitespace()
                .map(str::to_string)
                .collect::<Vec<_>>()
        })
        .filter(|tokens| !tokens.is_empty())
        .collect()
}

/// Drop everything from the first `#` that is not preceded by a backslash.
fn strip_comment(line: &str) -> &str {
    let bytes = line.as_bytes();
    for (idx, byte) in bytes.iter().enumerate() {
        if *byte == b'#' && (idx == 0 || bytes[idx - 1] != b'\\') {
            return &line[..idx];
        }
    }
    line
}
