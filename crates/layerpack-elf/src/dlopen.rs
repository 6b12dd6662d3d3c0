//! Heuristic recovery of libraries an entry point loads by name.
//!
//! Nothing here parses ELF structures: the symbol and string tables are
//! probed through the printable strings of the file, which is enough to
//! see `__libc_start_main`, `dlopen` and literal library names.

use crate::ElfError;
use layerpack_schema::DEFAULT_DLOPEN_PATTERN;
use regex::Regex;
use std::collections::BTreeSet;

/// Symbol the C runtime startup code references in every program.
pub const ENTRY_SYMBOL: &str = "__libc_start_main";

const DLOPEN_SYMBOL: &str = "dlopen";

/// Longest token accepted as a library name.
pub const MAX_TOKEN_LEN: usize = 255;

/// Shortest printable run kept by [`printable_strings`] in the scanner.
pub const MIN_STRING_LEN: usize = 4;

/// Runs of printable ASCII at least `min_len` bytes long.
pub fn printable_strings(bytes: &[u8], min_len: usize) -> Vec<String> {
    bytes
        .split(|b| !(b.is_ascii_graphic() || *b == b' ' || *b == b'\t'))
        .filter(|run| run.len() >= min_len.max(1))
        .map(|run| String::from_utf8_lossy(run).into_owned())
        .collect()
}

/// True when the strings show the C runtime startup symbol.
pub fn is_entry_point(strings: &[String]) -> bool {
    strings.iter().any(|s| s.contains(ENTRY_SYMBOL))
}

pub fn references_dlopen(strings: &[String]) -> bool {
    strings.iter().any(|s| s.contains(DLOPEN_SYMBOL))
}

/// Matcher for library-name tokens such as `libfoo.so.1`.
#[derive(Debug, Clone)]
pub struct LibraryNamePattern {
    regex: Regex,
}

impl LibraryNamePattern {
    /// The built-in `name.so[.digits]*` matcher.
    pub fn standard() -> Result<Self, ElfError> {
        Self::new(DEFAULT_DLOPEN_PATTERN)
    }

    pub fn new(pattern: &str) -> Result<Self, ElfError> {
        let regex =
            Regex::new(pattern).map_err(|e| ElfError::InvalidPattern(format!("{pattern}: {e}")))?;
        Ok(Self { regex })
    }

    pub fn as_str(&self) -> &str {
        self.regex.as_str()
    }

    /// Library-name tokens found in `text`.
    ///
    /// A match directly followed by a name character or `.` is part of a
    /// longer word (`libfoo.so.conf`) and is dropped, and so is a match that
    /// starts in the middle of a word.
    pub fn tokens_in<'a>(&'a self, text: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.regex.find_iter(text).filter_map(move |m| {
            let next = text[m.end()..].chars().next();
            if next.is_some_and(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.') {
                return None;
            }
            let prev = text[..m.start()].chars().next_back();
            if prev.is_some_and(|c| c.is_ascii_alphanumeric() || "_+-.".contains(c)) {
                return None;
            }
            let token = m.as_str().trim();
            (!token.is_empty() && token.len() <= MAX_TOKEN_LEN).then_some(token)
        })
    }

    /// Every distinct token across `strings`, sorted.
    pub fn tokens(&self, strings: &[String]) -> BTreeSet<String> {
        strings
            .iter()
            .flat_map(|s| self.tokens_in(s))
            .map(str::to_owned)
            .collect()
    }
}

/// Tokens an object's bytes name, or nothing when it is not an entry point
/// that calls `dlopen`.
pub fn scan_entry_point(bytes: &[u8], pattern: &LibraryNamePattern) -> Option<BTreeSet<String>> {
    let strings = printable_strings(bytes, MIN_STRING_LEN);
    if !is_entry_point(&strings) || !references_dlopen(&strings) {
        return None;
    }
    Some(pattern.tokens(&strings))
}
