//! Input sanitization for outgoing user turns.
//!
//! Removes terminal escape sequences and executable markup (script-like
//! elements, inline event handlers, `javascript:` URLs) while keeping the
//! text's line breaks and tabs. Those are swapped for private-use
//! placeholders before stripping and restored afterwards, since the escape
//! stripper treats them as control characters. Placeholder characters already
//! present in the input are escaped so they come back unchanged.

use std::sync::LazyLock;

use regex::Regex;

const NEWLINE_MARK: char = '\u{E000}';
const TAB_MARK: char = '\u{E001}';
const ESCAPE_MARK: char = '\u{E002}';

const BLOCK_ELEMENTS: &[&str] = &["script", "style", "iframe", "object", "embed", "noscript"];

static BLOCKS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    BLOCK_ELEMENTS
        .iter()
        .map(|tag| {
            Regex::new(&format!(r"(?is)<{tag}\b[^>]*>.*?</{tag}\s*>")).expect("static pattern")
        })
        .collect()
});

static STRAY_TAGS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)</?(script|style|iframe|object|embed|noscript|link|meta|base|form)\b[^>]*>")
        .expect("static pattern")
});

static OPEN_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<[a-zA-Z][^>]*>").expect("static pattern"));

static UNSAFE_ATTR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)\s+(on[a-z]+\s*=\s*("[^"]*"|'[^']*'|[^\s>]+)|(href|src|action)\s*=\s*("\s*javascript:[^"]*"|'\s*javascript:[^']*'|javascript:[^\s>]*))"#,
    )
    .expect("static pattern")
});

fn protect(text: &str) -> String {
    let text = text.replace("\r\n", "\n").replace('\r', "\n");
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\n' => out.push(NEWLINE_MARK),
            '\t' => out.push(TAB_MARK),
            NEWLINE_MARK | TAB_MARK | ESCAPE_MARK => {
                out.push(ESCAPE_MARK);
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out
}

fn restore(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        match c {
            ESCAPE_MARK => out.extend(chars.next()),
            NEWLINE_MARK => out.push('\n'),
            TAB_MARK => out.push('\t'),
            c => out.push(c),
        }
    }
    out
}

fn strip_markup(mut text: String) -> String {
    for re in BLOCKS.iter() {
        text = re.replace_all(&text, "").into_owned();
    }
    text = STRAY_TAGS.replace_all(&text, "").into_owned();
    OPEN_TAG
        .replace_all(&text, |caps: &regex::Captures| {
            UNSAFE_ATTR.replace_all(&caps[0], "").into_owned()
        })
        .into_owned()
}

/// Sanitized form of raw user input, trimmed. Literal line breaks survive.
pub fn sanitize_input(raw: &str) -> String {
    let protected = protect(raw);
    let stripped = strip_ansi_escapes::strip_str(&protected);
    let cleaned = strip_markup(stripped);
    restore(&cleaned).trim().to_string()
}
