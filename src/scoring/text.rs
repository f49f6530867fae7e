//! Text cleanup before scoring.

use std::sync::LazyLock;

use regex::Regex;

/// Comments appended to a post's text.
pub const MAX_COMMENTS: usize = 5;

static BLOCKQUOTE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^>+\s*").unwrap());
static MD_LINK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[([^\]]+)\]\([^)]+\)").unwrap());
static BARE_URL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"https?://\S+").unwrap());
static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());
static NUMERIC_ENTITY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"&#(?:[xX]([0-9a-fA-F]{1,6})|([0-9]{1,7}));").unwrap());

/// Decode the HTML entities Reddit emits in post bodies.
///
/// `&amp;` goes last so an escaped entity like `&amp;lt;` decodes once.
fn decode_entities(text: &str) -> String {
    let text = text
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&nbsp;", " ");
    let text = NUMERIC_ENTITY.replace_all(&text, |caps: &regex::Captures| {
        let code = match (caps.get(1), caps.get(2)) {
            (Some(hex), _) => u32::from_str_radix(hex.as_str(), 16).ok(),
            (_, Some(dec)) => dec.as_str().parse::<u32>().ok(),
            _ => None,
        };
        match code.and_then(char::from_u32) {
            Some(c) => c.to_string(),
            None => caps[0].to_string(),
        }
    });
    text.replace("&amp;", "&")
}

/// Fold compatibility characters to their plain forms. Returns `None` for
/// characters that should be dropped.
fn fold_char(c: char) -> Option<char> {
    match c {
        '\u{200b}' | '\u{200c}' | '\u{200d}' | '\u{feff}' => None,
        '\u{a0}' | '\u{2007}' | '\u{202f}' | '\u{3000}' => Some(' '),
        '\u{2018}' | '\u{2019}' | '\u{201b}' => Some('\''),
        '\u{201c}' | '\u{201d}' => Some('"'),
        '\u{2013}' | '\u{2014}' => Some('-'),
        // Fullwidth ASCII block.
        '\u{ff01}'..='\u{ff5e}' => char::from_u32(c as u32 - 0xfee0),
        c => Some(c),
    }
}

/// Normalize Reddit markdown into plain prose.
pub fn clean_text(text: &str) -> String {
    let text: String = decode_entities(text)
        .replace('\u{2026}', "...")
        .chars()
        .filter_map(fold_char)
        .collect();
    let text = BLOCKQUOTE.replace_all(&text, "");
    let text = MD_LINK.replace_all(&text, "$1");
    let text = BARE_URL.replace_all(&text, "");
    WHITESPACE.replace_all(&text, " ").trim().to_string()
}

/// Truncate to at most `max_chars` characters on a char boundary.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Build the scorer input for a post: title, body, then up to five comments.
pub fn prepare_for_input(title: &str, body: &str, comments: &[String]) -> String {
    let mut parts = Vec::with_capacity(2 + MAX_COMMENTS);
    for piece in [title, body] {
        let cleaned = clean_text(piece);
        if !cleaned.is_empty() {
            parts.push(cleaned);
        }
    }
    parts.extend(
        comments
            .iter()
            .map(|c| clean_text(c))
            .filter(|c| !c.is_empty())
            .take(MAX_COMMENTS),
    );
    parts.join("\n")
}
