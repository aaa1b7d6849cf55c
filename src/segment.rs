//! Streaming text segmentation for speech synthesis.
//!
//! LLM output arrives as markdown-flavored token fragments. Before anything
//! reaches the TTS engine it is cleaned into speakable plain text, then cut
//! into sentence-sized chunks at punctuation, clause separators, newlines,
//! or a hard word bound. All functions are pure; streaming callers append
//! tokens to a buffer and drain complete sentences between appends.

use regex::Regex;
use std::sync::LazyLock;

/// Hard upper bound on words per emitted chunk.
pub const MAX_WORDS_PER_CHUNK: usize = 20;

/// Trailing-period tokens that do not end a sentence.
const ABBREVIATIONS: &[&str] = &[
    "mr", "mrs", "ms", "dr", "prof", "sr", "jr", "vs", "etc", "e.g", "i.e", "st", "ave", "blvd",
    "inc", "ltd", "corp",
];

static FENCED_CODE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)```.*?```").unwrap());
static IMAGE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"!\[[^\]]*\]\([^)]*\)").unwrap());
static LINK: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\[([^\]]*)\]\([^)]*\)").unwrap());
static BOLD_ITALIC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\*\*\*([^*]+)\*\*\*").unwrap());
static BOLD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\*\*([^*]+)\*\*").unwrap());
static BOLD_UNDERSCORE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"__([^_]+)__").unwrap());
static ITALIC: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\*([^*]+)\*").unwrap());
static ITALIC_UNDERSCORE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"_([^_]+)_").unwrap());
static STRIKETHROUGH: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"~~([^~]+)~~").unwrap());
static INLINE_CODE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"`([^`]+)`").unwrap());
static HEADER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^[ \t]*#{1,6}[ \t]+").unwrap());
static BULLET: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^[ \t]*[-*+][ \t]+").unwrap());
static NUMBERED: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^[ \t]*\d+\.[ \t]+").unwrap());
static BLOCKQUOTE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^[ \t]*>[ \t]?").unwrap());
static HORIZONTAL_RULE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^[ \t]*-{3,}[ \t]*$").unwrap());
static URL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"https?://\S+").unwrap());
static ELLIPSIS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\.{2,3}").unwrap());
static LEFTOVER_SYMBOLS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[*#`~|><{}\[\]\\]").unwrap());

/// Strip markdown structure and unspeakable symbols from a text fragment.
pub fn clean(text: &str) -> String {
    let text = FENCED_CODE.replace_all(text, "");
    let text = IMAGE.replace_all(&text, "");
    let text = LINK.replace_all(&text, "$1");
    let text = BOLD_ITALIC.replace_all(&text, "$1");
    let text = BOLD.replace_all(&text, "$1");
    let text = BOLD_UNDERSCORE.replace_all(&text, "$1");
    let text = ITALIC.replace_all(&text, "$1");
    let text = ITALIC_UNDERSCORE.replace_all(&text, "$1");
    let text = STRIKETHROUGH.replace_all(&text, "$1");
    let text = INLINE_CODE.replace_all(&text, "$1");
    let text = HEADER.replace_all(&text, "");
    let text = BULLET.replace_all(&text, "");
    let text = NUMBERED.replace_all(&text, "");
    let text = BLOCKQUOTE.replace_all(&text, "");
    let text = HORIZONTAL_RULE.replace_all(&text, "");
    let text = text.replace('|', " ");
    let text = URL.replace_all(&text, "");

    // Spoken forms for symbols the TTS would otherwise mangle.
    let text = text
        .replace('&', " and ")
        .replace('%', " percent ")
        .replace('+', " plus ")
        .replace('=', " equals ")
        .replace('@', " at ")
        .replace('/', " slash ");
    let text = ELLIPSIS.replace_all(&text, ", ");
    let text = LEFTOVER_SYMBOLS.replace_all(&text, "");

    // Collapse horizontal whitespace per line, drop empty lines.
    let mut lines: Vec<String> = Vec::new();
    for line in text.lines() {
        let collapsed = line.split_whitespace().collect::<Vec<_>>().join(" ");
        if !collapsed.is_empty() {
            lines.push(collapsed);
        }
    }
    lines.join("\n").trim().to_owned()
}

/// Scan a streaming buffer for the first complete sentence.
///
/// Returns `(Some(sentence), rest)` when a boundary is found, where `rest`
/// is the cleaned remainder. Returns `(None, buf)` with the buffer
/// unchanged when no boundary exists yet, so the caller can keep
/// appending tokens.
pub fn extract_complete_sentence(buf: &str) -> (Option<String>, String) {
    let cleaned = clean(buf);
    if cleaned.is_empty() {
        return (None, buf.to_owned());
    }

    let chars: Vec<(usize, char)> = cleaned.char_indices().collect();
    let mut word_count = 0usize;
    let mut in_word = false;

    for (k, &(i, c)) in chars.iter().enumerate() {
        let next = chars.get(k + 1).map(|&(_, ch)| ch);

        // Strong boundary: newline.
        if c == '\n' {
            return emit(buf, &cleaned, i, i + 1);
        }

        // Clause separators followed by a space; keep the separator.
        if matches!(c, ';' | ':' | '—' | '–') && next == Some(' ') {
            let end = i + c.len_utf8();
            return emit(buf, &cleaned, end, end);
        }

        // Terminators followed by whitespace or end of buffer.
        if matches!(c, '.' | '?' | '!') && next.is_none_or(char::is_whitespace) {
            let breaks = match c {
                '.' => !ends_in_abbreviation(&cleaned[..=i]) && !mid_decimal(&chars, k),
                _ => true,
            };
            if breaks {
                return emit(buf, &cleaned, i + 1, i + 1);
            }
        }

        // Word bound: force a break once 20 words have accumulated.
        if c.is_whitespace() {
            in_word = false;
            if word_count >= MAX_WORDS_PER_CHUNK {
                return emit(buf, &cleaned, i, i + c.len_utf8());
            }
        } else if !in_word {
            in_word = true;
            word_count += 1;
        }
    }

    (None, buf.to_owned())
}

fn emit(original: &str, cleaned: &str, sentence_end: usize, rest_start: usize) -> (Option<String>, String) {
    let sentence = cleaned[..sentence_end].trim();
    if sentence.is_empty() {
        return (None, original.to_owned());
    }
    (
        Some(sentence.to_owned()),
        cleaned[rest_start..].trim_start().to_owned(),
    )
}

/// Whether the final whitespace-delimited token of `text` (which ends with
/// a period) is a known abbreviation.
fn ends_in_abbreviation(text: &str) -> bool {
    let token = text
        .rsplit(char::is_whitespace)
        .next()
        .unwrap_or(text)
        .trim_end_matches('.');
    if token.is_empty() {
        return false;
    }
    let lower = token.to_lowercase();
    ABBREVIATIONS.contains(&lower.as_str())
}

/// Whether the period at index `k` sits inside a decimal number. At the end
/// of a streaming buffer a digit-period tail is treated as a decimal in
/// progress.
fn mid_decimal(chars: &[(usize, char)], k: usize) -> bool {
    let prev_is_digit = k > 0 && chars[k - 1].1.is_ascii_digit();
    if !prev_is_digit {
        return false;
    }
    match chars.get(k + 1) {
        Some(&(_, next)) => next.is_ascii_digit(),
        None => true,
    }
}

/// Whether the trimmed text ends with a question mark.
pub fn ends_with_question(text: &str) -> bool {
    text.trim_end().ends_with('?')
}

/// The last sentence, if it is a question.
pub fn extract_last_question(sentences: &[String]) -> Option<String> {
    sentences
        .last()
        .filter(|s| ends_with_question(s))
        .cloned()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    // ── clean ───────────────────────────────────────────────────────

    #[test]
    fn clean_removes_fenced_code() {
        let input = "Before\n```rust\nlet x = 1;\n```\nAfter";
        assert_eq!(clean(input), "Before\nAfter");
    }

    #[test]
    fn clean_strips_images_keeps_link_text() {
        let input = "See ![diagram](http://x/y.png) and [the docs](http://x/docs).";
        assert_eq!(clean(input), "See and the docs.");
    }

    #[test]
    fn clean_unwraps_emphasis() {
        assert_eq!(clean("**bold** and *italic* and `code`"), "bold and italic and code");
        assert_eq!(clean("__bold__ ~~gone~~ ***both***"), "bold gone both");
    }

    #[test]
    fn clean_strips_headers_and_bullets() {
        let input = "# Title\n- one\n* two\n+ three\n1. four";
        assert_eq!(clean(input), "Title\none\ntwo\nthree\nfour");
    }

    #[test]
    fn clean_strips_blockquotes_and_rules() {
        let input = "> quoted\n---\nplain";
        assert_eq!(clean(input), "quoted\nplain");
    }

    #[test]
    fn clean_speaks_symbols() {
        assert_eq!(clean("2+2=4"), "2 plus 2 equals 4");
        assert_eq!(clean("50% off at night"), "50 percent off at night");
        assert_eq!(clean("cats & dogs"), "cats and dogs");
    }

    #[test]
    fn clean_removes_urls() {
        assert_eq!(clean("visit https://example.com/a/b for info"), "visit for info");
    }

    #[test]
    fn clean_replaces_ellipsis() {
        assert_eq!(clean("well... maybe"), "well, maybe");
        assert_eq!(clean("hmm.. right"), "hmm, right");
    }

    #[test]
    fn clean_replaces_table_pipes() {
        assert_eq!(clean("a | b | c"), "a b c");
    }

    #[test]
    fn clean_collapses_whitespace() {
        assert_eq!(clean("a   b\n\n\nc\t d"), "a b\nc d");
    }

    #[test]
    fn clean_is_idempotent() {
        let inputs = [
            "# Title\n**bold** [link](http://x) 2+2=4... done | end",
            "plain sentence already clean.",
            "> quote\n```\ncode\n```\n- item",
        ];
        for input in inputs {
            let once = clean(input);
            assert_eq!(clean(&once), once, "not idempotent for {input:?}");
        }
    }

    // ── extract_complete_sentence ───────────────────────────────────

    #[test]
    fn extracts_period_sentence() {
        let (sentence, rest) = extract_complete_sentence("Four. That is it.");
        assert_eq!(sentence.as_deref(), Some("Four."));
        assert_eq!(rest, "That is it.");
    }

    #[test]
    fn no_boundary_returns_buffer_unchanged() {
        let (sentence, rest) = extract_complete_sentence("still going");
        assert!(sentence.is_none());
        assert_eq!(rest, "still going");
    }

    #[test]
    fn newline_is_strong_boundary() {
        let (sentence, rest) = extract_complete_sentence("first line\nsecond line");
        assert_eq!(sentence.as_deref(), Some("first line"));
        assert_eq!(rest, "second line");
    }

    #[test]
    fn clause_separator_kept_in_sentence() {
        let (sentence, rest) = extract_complete_sentence("first part; then more");
        assert_eq!(sentence.as_deref(), Some("first part;"));
        assert_eq!(rest, "then more");

        let (sentence, rest) = extract_complete_sentence("note: details follow");
        assert_eq!(sentence.as_deref(), Some("note:"));
        assert_eq!(rest, "details follow");
    }

    #[test]
    fn em_dash_breaks_when_spaced() {
        let (sentence, rest) = extract_complete_sentence("one thing — another thing");
        assert_eq!(sentence.as_deref(), Some("one thing —"));
        assert_eq!(rest, "another thing");
    }

    #[test]
    fn colon_without_space_does_not_break() {
        let (sentence, _) = extract_complete_sentence("ratio 3:2 wins");
        assert!(sentence.is_none());
    }

    #[test]
    fn abbreviations_do_not_break() {
        let (sentence, rest) = extract_complete_sentence("Dr. Smith went home. He was tired.");
        assert_eq!(sentence.as_deref(), Some("Dr. Smith went home."));
        assert_eq!(rest, "He was tired.");
    }

    #[test]
    fn abbreviation_with_internal_dots() {
        let (sentence, _) = extract_complete_sentence("use e.g. apples");
        assert!(sentence.is_none());
    }

    #[test]
    fn decimal_number_does_not_break() {
        let (sentence, rest) = extract_complete_sentence("pi is 3.14 roughly. Yes.");
        assert_eq!(sentence.as_deref(), Some("pi is 3.14 roughly."));
        assert_eq!(rest, "Yes.");
    }

    #[test]
    fn trailing_digit_period_waits_for_more() {
        // "3." at the end of a streaming buffer may be a decimal in progress.
        let (sentence, rest) = extract_complete_sentence("the answer is 3.");
        assert!(sentence.is_none());
        assert_eq!(rest, "the answer is 3.");
    }

    #[test]
    fn terminator_at_end_of_buffer_breaks() {
        let (sentence, rest) = extract_complete_sentence("Is that all?");
        assert_eq!(sentence.as_deref(), Some("Is that all?"));
        assert_eq!(rest, "");
    }

    #[test]
    fn forced_break_at_twenty_words() {
        let words: Vec<String> = (1..=25).map(|i| format!("word{i}")).collect();
        let buf = words.join(" ");
        let (sentence, rest) = extract_complete_sentence(&buf);
        let sentence = sentence.unwrap();
        assert_eq!(sentence.split_whitespace().count(), 20);
        assert_eq!(rest.split_whitespace().count(), 5);
        assert!(sentence.ends_with("word20"));
        assert!(rest.starts_with("word21"));
    }

    #[test]
    fn nineteen_words_do_not_force_break() {
        let words: Vec<String> = (1..=19).map(|i| format!("word{i}")).collect();
        let (sentence, _) = extract_complete_sentence(&words.join(" "));
        assert!(sentence.is_none());
    }

    #[test]
    fn streaming_char_by_char_respects_abbreviations() {
        // Feed one character at a time, draining sentences as they appear.
        let input = "Dr. Smith went home. He was tired.";
        let mut buf = String::new();
        let mut sentences = Vec::new();
        for c in input.chars() {
            buf.push(c);
            loop {
                let (sentence, rest) = extract_complete_sentence(&buf);
                buf = rest;
                match sentence {
                    Some(s) => sentences.push(s),
                    None => break,
                }
            }
        }
        assert_eq!(sentences, vec!["Dr. Smith went home.", "He was tired."]);
    }

    #[test]
    fn progress_invariant_holds() {
        // Emitted sentence plus remainder never exceed the cleaned input.
        let inputs = ["Four. That is it.", "a; b", "x\ny", "no boundary here"];
        for input in inputs {
            let cleaned_len = clean(input).len();
            let (sentence, rest) = extract_complete_sentence(input);
            if let Some(s) = sentence {
                assert!(!s.is_empty());
                assert!(s.len() + rest.len() <= cleaned_len, "input {input:?}");
            } else {
                assert_eq!(rest, input);
            }
        }
    }

    // ── question helpers ────────────────────────────────────────────

    #[test]
    fn question_detection() {
        assert!(ends_with_question("What time? "));
        assert!(!ends_with_question("At noon."));
        assert!(!ends_with_question(""));
    }

    #[test]
    fn last_question_extraction() {
        let sentences = vec!["Sure.".to_owned(), "What time?".to_owned()];
        assert_eq!(
            extract_last_question(&sentences).as_deref(),
            Some("What time?")
        );

        let statements = vec!["What time?".to_owned(), "At noon.".to_owned()];
        assert!(extract_last_question(&statements).is_none());
        assert!(extract_last_question(&[]).is_none());
    }
}
