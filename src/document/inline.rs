//! Inline emphasis → styled runs.
//!
//! Only asterisk emphasis is recognised: `*italic*`, `**bold**` and
//! `***both***`, nested or not. Underscores are never emphasis because
//! worksheets use `____` for blanks. Everything else (links, code spans,
//! unmatched asterisks) passes through as plain text, and a `{{…}}` marker
//! span is copied byte for byte even when it contains asterisks.

use super::TextRun;

/// Split one line of text into styled runs.
pub fn parse_runs(text: &str) -> Vec<TextRun> {
    let mut runs = Vec::new();
    parse_into(text, false, false, &mut runs);
    runs
}

fn parse_into(text: &str, bold: bool, italic: bool, runs: &mut Vec<TextRun>) {
    let mut plain = String::new();
    let mut rest = text;

    while let Some(pos) = rest.find(['*', '{']) {
        let (before, from) = rest.split_at(pos);
        plain.push_str(before);

        if let Some(len) = marker_span(from) {
            plain.push_str(&from[..len]);
            rest = &from[len..];
            continue;
        }
        if from.starts_with('{') {
            plain.push('{');
            rest = &from[1..];
            continue;
        }

        let stars = star_run(from);
        if (1..=3).contains(&stars) {
            let after = &from[stars..];
            if let Some(close) = find_closing(after, stars) {
                push_run(runs, &mut plain, bold, italic);
                parse_into(
                    &after[..close],
                    bold || stars >= 2,
                    italic || stars != 2,
                    runs,
                );
                rest = &after[close + stars..];
                continue;
            }
        }

        plain.push_str(&from[..stars]);
        rest = &from[stars..];
    }

    plain.push_str(rest);
    push_run(runs, &mut plain, bold, italic);
}

/// Byte length of a `{{…}}` span at the start of `s`.
fn marker_span(s: &str) -> Option<usize> {
    if !s.starts_with("{{") {
        return None;
    }
    s[2..].find("}}").map(|end| end + 4)
}

fn star_run(s: &str) -> usize {
    s.bytes().take_while(|&b| b == b'*').count()
}

/// Byte offset of a closing delimiter of exactly `len` stars.
///
/// The emphasised text must be non-empty and must not start or end with
/// whitespace, so `2 * 3 * 4` stays literal.
fn find_closing(after: &str, len: usize) -> Option<usize> {
    if after.is_empty() || after.starts_with(char::is_whitespace) {
        return None;
    }
    let mut i = 0;
    while let Some(off) = after[i..].find(['*', '{']) {
        let at = i + off;
        if let Some(len) = marker_span(&after[at..]) {
            i = at + len;
            continue;
        }
        if after[at..].starts_with('{') {
            i = at + 1;
            continue;
        }
        let run = star_run(&after[at..]);
        if run == len && at > 0 && !after[..at].ends_with(char::is_whitespace) {
            return Some(at);
        }
        i = at + run;
    }
    None
}

fn push_run(runs: &mut Vec<TextRun>, plain: &mut String, bold: bool, italic: bool) {
    if plain.is_empty() {
        return;
    }
    let text = std::mem::take(plain);
    match runs.last_mut() {
        Some(last) if last.bold == bold && last.italic == italic => last.text.push_str(&text),
        _ => runs.push(TextRun { text, bold, italic }),
    }
}
