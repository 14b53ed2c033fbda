//! Multi-line guard: terminate block commands with a here-document opener.
//!
//! Block commands carry their payload through a here-document, so the first line of
//! each block must end with `<< 'END'`. The transform only touches that first line and
//! is idempotent.

use crate::core::patterns::{PatternTables, PatternView};

/// Rewrite `action` so every block command's first line opens a here-document.
///
/// Subroutine payloads are never guarded.
pub fn guard_multiline_input(action: &str, tables: &PatternTables) -> String {
    let mut pieces: Vec<String> = Vec::new();
    let mut rest = action;
    while !rest.trim().is_empty() {
        let Some(found) = tables.first_match(rest, PatternView::MultiLineNoSubroutines) else {
            pieces.push(rest.to_string());
            break;
        };
        let pre = &rest[..found.start];
        let matched = &rest[found.start..found.end];
        // The newline after the end marker separates pieces; the join restores it.
        rest = strip_one_newline_prefix(&rest[found.end..]);

        if !pre.trim().is_empty() {
            pieces.push(strip_one_newline_suffix(pre).to_string());
        }
        if matched.trim().is_empty() {
            continue;
        }
        let eof = found.end_marker.unwrap_or_default().trim();
        pieces.push(with_heredoc_opener(matched, eof));
    }
    pieces.join("\n")
}

fn with_heredoc_opener(matched: &str, eof: &str) -> String {
    let opener = format!("<< '{eof}'");
    let (first_line, remainder) = match matched.find('\n') {
        Some(idx) => matched.split_at(idx),
        None => (matched, ""),
    };
    if first_line.trim().ends_with(&opener) {
        return matched.to_string();
    }
    format!("{} {opener}{remainder}", first_line.trim_end())
}

fn strip_one_newline_prefix(text: &str) -> &str {
    text.strip_prefix('\n').unwrap_or(text)
}

fn strip_one_newline_suffix(text: &str) -> &str {
    text.strip_suffix('\n').unwrap_or(text)
}
