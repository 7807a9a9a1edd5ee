//! Match highlighting and snippets.
//!
//! Pure string scans: ranges are recomputed from the original text with the
//! same tokenizer and match tiers the index uses, never read back from it.

use serde::Serialize;

use crate::search::{match_tier, tokenize, MatchOptions, MatchTier};

/// Half-open range of char offsets into the highlighted text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HighlightRange {
    pub start: usize,
    pub end: usize,
}

/// One alphanumeric run of the source text.
struct TokenSpan {
    start: usize,
    end: usize,
    lower: String,
}

fn token_spans(text: &str) -> Vec<TokenSpan> {
    let mut spans = Vec::new();
    let mut current: Option<(usize, String)> = None;
    let mut index = 0;

    for (index_in_chars, c) in text.chars().enumerate() {
        index = index_in_chars;
        if c.is_alphanumeric() {
            match current.as_mut() {
                Some((_, token)) => token.push(c),
                None => current = Some((index, c.to_string())),
            }
        } else if let Some((start, token)) = current.take() {
            spans.push(TokenSpan {
                start,
                end: index,
                lower: token.to_lowercase(),
            });
        }
    }
    if let Some((start, token)) = current {
        spans.push(TokenSpan {
            start,
            end: index + 1,
            lower: token.to_lowercase(),
        });
    }
    spans
}

/// Sorted, merged char ranges of `text` matched by `query`.
pub fn highlight_ranges(text: &str, query: &str, options: MatchOptions) -> Vec<HighlightRange> {
    let mut terms = tokenize(query);
    terms.sort();
    terms.dedup();
    if terms.is_empty() {
        return Vec::new();
    }

    let mut ranges = Vec::new();
    for span in token_spans(text) {
        for term in &terms {
            let Some(tier) = match_tier(term, &span.lower, options) else {
                continue;
            };
            let term_len = term.chars().count();
            // Lowercasing can change a token's length; clamp to the token
            let (start, end) = match tier {
                MatchTier::Exact | MatchTier::Fuzzy => (span.start, span.end),
                MatchTier::Prefix => (span.start, span.start + term_len),
                MatchTier::Infix => {
                    let byte_pos = span.lower.find(term.as_str()).unwrap_or(0);
                    let start = span.start + span.lower[..byte_pos].chars().count();
                    (start, start + term_len)
                }
            };
            let end = end.min(span.end);
            if start < end {
                ranges.push(HighlightRange { start, end });
            }
        }
    }
    merge(ranges)
}

fn merge(mut ranges: Vec<HighlightRange>) -> Vec<HighlightRange> {
    ranges.sort_by_key(|r| (r.start, r.end));
    let mut merged: Vec<HighlightRange> = Vec::with_capacity(ranges.len());
    for range in ranges {
        match merged.last_mut() {
            Some(last) if range.start <= last.end => last.end = last.end.max(range.end),
            _ => merged.push(range),
        }
    }
    merged
}

/// Longest prefix of `s` no longer than `max_bytes` that ends on a char boundary.
pub fn truncate_to_bytes(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let cut = s
        .char_indices()
        .map(|(i, _)| i)
        .take_while(|&i| i <= max_bytes)
        .last()
        .unwrap_or(0);
    &s[..cut]
}

/// Window of `context_chars` chars either side of the first matched term,
/// widened to whole words where a space allows it.
pub fn build_snippet(text: &str, terms: &[String], context_chars: usize) -> String {
    let options = MatchOptions {
        prefix: true,
        fuzzy: false,
    };
    let hit = highlight_ranges(text, &terms.join(" "), options)
        .first()
        .map_or(0, |r| r.start);

    // Byte offset of each char, then of the end of the text
    let offsets: Vec<usize> = text
        .char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(text.len()))
        .collect();
    let char_count = offsets.len() - 1;
    let byte_at = |c: usize| offsets[c.min(char_count)];

    let start = byte_at(hit.saturating_sub(context_chars));
    let end = byte_at(hit.saturating_add(context_chars));
    let start = text[..start].rfind(' ').map_or(start, |p| p + 1);
    let end = text[end..].find(' ').map_or(end, |p| end + p);

    let mut snippet = String::new();
    if start > 0 {
        snippet.push_str("...");
    }
    snippet.push_str(text[start..end].trim());
    if end < text.len() {
        snippet.push_str("...");
    }
    snippet
}
