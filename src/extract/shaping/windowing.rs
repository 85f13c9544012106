//! Keyword-anchored excerpting for transcripts too large to send verbatim.
//!
//! The transcript is scanned for every keyword, a fixed-radius window is cut
//! around each hit, overlapping or touching windows are merged, and the
//! survivors are concatenated behind a header excerpt that carries the
//! company-identity preamble most transcripts open with.

use regex::Regex;
use serde::Serialize;
use thiserror::Error;

/// Tunables for [`shape_transcript`]. Sizes are UTF-8 byte counts, snapped
/// outward to character boundaries.
#[derive(Debug, Clone)]
pub struct WindowOptions {
    /// Transcripts at or below this size are sent verbatim.
    pub verbatim_limit: usize,
    /// Context kept on each side of a keyword hit.
    pub radius: usize,
    /// Ceiling on emitted windows; above it windows are evenly sampled.
    pub max_windows: usize,
    /// Longest span a run of merged windows may grow to before a new
    /// window is started.
    pub max_window_len: usize,
    /// Leading excerpt always included for company identity.
    pub header_len: usize,
    /// Leading excerpt used when no keyword matches anywhere.
    pub fallback_len: usize,
    /// Hard ceiling on the shaped body.
    pub max_body_len: usize,
}

impl Default for WindowOptions {
    fn default() -> Self {
        Self {
            verbatim_limit: 120_000,
            radius: 1_500,
            max_windows: 40,
            max_window_len: 6_000,
            header_len: 3_000,
            fallback_len: 40_000,
            max_body_len: 150_000,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ShapeError {
    #[error("keyword `{0}` is empty after trimming")]
    EmptyKeyword(String),
    #[error("keyword pattern for `{keyword}` failed to compile: {reason}")]
    BadKeyword { keyword: String, reason: String },
}

/// Byte range of an emitted window in the original transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Window {
    pub start: usize,
    pub end: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum ShapeMode {
    Verbatim,
    Windowed { hits: usize, windows: usize, sampled: bool },
    /// No keyword matched; header plus leading excerpt was sent.
    NoMatches,
}

#[derive(Debug, Clone)]
pub struct ShapedTranscript {
    pub body: String,
    pub mode: ShapeMode,
    pub windows: Vec<Window>,
}

impl ShapedTranscript {
    /// Extra guidance to append to the prompt for this shaping outcome.
    pub fn prompt_note(&self) -> Option<&'static str> {
        match self.mode {
            ShapeMode::Verbatim => None,
            ShapeMode::Windowed { .. } => Some(
                "The transcript was excerpted around the target keywords. Excerpts are separated by [...] markers; quote only text that appears inside them.",
            ),
            ShapeMode::NoMatches => Some(
                "None of the target keywords appear in this transcript. Returning an empty quotes array is a correct, acceptable answer; do not invent quotes.",
            ),
        }
    }
}

const WINDOW_SEPARATOR: &str = "\n\n[...]\n\n";

/// Build a case-insensitive pattern for a keyword that tolerates hyphen,
/// space and slash variants between its words ("cash-flow", "cash flow",
/// "cash/flow").
pub fn keyword_pattern(keyword: &str) -> Result<Regex, ShapeError> {
    let words: Vec<&str> = keyword
        .split(|c: char| c.is_whitespace() || c == '-' || c == '/')
        .filter(|w| !w.is_empty())
        .collect();
    if words.is_empty() {
        return Err(ShapeError::EmptyKeyword(keyword.to_string()));
    }

    let body = words
        .iter()
        .map(|w| regex::escape(w))
        .collect::<Vec<_>>()
        .join(r"[\s\-/]+");

    let first_is_word = words[0].chars().next().is_some_and(char::is_alphanumeric);
    let last_is_word = words[words.len() - 1]
        .chars()
        .last()
        .is_some_and(char::is_alphanumeric);
    let pattern = format!(
        "(?i){}{}{}",
        if first_is_word { r"\b" } else { "" },
        body,
        if last_is_word { r"\b" } else { "" }
    );

    Regex::new(&pattern).map_err(|e| ShapeError::BadKeyword {
        keyword: keyword.to_string(),
        reason: e.to_string(),
    })
}

/// Byte ranges of every keyword hit, sorted by start.
pub fn find_hits(text: &str, keywords: &[String]) -> Result<Vec<(usize, usize)>, ShapeError> {
    let mut hits = Vec::new();
    for keyword in keywords {
        if keyword.trim().is_empty() {
            continue;
        }
        let re = keyword_pattern(keyword)?;
        hits.extend(re.find_iter(text).map(|m| (m.start(), m.end())));
    }
    hits.sort_unstable();
    Ok(hits)
}

fn floor_boundary(text: &str, mut idx: usize) -> usize {
    idx = idx.min(text.len());
    while idx > 0 && !text.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

fn ceil_boundary(text: &str, mut idx: usize) -> usize {
    idx = idx.min(text.len());
    while idx < text.len() && !text.is_char_boundary(idx) {
        idx += 1;
    }
    idx
}

/// Cut a window around every hit and merge overlapping or adjacent ones.
///
/// A merged run stops growing once it would exceed `max_span`; the next
/// window then starts where the previous one ended, so clustered hits yield
/// several contiguous windows instead of one unbounded one. Every hit stays
/// inside a single window.
pub fn build_windows(
    text: &str,
    hits: &[(usize, usize)],
    radius: usize,
    max_span: usize,
) -> Vec<Window> {
    let mut windows: Vec<Window> = Vec::new();
    for &(start, end) in hits {
        let mut window = Window {
            start: floor_boundary(text, start.saturating_sub(radius)),
            end: ceil_boundary(text, end.saturating_add(radius)),
        };
        if let Some(last) = windows.last_mut() {
            if window.start <= last.end {
                if window.end.saturating_sub(last.start) <= max_span {
                    last.end = last.end.max(window.end);
                    continue;
                }
                // Split after the hit the previous window already touches.
                if start < last.end {
                    last.end = last.end.max(ceil_boundary(text, end));
                }
                window.start = last.end;
                if window.end <= window.start {
                    continue;
                }
            }
        }
        windows.push(window);
    }
    windows
}

/// Keep `keep` items spread evenly across `items`, always including the
/// first and last.
pub fn sample_evenly<T: Copy>(items: &[T], keep: usize) -> Vec<T> {
    if keep == 0 {
        return Vec::new();
    }
    if items.len() <= keep {
        return items.to_vec();
    }
    if keep == 1 {
        return vec![items[0]];
    }
    let last = items.len() - 1;
    let mut out: Vec<T> = Vec::with_capacity(keep);
    let mut prev: Option<usize> = None;
    for i in 0..keep {
        let idx = (i * last + (keep - 1) / 2) / (keep - 1);
        if prev != Some(idx) {
            out.push(items[idx]);
            prev = Some(idx);
        }
    }
    out
}

fn assemble(text: &str, header_end: usize, windows: &[Window]) -> String {
    let mut body = String::with_capacity(
        header_end + windows.iter().map(|w| w.end - w.start).sum::<usize>() + 64,
    );
    body.push_str("=== TRANSCRIPT HEADER ===\n");
    body.push_str(text[..header_end].trim_end());
    body.push_str("\n\n=== KEYWORD EXCERPTS ===");
    for window in windows {
        body.push_str(WINDOW_SEPARATOR);
        body.push_str(text[window.start..window.end].trim());
    }
    body
}

/// Shape a transcript into a bounded prompt body.
///
/// Short transcripts pass through unchanged. Longer ones are reduced to a
/// header plus keyword windows; when nothing matches, a header plus leading
/// excerpt is sent instead so the prompt is never empty.
pub fn shape_transcript(
    text: &str,
    keywords: &[String],
    options: &WindowOptions,
) -> Result<ShapedTranscript, ShapeError> {
    if text.len() <= options.verbatim_limit {
        return Ok(ShapedTranscript {
            body: text.to_string(),
            mode: ShapeMode::Verbatim,
            windows: Vec::new(),
        });
    }

    let header_end = floor_boundary(text, options.header_len);
    let hits = find_hits(text, keywords)?;

    if hits.is_empty() {
        let excerpt_end = floor_boundary(
            text,
            options
                .fallback_len
                .max(options.header_len)
                .min(options.max_body_len.saturating_sub(64)),
        );
        let mut body = String::with_capacity(excerpt_end + 64);
        body.push_str("=== TRANSCRIPT HEADER AND OPENING (no keyword matches) ===\n");
        body.push_str(text[..excerpt_end].trim_end());
        return Ok(ShapedTranscript {
            body,
            mode: ShapeMode::NoMatches,
            windows: Vec::new(),
        });
    }

    let merged = build_windows(text, &hits, options.radius, options.max_window_len);
    let mut sampled = merged.len() > options.max_windows;
    let mut windows = sample_evenly(&merged, options.max_windows.max(1));
    let mut body = assemble(text, header_end, &windows);

    // Thin windows until the body fits, then shorten the last one. The
    // reported windows always match what the body holds.
    while body.len() > options.max_body_len {
        sampled = true;
        if windows.len() > 1 {
            let keep = windows.len() - 1;
            windows = sample_evenly(&windows, keep);
        } else if let Some(last) = windows.last_mut() {
            let overflow = body.len() - options.max_body_len;
            let end = floor_boundary(text, last.end.saturating_sub(overflow));
            if end <= last.start {
                windows.clear();
            } else {
                last.end = end;
            }
        } else {
            body.truncate(floor_boundary(&body, options.max_body_len));
            break;
        }
        body = assemble(text, header_end, &windows);
    }

    Ok(ShapedTranscript {
        body,
        mode: ShapeMode::Windowed {
            hits: hits.len(),
            windows: windows.len(),
            sampled,
        },
        windows,
    })
}
