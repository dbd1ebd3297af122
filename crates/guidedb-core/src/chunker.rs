//! Overlapping, boundary-aware chunking of guide text.
//!
//! Tokens are maximal runs of non-whitespace. A chunk covers at most
//! `chunk_size` tokens; when a window does not reach the end of the guide its cut
//! may move back by up to `snap_window` tokens to land after a section or
//! paragraph break (preferred) or a sentence end. The next chunk always starts
//! `chunk_overlap` tokens before the previous cut.

use std::ops::Range;

use tracing::debug;

use crate::config::ChunkingConfig;
use crate::error::{Error, Result};
use crate::types::{Chunk, GuideDocument};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Boundary {
    None,
    Sentence,
    Paragraph,
}

#[derive(Debug, Clone, Default)]
pub struct Chunker {
    config: ChunkingConfig,
}

impl Chunker {
    pub fn new(config: ChunkingConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ChunkingConfig { &self.config }

    pub fn chunk_guide(&self, guide: &GuideDocument) -> Result<Vec<Chunk>> { self.chunk(&guide.guide_id, &guide.text) }

    /// Split `text` into ordered chunks. Same text and config always yield the same chunks.
    pub fn chunk(&self, guide_id: &str, text: &str) -> Result<Vec<Chunk>> {
        if text.contains('\0') {
            return Err(Error::Chunking(format!("guide {guide_id} contains NUL bytes")));
        }
        let tokens = token_spans(text);
        if tokens.is_empty() {
            return Err(Error::Chunking(format!("guide {guide_id} has no text")));
        }
        let boundaries = boundaries(text, &tokens);

        let ChunkingConfig { chunk_size, chunk_overlap, snap_window } = self.config;
        let n = tokens.len();
        let mut chunks = Vec::new();
        let mut start = 0usize;
        loop {
            let hard_end = (start + chunk_size).min(n);
            let end = if hard_end == n {
                n
            } else {
                snap(&boundaries, start + chunk_overlap, hard_end, snap_window)
            };
            let span = tokens[start].start..tokens[end - 1].end;
            chunks.push(Chunk {
                id: Chunk::make_id(guide_id, chunks.len()),
                guide_id: guide_id.to_string(),
                ordinal: chunks.len(),
                text: text[span.clone()].to_string(),
                span,
                tokens: end - start,
            });
            if end == n {
                break;
            }
            start = end - chunk_overlap;
        }
        debug!(guide_id, tokens = n, chunks = chunks.len(), "chunked guide");
        Ok(chunks)
    }
}

/// Token count in the unit used for chunk sizes and retrieval budgets.
pub fn count_tokens(text: &str) -> usize { text.split_whitespace().count() }

fn token_spans(text: &str) -> Vec<Range<usize>> {
    let mut spans = Vec::new();
    let mut current: Option<usize> = None;
    for (i, c) in text.char_indices() {
        match (c.is_whitespace(), current) {
            (true, Some(s)) => {
                spans.push(s..i);
                current = None;
            }
            (false, None) => current = Some(i),
            _ => {}
        }
    }
    if let Some(s) = current {
        spans.push(s..text.len());
    }
    spans
}

/// `boundaries[i]` is the strength of a cut placed right after token `i`.
fn boundaries(text: &str, tokens: &[Range<usize>]) -> Vec<Boundary> {
    tokens
        .iter()
        .enumerate()
        .map(|(i, tok)| {
            let Some(next) = tokens.get(i + 1) else { return Boundary::Paragraph };
            let gap = &text[tok.end..next.start];
            let newlines = gap.matches('\n').count();
            if newlines >= 2 || (newlines == 1 && text[next.clone()].starts_with('#')) {
                return Boundary::Paragraph;
            }
            let word = text[tok.clone()].trim_end_matches(['"', '\'', ')', ']']);
            if word.ends_with(['.', '!', '?']) {
                Boundary::Sentence
            } else {
                Boundary::None
            }
        })
        .collect()
}

/// Pick a cut in `[hard_end - window, hard_end]`, strictly after `floor`, preferring
/// stronger boundaries and then later positions; falls back to `hard_end`.
fn snap(boundaries: &[Boundary], floor: usize, hard_end: usize, window: usize) -> usize {
    let lo = hard_end.saturating_sub(window).max(floor + 1);
    let mut best = (Boundary::None, hard_end);
    for end in (lo..=hard_end).rev() {
        let strength = boundaries[end - 1];
        if strength > best.0 {
            best = (strength, end);
        }
    }
    best.1
}
