//! Boundary-aware text chunker.
//!
//! Splits extracted text into [`Segment`]s of at most `target_chars`
//! characters. Each segment owns the span `start..end` of the source;
//! owned spans are contiguous, non-overlapping and increase with the
//! ordinal. Every segment after the first also repeats up to
//! `overlap_chars` characters preceding its span (`text_start..start`) so
//! neighbouring chunks share context.
//!
//! A segment ends at the best break found within `boundary_window`
//! characters before the hard limit, preferring in order:
//!
//! 1. a paragraph break (`\n\n`),
//! 2. a sentence end (`.`, `!` or `?` followed by whitespace),
//! 3. any whitespace,
//!
//! and cutting at the hard limit when none is found. All offsets count
//! Unicode scalar values, never bytes.
//!
//! Chunking is deterministic: the same text and settings always produce
//! the same segments.

use sha2::{Digest, Sha256};

use crate::config::ChunkingConfig;
use crate::error::{NotebookError, Result};

/// One chunk-to-be, before it is stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub ordinal: usize,
    /// First character owned by this segment.
    pub start: usize,
    /// One past the last character owned by this segment.
    pub end: usize,
    /// First character of `text`; equals `start` for the first segment.
    pub text_start: usize,
    pub text: String,
}

impl Segment {
    pub fn overlap(&self) -> usize {
        self.start - self.text_start
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunker {
    target: usize,
    overlap: usize,
    window: usize,
}

impl Chunker {
    pub fn new(target: usize, overlap: usize, window: usize) -> Result<Self> {
        if target == 0 {
            return Err(NotebookError::InvalidInput(
                "chunk target size must be > 0".to_string(),
            ));
        }
        if overlap >= target {
            return Err(NotebookError::InvalidInput(format!(
                "chunk overlap ({}) must be smaller than target size ({})",
                overlap, target
            )));
        }
        Ok(Self {
            target,
            overlap,
            window,
        })
    }

    pub fn from_config(config: &ChunkingConfig) -> Result<Self> {
        Self::new(
            config.target_chars,
            config.overlap_chars,
            config.boundary_window,
        )
    }

    /// Lazily segment `text`. Call again to restart from the beginning.
    pub fn segments<'a>(&self, text: &'a str) -> Segments<'a> {
        let chars: Vec<char> = text.chars().collect();
        let mut bounds: Vec<usize> = text.char_indices().map(|(i, _)| i).collect();
        bounds.push(text.len());
        Segments {
            text,
            chars,
            bounds,
            pos: 0,
            ordinal: 0,
            chunker: *self,
        }
    }
}

/// Split `text` into segments with the default boundary window.
pub fn chunk_text(text: &str, target: usize, overlap: usize) -> Result<Vec<Segment>> {
    let window = ChunkingConfig::default().boundary_window;
    Ok(Chunker::new(target, overlap, window)?.segments(text).collect())
}

/// Iterator returned by [`Chunker::segments`].
#[derive(Debug, Clone)]
pub struct Segments<'a> {
    text: &'a str,
    chars: Vec<char>,
    bounds: Vec<usize>,
    pos: usize,
    ordinal: usize,
    chunker: Chunker,
}

impl Segments<'_> {
    fn is_paragraph_break(&self, p: usize) -> bool {
        p >= 2 && self.chars[p - 1] == '\n' && self.chars[p - 2] == '\n'
    }

    fn is_sentence_break(&self, p: usize) -> bool {
        p >= 2 && self.chars[p - 1].is_whitespace() && matches!(self.chars[p - 2], '.' | '!' | '?')
    }

    fn is_space_break(&self, p: usize) -> bool {
        p >= 1 && self.chars[p - 1].is_whitespace()
    }

    /// Choose where the segment starting at `self.pos` ends, given its
    /// hard limit.
    fn find_end(&self, hard_end: usize) -> usize {
        if hard_end >= self.chars.len() {
            return self.chars.len();
        }
        let lo = (self.pos + 1).max(hard_end.saturating_sub(self.chunker.window));
        let candidates = || (lo..=hard_end).rev();

        candidates()
            .find(|&p| self.is_paragraph_break(p))
            .or_else(|| candidates().find(|&p| self.is_sentence_break(p)))
            .or_else(|| candidates().find(|&p| self.is_space_break(p)))
            .unwrap_or(hard_end)
    }
}

impl Iterator for Segments<'_> {
    type Item = Segment;

    fn next(&mut self) -> Option<Segment> {
        if self.pos >= self.chars.len() {
            return None;
        }
        let text_start = if self.ordinal == 0 {
            self.pos
        } else {
            self.pos.saturating_sub(self.chunker.overlap)
        };
        let hard_end = (text_start + self.chunker.target).min(self.chars.len());
        let end = self.find_end(hard_end);

        let segment = Segment {
            ordinal: self.ordinal,
            start: self.pos,
            end,
            text_start,
            text: self.text[self.bounds[text_start]..self.bounds[end]].to_string(),
        };
        self.pos = end;
        self.ordinal += 1;
        Some(segment)
    }
}

/// SHA-256 of a chunk's text, hex encoded.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}
