//! Grounding: numbered passages built from ranked search hits, and the
//! citation markers that refer back to them.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

use crate::models::ScoredChunk;

/// One numbered passage shown to the model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Passage {
    /// 1-based marker used in citations, e.g. `[2]`.
    pub number: usize,
    pub chunk_id: String,
    pub source_id: String,
    pub source_title: Option<String>,
    pub text: String,
    pub score: f32,
}

impl Passage {
    fn render(&self) -> String {
        let title = self.source_title.as_deref().unwrap_or("untitled source");
        format!("[{}] ({})\n{}\n\n", self.number, title, self.text.trim())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GroundedContext {
    pub passages: Vec<Passage>,
    /// Hits left out to stay within the size limit.
    pub dropped: usize,
}

impl GroundedContext {
    /// Passages keep their rank order and stay within `max_chars` once
    /// rendered. Lower-ranked hits are dropped first; a top hit that is
    /// too large on its own is cut to fit.
    pub fn assemble(hits: &[ScoredChunk], max_chars: usize) -> Self {
        let mut context = GroundedContext::default();
        let mut used = 0usize;

        for (i, hit) in hits.iter().enumerate() {
            let mut passage = Passage {
                number: context.passages.len() + 1,
                chunk_id: hit.chunk.id.clone(),
                source_id: hit.chunk.source_id.clone(),
                source_title: hit.source_title.clone(),
                text: hit.chunk.text.clone(),
                score: hit.score,
            };
            let size = passage.render().chars().count();
            if used + size <= max_chars {
                used += size;
                context.passages.push(passage);
                continue;
            }
            if context.passages.is_empty() {
                let overhead = size - passage.text.trim().chars().count();
                if max_chars > overhead {
                    passage.text = passage.text.trim().chars().take(max_chars - overhead).collect();
                    context.passages.push(passage);
                    context.dropped = hits.len() - i - 1;
                    break;
                }
            }
            context.dropped = hits.len() - i;
            break;
        }
        context
    }

    pub fn is_empty(&self) -> bool {
        self.passages.is_empty()
    }

    pub fn render(&self) -> String {
        self.passages.iter().map(Passage::render).collect()
    }

    /// Chunk ids cited in `answer`, in order of first citation. Markers
    /// that match no passage are ignored.
    pub fn cited_chunk_ids(&self, answer: &str) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut ids = Vec::new();
        for number in citation_numbers(answer) {
            if let Some(passage) = self.passages.iter().find(|p| p.number == number) {
                if seen.insert(number) {
                    ids.push(passage.chunk_id.clone());
                }
            }
        }
        ids
    }
}

fn citation_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[(\d+(?:\s*,\s*\d+)*)\]").expect("citation pattern"))
}

/// Numbers inside `[n]` and `[n, m]` markers.
pub fn citation_numbers(text: &str) -> Vec<usize> {
    citation_re()
        .captures_iter(text)
        .flat_map(|caps| {
            caps[1]
                .split(',')
                .filter_map(|n| n.trim().parse::<usize>().ok())
                .collect::<Vec<_>>()
        })
        .collect()
}
