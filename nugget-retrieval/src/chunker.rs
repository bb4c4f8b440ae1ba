//! Heading-aware markdown chunking.
//!
//! A document body is cut into sections along its ATX heading tree, small
//! sections are folded into a neighbour inside the same subtree and large
//! ones are sub-split with a carried overlap. Every chunk except the only
//! chunk of a tiny document stays within `[min_tokens, max_tokens]`.

use std::sync::LazyLock;

use nugget_core::config::ChunkingDefaults;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::{RetrievalError, RetrievalResult};
use crate::models::{ChunkKey, Document};

static HEADING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^ {0,3}(#{1,6})[ \t]+(.*?)(?:[ \t]+#+)?[ \t]*$").expect("heading regex")
});

pub const BREADCRUMB_SEPARATOR: &str = " > ";

/// Rough token count: one token per four characters.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChunkConfig {
    pub min_tokens: usize,
    pub max_tokens: usize,
    pub overlap_ratio: f32,
}

impl ChunkConfig {
    pub fn new(min_tokens: usize, max_tokens: usize, overlap_ratio: f32) -> RetrievalResult<Self> {
        let config = Self {
            min_tokens,
            max_tokens,
            overlap_ratio,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> RetrievalResult<()> {
        if self.min_tokens == 0 {
            return Err(RetrievalError::InvalidChunkConfig(
                "min_tokens must be at least 1".to_string(),
            ));
        }
        if !(0.10..=0.15).contains(&self.overlap_ratio) {
            return Err(RetrievalError::InvalidChunkConfig(format!(
                "overlap_ratio {} outside [0.10, 0.15]",
                self.overlap_ratio
            )));
        }
        let floor = 3 * self.min_tokens + self.overlap_tokens();
        if self.max_tokens < floor {
            return Err(RetrievalError::InvalidChunkConfig(format!(
                "max_tokens {} must be at least 3 * min_tokens + overlap ({floor})",
                self.max_tokens
            )));
        }
        Ok(())
    }

    /// Tokens of context carried from one sub-chunk into the next.
    pub fn overlap_tokens(&self) -> usize {
        (self.max_tokens as f32 * self.overlap_ratio).round() as usize
    }
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            min_tokens: 64,
            max_tokens: 512,
            overlap_ratio: 0.12,
        }
    }
}

impl TryFrom<&ChunkingDefaults> for ChunkConfig {
    type Error = RetrievalError;

    fn try_from(value: &ChunkingDefaults) -> Result<Self, Self::Error> {
        Self::new(value.min_tokens, value.max_tokens, value.overlap_ratio)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub key: ChunkKey,
    /// Ancestor heading titles, outermost first.
    pub breadcrumb: Vec<String>,
    /// Tail of the previous sub-chunk of the same section.
    pub overlap: String,
    /// This chunk's own, non-overlapping slice of the body.
    pub text: String,
    pub tokens: usize,
    pub content_hash: String,
}

impl Chunk {
    pub fn depth(&self) -> usize {
        self.breadcrumb.len()
    }

    pub fn content(&self) -> String {
        format!("{}{}", self.overlap, self.text)
    }

    /// Text handed to the embedding provider and the text index.
    pub fn embedding_text(&self) -> String {
        embedding_text(&self.breadcrumb, &self.content())
    }
}

fn embedding_text(breadcrumb: &[String], content: &str) -> String {
    if breadcrumb.is_empty() {
        content.to_string()
    } else {
        format!("{}\n\n{content}", breadcrumb.join(BREADCRUMB_SEPARATOR))
    }
}

pub fn content_hash(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

/// Chunk a document body. An empty body yields no chunks.
pub fn chunk_document(doc: &Document, config: &ChunkConfig) -> Vec<Chunk> {
    let body = doc.body.as_str();
    let sections = split_sections(body).unwrap_or_else(|| whole_body(body));
    let sections = merge_small_sections(sections, body, config.min_tokens);

    let mut chunks = Vec::new();
    for section in sections {
        let text = &body[section.start..section.end];
        for (overlap, piece) in pack_section(text, config) {
            let position = chunks.len() as u32;
            let content = format!("{overlap}{piece}");
            chunks.push(Chunk {
                key: ChunkKey::new(doc.id.clone(), position),
                breadcrumb: section.path.clone(),
                tokens: estimate_tokens(&content),
                content_hash: content_hash(&embedding_text(&section.path, &content)),
                overlap,
                text: piece,
            });
        }
    }
    chunks
}

/// A trimmed byte range of the body plus its heading path.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Section {
    path: Vec<String>,
    start: usize,
    end: usize,
}

impl Section {
    fn tokens(&self, body: &str) -> usize {
        estimate_tokens(&body[self.start..self.end])
    }
}

fn trimmed_section(body: &str, path: Vec<String>, start: usize, end: usize) -> Option<Section> {
    let slice = &body[start..end];
    let leading = slice.len() - slice.trim_start().len();
    let trailing = slice.len() - slice.trim_end().len();
    (leading < slice.len()).then(|| Section {
        path,
        start: start + leading,
        end: end - trailing,
    })
}

fn whole_body(body: &str) -> Vec<Section> {
    trimmed_section(body, Vec::new(), 0, body.len())
        .into_iter()
        .collect()
}

/// Split along headings outside code fences. `None` when a fence never closes.
fn split_sections(body: &str) -> Option<Vec<Section>> {
    let mut sections = Vec::new();
    let mut stack: Vec<(usize, String)> = Vec::new();
    let mut fence: Option<char> = None;
    let mut section_start = 0;
    let mut offset = 0;

    for line in body.split_inclusive('\n') {
        let line_start = offset;
        offset += line.len();
        let trimmed = line.trim_start();

        if let Some(marker) = fence {
            if trimmed.starts_with(&format!("{marker}{marker}{marker}")) {
                fence = None;
            }
            continue;
        }
        if trimmed.starts_with("```") || trimmed.starts_with("~~~") {
            fence = trimmed.chars().next();
            continue;
        }

        let Some(caps) = HEADING.captures(line.trim_end_matches(['\n', '\r'])) else {
            continue;
        };
        let title = caps.get(2).map(|m| m.as_str().trim()).unwrap_or_default();
        if title.is_empty() {
            continue;
        }
        let level = caps.get(1).map(|m| m.as_str().len()).unwrap_or(1);

        let path = stack.iter().map(|(_, title)| title.clone()).collect();
        sections.extend(trimmed_section(body, path, section_start, line_start));
        section_start = line_start;

        while stack.last().is_some_and(|(depth, _)| *depth >= level) {
            stack.pop();
        }
        stack.push((level, title.to_string()));
    }

    if fence.is_some() {
        return None;
    }
    let path = stack.into_iter().map(|(_, title)| title).collect();
    sections.extend(trimmed_section(body, path, section_start, body.len()));
    Some(sections)
}

/// Fold sections below `min_tokens` into the nearest section of the same
/// subtree: the following sibling first, then the previous one, widening one
/// ancestor level at a time.
fn merge_small_sections(mut sections: Vec<Section>, body: &str, min_tokens: usize) -> Vec<Section> {
    while sections.len() > 1 {
        let Some(index) = sections.iter().position(|s| s.tokens(body) < min_tokens) else {
            break;
        };
        let Some(target) = merge_target(&sections, index) else {
            break;
        };
        let (first, second) = if target > index {
            (index, target)
        } else {
            (target, index)
        };
        let tail = sections.remove(second);
        let head = &mut sections[first];
        head.path = common_prefix(&head.path, &tail.path);
        head.end = tail.end;
    }
    sections
}

fn merge_target(sections: &[Section], index: usize) -> Option<usize> {
    let path = &sections[index].path;
    for level in (0..=path.len()).rev() {
        let prefix = &path[..level];
        if let Some(next) = sections.get(index + 1)
            && next.path.starts_with(prefix)
        {
            return Some(index + 1);
        }
        if index > 0 && sections[index - 1].path.starts_with(prefix) {
            return Some(index - 1);
        }
    }
    None
}

fn common_prefix(a: &[String], b: &[String]) -> Vec<String> {
    a.iter()
        .zip(b)
        .take_while(|(x, y)| x == y)
        .map(|(x, _)| x.clone())
        .collect()
}

/// A word plus its trailing whitespace.
#[derive(Debug, Clone, Copy)]
struct Atom {
    start: usize,
    word_end: usize,
    end: usize,
    word_chars: usize,
    ws_chars: usize,
}

impl Atom {
    fn chars(&self) -> usize {
        self.word_chars + self.ws_chars
    }
}

fn atomize(text: &str, max_atom_chars: usize) -> Vec<Atom> {
    let mut atoms = Vec::new();
    let mut chars = text.char_indices().peekable();
    while let Some(&(start, _)) = chars.peek() {
        let mut word_end = start;
        let mut word_chars = 0;
        while let Some(&(idx, ch)) = chars.peek() {
            if ch.is_whitespace() || word_chars == max_atom_chars {
                break;
            }
            word_end = idx + ch.len_utf8();
            word_chars += 1;
            chars.next();
        }
        let mut end = word_end;
        let mut ws_chars = 0;
        while let Some(&(idx, ch)) = chars.peek() {
            if !ch.is_whitespace() {
                break;
            }
            end = idx + ch.len_utf8();
            ws_chars += 1;
            chars.next();
        }
        atoms.push(Atom {
            start,
            word_end,
            end,
            word_chars,
            ws_chars,
        });
    }
    atoms
}

/// Character counts over atom ranges, trailing whitespace excluded.
struct Measure<'a> {
    atoms: &'a [Atom],
    prefix: Vec<usize>,
}

impl<'a> Measure<'a> {
    fn new(atoms: &'a [Atom]) -> Self {
        let mut prefix = Vec::with_capacity(atoms.len() + 1);
        prefix.push(0);
        for atom in atoms {
            prefix.push(prefix[prefix.len() - 1] + atom.chars());
        }
        Self { atoms, prefix }
    }

    fn chars(&self, from: usize, to: usize) -> usize {
        if to <= from {
            return 0;
        }
        self.prefix[to] - self.prefix[from] - self.atoms[to - 1].ws_chars
    }

    fn tokens(&self, from: usize, to: usize) -> usize {
        self.chars(from, to).div_ceil(4)
    }

    fn breaks_paragraph(&self, text: &str, index: usize) -> bool {
        let atom = &self.atoms[index];
        text[atom.word_end..atom.end].matches('\n').count() >= 2
    }

    fn breaks_line(&self, text: &str, index: usize) -> bool {
        let atom = &self.atoms[index];
        text[atom.word_end..atom.end].contains('\n')
    }
}

/// Cut one section into `(overlap, text)` pieces.
fn pack_section(text: &str, config: &ChunkConfig) -> Vec<(String, String)> {
    if estimate_tokens(text) <= config.max_tokens {
        return vec![(String::new(), text.to_string())];
    }

    let overlap_tokens = config.overlap_tokens();
    let max_atom_chars = (config.min_tokens / 4).max(1) * 4;
    let atoms = atomize(text, max_atom_chars);
    let measure = Measure::new(&atoms);
    let budget = |piece_index: usize| {
        if piece_index == 0 {
            config.max_tokens
        } else {
            config.max_tokens - overlap_tokens
        }
    };

    let mut ranges: Vec<(usize, usize)> = Vec::new();
    let mut from = 0;
    while from < atoms.len() {
        let limit = budget(ranges.len());
        let mut fit = from + 1;
        while fit < atoms.len() && measure.tokens(from, fit + 1) <= limit {
            fit += 1;
        }
        let cut = if fit == atoms.len() {
            fit
        } else {
            preferred_cut(text, &measure, from, fit, config.min_tokens)
        };
        ranges.push((from, cut));
        from = cut;
    }

    rebalance_tail(&mut ranges, &measure, config, &budget);

    let mut pieces = Vec::with_capacity(ranges.len());
    for (index, &(from, to)) in ranges.iter().enumerate() {
        let overlap = if index == 0 {
            String::new()
        } else {
            let (prev_from, prev_to) = ranges[index - 1];
            overlap_slice(text, &atoms, prev_from, prev_to, overlap_tokens * 4)
        };
        let piece = text[atoms[from].start..atoms[to - 1].word_end].to_string();
        pieces.push((overlap, piece));
    }
    pieces
}

/// Last paragraph break, else last line break, that still leaves a piece
/// of at least `min_tokens`; otherwise the greedy cut.
fn preferred_cut(text: &str, measure: &Measure<'_>, from: usize, fit: usize, min_tokens: usize) -> usize {
    let candidates = (from + 1..=fit).rev();
    let fits_min = |cut: usize| measure.tokens(from, cut) >= min_tokens;
    candidates
        .clone()
        .find(|&cut| measure.breaks_paragraph(text, cut - 1) && fits_min(cut))
        .or_else(|| {
            candidates
                .clone()
                .find(|&cut| measure.breaks_line(text, cut - 1) && fits_min(cut))
        })
        .unwrap_or(fit)
}

/// Fold an undersized trailing piece into its predecessor, or split the pair
/// evenly when the fold would overflow.
fn rebalance_tail(
    ranges: &mut Vec<(usize, usize)>,
    measure: &Measure<'_>,
    config: &ChunkConfig,
    budget: &dyn Fn(usize) -> usize,
) {
    if ranges.len() < 2 {
        return;
    }
    let last = ranges.len() - 1;
    let (tail_from, tail_to) = ranges[last];
    if measure.tokens(tail_from, tail_to) >= config.min_tokens {
        return;
    }

    let (prev_from, _) = ranges[last - 1];
    ranges.pop();
    if measure.tokens(prev_from, tail_to) <= budget(last - 1) {
        ranges[last - 1] = (prev_from, tail_to);
        return;
    }

    let half = measure.chars(prev_from, tail_to) / 2;
    let mut mid = prev_from + 1;
    while mid < tail_to - 1 && measure.chars(prev_from, mid) < half {
        mid += 1;
    }
    ranges[last - 1] = (prev_from, mid);
    ranges.push((mid, tail_to));
}

fn overlap_slice(text: &str, atoms: &[Atom], from: usize, to: usize, max_chars: usize) -> String {
    let mut start = to;
    let mut chars = 0;
    while start > from + 1 && chars + atoms[start - 1].chars() <= max_chars {
        start -= 1;
        chars += atoms[start].chars();
    }
    if start == to {
        return String::new();
    }
    text[atoms[start].start..atoms[to - 1].end].to_string()
}
