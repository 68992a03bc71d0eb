//! Report-aware markdown segmentation.
//!
//! Turns the parsed markdown of one report into ordered [`Chunk`]s:
//!
//! 1. Split into sections at level 1–3 headings (heading kept in its section).
//! 2. Drop sections containing legal boilerplate.
//! 3. Find pipe tables (row line followed by a separator line) and emit each
//!    as one `table` chunk together with the paragraph just before and just
//!    after it.
//! 4. Emit everything else as `text`, splitting oversized runs with
//!    [`RecursiveSplitter`].
//! 5. Re-check every chunk against the boilerplate patterns and number the
//!    survivors from 0.
//!
//! Lengths are counted in characters, not bytes.

use std::collections::VecDeque;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::config::ChunkingConfig;
use crate::models::{Chunk, ChunkType, FieldMap};

const DISCLAIMER_PATTERNS: &[&str] = &[
    r"본\s*조사자료는\s*고객의\s*투자에\s*참고",
    r"투자판단의\s*최종\s*책임은",
    r"당사는\s*본\s*자료의\s*내용에\s*의거하여",
    r"(?i)Compliance\s*Notice",
    r"과거의\s*수익률.*미래의\s*수익률을\s*보장",
];

const HEADER_PREFIXES: &[&str] = &["# ", "## ", "### "];

/// Break preference for oversized text: paragraphs, lines, words, characters.
const SEPARATORS: &[&str] = &["\n\n", "\n", " ", ""];

fn disclaimer_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        DISCLAIMER_PATTERNS
            .iter()
            .filter_map(|p| Regex::new(p).ok())
            .collect()
    })
}

fn table_row() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\|.+\|$").expect("valid table row regex"))
}

fn table_separator() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\|[-:| ]+\|$").expect("valid table separator regex"))
}

/// True if `text` contains any legal-notice phrase.
pub fn is_disclaimer(text: &str) -> bool {
    disclaimer_patterns().iter().any(|re| re.is_match(text))
}

fn is_header(line: &str) -> bool {
    HEADER_PREFIXES.iter().any(|p| line.starts_with(p))
}

fn is_row(line: &str) -> bool {
    table_row().is_match(line.trim_end())
}

fn is_separator(line: &str) -> bool {
    table_separator().is_match(line.trim_end())
}

fn is_blank(line: &str) -> bool {
    line.trim().is_empty()
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// A piece of one section, before numbering.
#[derive(Debug, Clone, PartialEq)]
struct Segment {
    kind: ChunkType,
    text: String,
}

/// Splits markdown into header-delimited sections. Header lines open a new
/// section and stay in it.
fn split_sections(text: &str) -> Vec<String> {
    let mut sections = Vec::new();
    let mut current: Vec<&str> = Vec::new();

    for line in text.lines() {
        if is_header(line) && !current.is_empty() {
            push_section(&mut sections, &current);
            current.clear();
        }
        current.push(line);
    }
    push_section(&mut sections, &current);
    sections
}

fn push_section(sections: &mut Vec<String>, lines: &[&str]) {
    let joined = lines.join("\n");
    let trimmed = joined.trim();
    if !trimmed.is_empty() {
        sections.push(trimmed.to_string());
    }
}

/// `[start, end)` of the table starting at `i`, if a row is followed by a
/// separator there.
fn table_at(lines: &[&str], i: usize) -> Option<(usize, usize)> {
    if i + 1 >= lines.len() || !is_row(lines[i]) || !is_separator(lines[i + 1]) {
        return None;
    }
    let mut end = i + 2;
    while end < lines.len() && is_row(lines[end]) {
        end += 1;
    }
    Some((i, end))
}

/// Splits one section into text and table segments in document order.
fn split_tables(section: &str) -> Vec<Segment> {
    let lines: Vec<&str> = section.lines().collect();
    let mut segments = Vec::new();
    // First line not yet assigned to any segment.
    let mut consumed = 0;
    let mut i = 0;

    while i < lines.len() {
        let Some((start, end)) = table_at(&lines, i) else {
            i += 1;
            continue;
        };

        // Preceding paragraph: skip blanks, then the run of non-blank lines.
        let mut k = start;
        while k > consumed && is_blank(lines[k - 1]) {
            k -= 1;
        }
        let mut p = k;
        while p > consumed && !is_blank(lines[p - 1]) {
            p -= 1;
        }
        let ctx_start = if p < k { p } else { start };

        // Following paragraph, unless it is itself the next table.
        let mut ctx_end = end;
        let mut k = end;
        while k < lines.len() && is_blank(lines[k]) {
            k += 1;
        }
        if k < lines.len() && table_at(&lines, k).is_none() {
            let mut p = k;
            while p < lines.len() && !is_blank(lines[p]) && table_at(&lines, p).is_none() {
                p += 1;
            }
            ctx_end = p;
        }

        push_text(&mut segments, &lines[consumed..ctx_start]);
        let table = lines[ctx_start..ctx_end].join("\n").trim().to_string();
        segments.push(Segment {
            kind: ChunkType::Table,
            text: table,
        });

        consumed = ctx_end;
        i = ctx_end;
    }

    push_text(&mut segments, &lines[consumed..]);
    segments
}

fn push_text(segments: &mut Vec<Segment>, lines: &[&str]) {
    let text = lines.join("\n");
    let text = text.trim();
    if !text.is_empty() {
        segments.push(Segment {
            kind: ChunkType::Text,
            text: text.to_string(),
        });
    }
}

/// Greedy recursive splitter: breaks text at the coarsest separator that
/// fits, merges adjacent pieces up to `chunk_size` characters, and carries up
/// to `chunk_overlap` characters of trailing pieces into the next chunk.
#[derive(Debug, Clone)]
pub struct RecursiveSplitter {
    chunk_size: usize,
    chunk_overlap: usize,
}

impl RecursiveSplitter {
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            chunk_size,
            chunk_overlap: chunk_overlap.min(chunk_size - 1),
        }
    }

    /// Text within the size limit is returned unchanged as a single piece.
    pub fn split(&self, text: &str) -> Vec<String> {
        if char_len(text) <= self.chunk_size {
            return vec![text.to_string()];
        }
        self.split_with(text, SEPARATORS)
    }

    fn split_with(&self, text: &str, separators: &[&str]) -> Vec<String> {
        let pos = separators
            .iter()
            .position(|sep| sep.is_empty() || text.contains(sep))
            .unwrap_or(separators.len().saturating_sub(1));
        let separator = separators.get(pos).copied().unwrap_or("");
        let finer = separators.get(pos + 1..).unwrap_or(&[]);

        let pieces: Vec<String> = if separator.is_empty() {
            text.chars().map(String::from).collect()
        } else {
            text.split(separator)
                .filter(|p| !p.is_empty())
                .map(String::from)
                .collect()
        };

        let mut out = Vec::new();
        let mut pending: Vec<String> = Vec::new();
        for piece in pieces {
            if char_len(&piece) < self.chunk_size {
                pending.push(piece);
                continue;
            }
            if !pending.is_empty() {
                out.extend(self.merge(&pending, separator));
                pending.clear();
            }
            if finer.is_empty() {
                out.push(piece);
            } else {
                out.extend(self.split_with(&piece, finer));
            }
        }
        if !pending.is_empty() {
            out.extend(self.merge(&pending, separator));
        }
        out
    }

    fn merge(&self, pieces: &[String], separator: &str) -> Vec<String> {
        let sep_len = char_len(separator);
        let mut docs = Vec::new();
        let mut window: VecDeque<&str> = VecDeque::new();
        let mut total = 0usize;

        for piece in pieces {
            let len = char_len(piece);
            let joiner = if window.is_empty() { 0 } else { sep_len };
            if total + len + joiner > self.chunk_size && !window.is_empty() {
                if let Some(doc) = join_window(&window, separator) {
                    docs.push(doc);
                }
                while total > self.chunk_overlap
                    || (total > 0
                        && total + len + if window.is_empty() { 0 } else { sep_len }
                            > self.chunk_size)
                {
                    let Some(first) = window.pop_front() else {
                        break;
                    };
                    let joiner = if window.is_empty() { 0 } else { sep_len };
                    total = total.saturating_sub(char_len(first) + joiner);
                }
            }
            window.push_back(piece);
            total += len + if window.len() > 1 { sep_len } else { 0 };
        }
        if let Some(doc) = join_window(&window, separator) {
            docs.push(doc);
        }
        docs
    }
}

fn join_window(window: &VecDeque<&str>, separator: &str) -> Option<String> {
    let joined = window.iter().copied().collect::<Vec<_>>().join(separator);
    let trimmed = joined.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Produces the chunks for one parsed report. Deterministic and I/O free.
#[derive(Debug, Clone)]
pub struct ContentSegmenter {
    splitter: RecursiveSplitter,
}

impl ContentSegmenter {
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Self {
        Self {
            splitter: RecursiveSplitter::new(chunk_size, chunk_overlap),
        }
    }

    pub fn from_config(config: &ChunkingConfig) -> Self {
        Self::new(config.chunk_size, config.chunk_overlap)
    }

    /// Segment `text`. Every chunk inherits `metadata`; its `document_id` is
    /// the `source_file` entry of `metadata` without its extension.
    pub fn segment(&self, text: &str, metadata: &FieldMap) -> Vec<Chunk> {
        if text.trim().is_empty() {
            return Vec::new();
        }

        let document_id = document_id_from(metadata);
        let mut chunks = Vec::new();

        for section in split_sections(text) {
            if is_disclaimer(&section) {
                continue;
            }
            for segment in split_tables(&section) {
                let pieces = match segment.kind {
                    ChunkType::Table => vec![segment.text],
                    ChunkType::Text => self.splitter.split(&segment.text),
                };
                for piece in pieces {
                    if piece.trim().is_empty() || is_disclaimer(&piece) {
                        continue;
                    }
                    chunks.push(Chunk {
                        text: piece,
                        chunk_type: segment.kind,
                        chunk_index: chunks.len(),
                        document_id: document_id.clone(),
                        metadata: metadata.clone(),
                    });
                }
            }
        }

        chunks
    }
}

fn document_id_from(metadata: &FieldMap) -> String {
    let source = metadata
        .get("source_file")
        .and_then(Value::as_str)
        .unwrap_or_default();
    match source.rsplit_once('.') {
        Some((stem, _)) => stem.to_string(),
        None => source.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> FieldMap {
        let mut map = FieldMap::new();
        map.insert("source_file".into(), Value::from("mirae_samsung_20260210.pdf"));
        map.insert("ticker".into(), Value::from("005930"));
        map
    }

    fn segmenter() -> ContentSegmenter {
        ContentSegmenter::new(1000, 200)
    }

    #[test]
    fn test_empty_input_yields_nothing() {
        assert!(segmenter().segment("", &meta()).is_empty());
        assert!(segmenter().segment("  \n\n\t ", &meta()).is_empty());
    }

    #[test]
    fn test_table_with_context_paragraphs() {
        let text = "## 실적 전망\n\n\
                    매출은 전년 대비 증가할 전망이다.\n\n\
                    | 구분 | 2025 | 2026 |\n\
                    |---|---:|---:|\n\
                    | 매출 | 300 | 330 |\n\
                    | 영업이익 | 30 | 36 |\n\n\
                    자료: 회사 자료, 미래에셋증권 리서치센터";
        let chunks = segmenter().segment(text, &meta());

        let tables: Vec<_> = chunks
            .iter()
            .filter(|c| c.chunk_type == ChunkType::Table)
            .collect();
        assert_eq!(tables.len(), 1);
        let table = &tables[0].text;
        assert!(table.starts_with("매출은 전년 대비"));
        assert!(table.contains("| 영업이익 | 30 | 36 |"));
        assert!(table.ends_with("미래에셋증권 리서치센터"));

        // The header stays as its own text run before the table context.
        assert_eq!(chunks[0].chunk_type, ChunkType::Text);
        assert_eq!(chunks[0].text, "## 실적 전망");
    }

    #[test]
    fn test_lone_table_has_only_table_lines() {
        let text = "| a | b |\n|---|---|\n| 1 | 2 |";
        let chunks = segmenter().segment(text, &meta());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_type, ChunkType::Table);
        assert_eq!(chunks[0].text, text);
    }

    #[test]
    fn test_rows_without_separator_are_text() {
        let text = "| not | a table |\n| just | pipes |";
        let chunks = segmenter().segment(text, &meta());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_type, ChunkType::Text);
    }

    #[test]
    fn test_section_without_table_is_text_only() {
        let text = "# 투자의견\n\n목표주가를 상향한다.\n\n## 리스크\n\n환율 변동성.";
        let chunks = segmenter().segment(text, &meta());
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.chunk_type == ChunkType::Text));
        assert!(chunks[0].text.starts_with("# 투자의견"));
        assert!(chunks[1].text.starts_with("## 리스크"));
    }

    #[test]
    fn test_level_four_heading_does_not_split() {
        let text = "# A\n\nbody\n\n#### detail\n\nmore";
        let chunks = segmenter().segment(text, &meta());
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].text.contains("#### detail"));
    }

    #[test]
    fn test_disclaimer_section_dropped() {
        let text = "# 본문\n\n실적 개선이 예상된다.\n\n\
                    # Compliance Notice\n\n\
                    본 조사자료는 고객의 투자에 참고가 될 수 있는 각종 정보제공을 목적으로 제작되었습니다.";
        let chunks = segmenter().segment(text, &meta());
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].text.contains("실적 개선"));
    }

    #[test]
    fn test_indices_and_metadata() {
        let text = "# A\n\none\n\n# B\n\n| x |\n|---|\n| 1 |\n\n# C\n\nthree";
        let chunks = segmenter().segment(text, &meta());
        assert_eq!(chunks.len(), 3);
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.chunk_index, i);
            assert_eq!(chunk.document_id, "mirae_samsung_20260210");
            assert_eq!(chunk.metadata["ticker"], "005930");
        }
        assert_eq!(chunks[1].chunk_type, ChunkType::Table);
        assert!(chunks[1].text.starts_with("# B"));
    }

    #[test]
    fn test_two_tables_do_not_share_context() {
        let text = "before\n\n| a |\n|---|\n| 1 |\n\nmiddle\n\n| b |\n|---|\n| 2 |\n\nafter";
        let chunks = segmenter().segment(text, &meta());
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.chunk_type == ChunkType::Table));
        assert!(chunks[0].text.starts_with("before"));
        assert!(chunks[0].text.ends_with("middle"));
        assert!(chunks[1].text.starts_with("| b |"));
        assert!(chunks[1].text.ends_with("after"));
    }

    #[test]
    fn test_long_text_is_split_with_overlap() {
        let words: Vec<String> = (0..400).map(|i| format!("word{:03}", i)).collect();
        let text = words.join(" ");
        let chunks = ContentSegmenter::new(200, 50).segment(&text, &meta());

        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(char_len(&chunk.text) <= 200);
            assert_eq!(chunk.chunk_type, ChunkType::Text);
        }
        // Consecutive pieces share a tail/head.
        let first_last_word = chunks[0].text.rsplit(' ').next().unwrap();
        assert!(chunks[1].text.contains(first_last_word));
    }

    #[test]
    fn test_splitter_prefers_paragraph_breaks() {
        let para = "가".repeat(80);
        let text = format!("{para}\n\n{para}\n\n{para}");
        let pieces = RecursiveSplitter::new(100, 0).split(&text);
        assert_eq!(pieces, vec![para.clone(), para.clone(), para]);
    }

    #[test]
    fn test_splitter_falls_back_to_characters() {
        let text = "x".repeat(25);
        let pieces = RecursiveSplitter::new(10, 0).split(&text);
        assert_eq!(pieces, vec!["x".repeat(10), "x".repeat(10), "x".repeat(5)]);
    }

    #[test]
    fn test_deterministic() {
        let text = "# A\n\n| x |\n|---|\n| 1 |\n\nbody text";
        assert_eq!(segmenter().segment(text, &meta()), segmenter().segment(text, &meta()));
    }
}
