//! Splits ordered book sections into bounded, offset-tracked chunks.
//!
//! Offsets and sizes count characters, not bytes. Chunk payloads are the
//! untouched section text, so concatenating them in order gives back the
//! whole book; section headers only appear in [`Chunk::render`].

use serde::{Deserialize, Serialize};

use crate::utils::text::char_len;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Section {
    pub title: String,
    pub text: String,
}

impl Section {
    pub fn new(title: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            text: text.into(),
        }
    }
}

/// Provenance of a piece of chunk text. `segment` is 0 for a section that
/// fit whole (or the first piece of a split one) and n for the n-th
/// continuation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionRef {
    pub title: String,
    pub segment: usize,
}

impl SectionRef {
    pub fn label(&self) -> String {
        if self.segment == 0 {
            self.title.clone()
        } else {
            format!("{}（续{}）", self.title, self.segment)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub index: usize,
    pub sections: Vec<SectionRef>,
    pub text: String,
    /// Byte offsets into `text` where each entry of `sections` ends.
    bounds: Vec<usize>,
    pub start_offset: usize,
    pub end_offset: usize,
}

impl Chunk {
    pub fn char_len(&self) -> usize {
        self.end_offset - self.start_offset
    }

    pub fn is_blank(&self) -> bool {
        self.text.trim().is_empty()
    }

    pub fn title(&self) -> String {
        self.sections
            .iter()
            .map(SectionRef::label)
            .collect::<Vec<_>>()
            .join(" → ")
    }

    pub fn render(&self) -> String {
        let mut out = String::with_capacity(self.text.len() + self.sections.len() * 16);
        let mut start = 0;
        for (section, &end) in self.sections.iter().zip(&self.bounds) {
            let body = self.text.get(start..end).unwrap_or_default();
            out.push_str(&format!("【{}】\n{}\n\n", section.label(), body.trim()));
            start = end;
        }
        out.trim_end().to_string()
    }
}

#[derive(Debug, Clone)]
pub struct ChunkPlan {
    pub chunks: Vec<Chunk>,
    pub total_len: usize,
}

impl ChunkPlan {
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn percent(&self, chunk: &Chunk) -> u8 {
        percent_of(chunk.end_offset, self.total_len)
    }

    pub fn window(&self, chunk: &Chunk) -> (f64, f64) {
        if self.total_len == 0 {
            return (0.0, 100.0);
        }
        let total = self.total_len as f64;
        (
            chunk.start_offset as f64 * 100.0 / total,
            chunk.end_offset as f64 * 100.0 / total,
        )
    }

    /// Index of the first chunk whose completion percentage exceeds
    /// `percent`, or `len()` when every chunk is already covered.
    pub fn first_after(&self, percent: u8) -> usize {
        self.chunks
            .iter()
            .position(|c| self.percent(c) > percent)
            .unwrap_or(self.chunks.len())
    }
}

/// `ceil(offset * 100 / total)`, capped at 100. An empty book is complete.
pub fn percent_of(offset: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    let offset = offset.min(total) as u64;
    let total = total as u64;
    ((offset * 100).div_ceil(total)) as u8
}

#[derive(Debug, Clone, Copy)]
pub struct ChunkerConfig {
    pub max_chars: usize,
    pub lookback_chars: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            max_chars: 15_000,
            lookback_chars: 500,
        }
    }
}

struct Builder {
    chunks: Vec<Chunk>,
    sections: Vec<SectionRef>,
    bounds: Vec<usize>,
    text: String,
    open_len: usize,
    offset: usize,
}

impl Builder {
    fn push(&mut self, section: SectionRef, text: &str) {
        self.text.push_str(text);
        self.bounds.push(self.text.len());
        self.sections.push(section);
        self.open_len += char_len(text);
    }

    fn flush(&mut self) {
        if self.text.is_empty() {
            return;
        }
        let start_offset = self.offset;
        self.offset += self.open_len;
        self.chunks.push(Chunk {
            index: self.chunks.len(),
            sections: std::mem::take(&mut self.sections),
            text: std::mem::take(&mut self.text),
            bounds: std::mem::take(&mut self.bounds),
            start_offset,
            end_offset: self.offset,
        });
        self.open_len = 0;
    }
}

pub fn chunk_sections(sections: &[Section], config: &ChunkerConfig) -> ChunkPlan {
    let max = config.max_chars.max(1);
    let lookback = config.lookback_chars.min(max);

    let mut builder = Builder {
        chunks: Vec::new(),
        sections: Vec::new(),
        bounds: Vec::new(),
        text: String::new(),
        open_len: 0,
        offset: 0,
    };

    for section in sections {
        if section.text.is_empty() {
            continue;
        }
        let len = char_len(&section.text);

        if len > max {
            builder.flush();
            for (segment, piece) in split_oversized(&section.text, max, lookback)
                .into_iter()
                .enumerate()
            {
                builder.push(
                    SectionRef {
                        title: section.title.clone(),
                        segment,
                    },
                    piece,
                );
                builder.flush();
            }
            continue;
        }

        if builder.open_len > 0 && builder.open_len + len > max {
            builder.flush();
        }
        builder.push(
            SectionRef {
                title: section.title.clone(),
                segment: 0,
            },
            &section.text,
        );
    }
    builder.flush();

    ChunkPlan {
        total_len: builder.offset,
        chunks: builder.chunks,
    }
}

fn byte_index(s: &str, n: usize) -> usize {
    s.char_indices().nth(n).map(|(i, _)| i).unwrap_or(s.len())
}

/// Splits text longer than `max` characters. Each cut is placed after the
/// last line break inside the `lookback` window before the limit, else
/// after the last whitespace there, else exactly at the limit.
fn split_oversized(text: &str, max: usize, lookback: usize) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut rest = text;

    while char_len(rest) > max {
        let limit = byte_index(rest, max);
        let window_start = byte_index(rest, max - lookback);
        let window = &rest[window_start..limit];

        let cut = window
            .rfind('\n')
            .map(|i| window_start + i + 1)
            .or_else(|| {
                window
                    .char_indices()
                    .rev()
                    .find(|(_, c)| c.is_whitespace())
                    .map(|(i, c)| window_start + i + c.len_utf8())
            })
            .filter(|&cut| cut > 0)
            .unwrap_or(limit);

        let (head, tail) = rest.split_at(cut);
        pieces.push(head);
        rest = tail;
    }
    if !rest.is_empty() {
        pieces.push(rest);
    }
    pieces
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paragraphs(count: usize, para_len: usize, fill: char) -> String {
        let line: String = std::iter::repeat(fill).take(para_len - 1).collect();
        std::iter::repeat(format!("{line}\n")).take(count).collect()
    }

    fn reconstruct(plan: &ChunkPlan) -> String {
        plan.chunks.iter().map(|c| c.text.as_str()).collect()
    }

    #[test]
    fn test_small_sections_are_grouped() {
        let sections = vec![
            Section::new("一", "a".repeat(40)),
            Section::new("二", "b".repeat(40)),
            Section::new("三", "c".repeat(40)),
        ];
        let config = ChunkerConfig { max_chars: 100, lookback_chars: 20 };
        let plan = chunk_sections(&sections, &config);

        assert_eq!(plan.len(), 2);
        assert_eq!(plan.chunks[0].sections.len(), 2);
        assert_eq!(plan.chunks[0].end_offset, 80);
        assert_eq!(plan.chunks[1].end_offset, 120);
        assert_eq!(plan.total_len, 120);
        assert_eq!(plan.chunks[0].title(), "一 → 二");
    }

    #[test]
    fn test_fifty_thousand_chars_at_fifteen_thousand_limit() {
        let sections = vec![
            Section::new("序", paragraphs(100, 100, 'x')),
            Section::new("第一章", paragraphs(200, 100, 'y')),
            Section::new("第二章", paragraphs(200, 100, 'z')),
        ];
        let input: String = sections.iter().map(|s| s.text.as_str()).collect();
        assert_eq!(char_len(&input), 50_000);

        let plan = chunk_sections(&sections, &ChunkerConfig::default());

        assert_eq!(plan.total_len, 50_000);
        assert_eq!(plan.chunks.last().map(|c| c.end_offset), Some(50_000));
        assert_eq!(reconstruct(&plan), input);

        let mut previous = 0;
        for chunk in &plan.chunks {
            assert!(chunk.end_offset > previous);
            assert!(chunk.char_len() <= 15_000);
            previous = chunk.end_offset;
        }

        // Oversized chapters are cut right after a paragraph break.
        for chunk in plan.chunks.iter().filter(|c| c.sections[0].title != "序") {
            assert!(chunk.text.ends_with('\n'));
        }
        let continued: Vec<_> = plan
            .chunks
            .iter()
            .filter(|c| c.sections[0].title == "第一章")
            .map(|c| c.sections[0].segment)
            .collect();
        assert_eq!(continued, vec![0, 1]);
    }

    #[test]
    fn test_split_prefers_paragraph_break_in_window() {
        let text = format!("{}\n{}", "a".repeat(90), "b".repeat(60));
        let pieces = split_oversized(&text, 100, 20);
        assert_eq!(pieces[0], format!("{}\n", "a".repeat(90)));
        assert_eq!(pieces[1], "b".repeat(60));
    }

    #[test]
    fn test_split_falls_back_to_whitespace_then_hard_cut() {
        let text = format!("{} {}", "a".repeat(95), "b".repeat(20));
        let pieces = split_oversized(&text, 100, 20);
        assert_eq!(pieces[0], format!("{} ", "a".repeat(95)));

        let solid = "c".repeat(250);
        let pieces = split_oversized(&solid, 100, 20);
        assert_eq!(pieces.iter().map(|p| p.len()).collect::<Vec<_>>(), vec![100, 100, 50]);
    }

    #[test]
    fn test_multibyte_text_round_trips() {
        let text = "他走进了房间。\n她笑了。\n".repeat(30);
        let sections = vec![Section::new("第一章", text.clone())];
        let plan = chunk_sections(&sections, &ChunkerConfig { max_chars: 50, lookback_chars: 10 });
        assert_eq!(reconstruct(&plan), text);
        assert_eq!(plan.total_len, char_len(&text));
    }

    #[test]
    fn test_render_adds_headers_without_touching_payload() {
        let sections = vec![Section::new("一", "甲\n"), Section::new("二", "乙")];
        let plan = chunk_sections(&sections, &ChunkerConfig::default());
        assert_eq!(plan.chunks[0].render(), "【一】\n甲\n\n【二】\n乙");
        assert_eq!(plan.chunks[0].text, "甲\n乙");
    }

    #[test]
    fn test_empty_sections_are_skipped() {
        let sections = vec![Section::new("空", ""), Section::new("一", "abc")];
        let plan = chunk_sections(&sections, &ChunkerConfig::default());
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.chunks[0].sections[0].title, "一");
    }

    #[test]
    fn test_percent_and_resume_index() {
        let sections: Vec<_> = (0..5)
            .map(|i| Section::new(format!("{i}"), "x".repeat(20)))
            .collect();
        let plan = chunk_sections(&sections, &ChunkerConfig { max_chars: 20, lookback_chars: 5 });
        let percents: Vec<_> = plan.chunks.iter().map(|c| plan.percent(c)).collect();
        assert_eq!(percents, vec![20, 40, 60, 80, 100]);
        assert_eq!(plan.first_after(40), 2);
        assert_eq!(plan.first_after(0), 0);
        assert_eq!(plan.first_after(100), 5);
        assert_eq!(percent_of(1, 3), 34);
        assert_eq!(percent_of(0, 0), 100);
    }
}
