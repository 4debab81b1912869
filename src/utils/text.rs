/// Phrases that betray chunk-by-chunk processing. Ordered longest first so a
/// short marker never eats part of a longer one.
const INCREMENTAL_MARKERS: &[&str] = &[
    "本片段包含",
    "本片段中",
    "本片段",
    "此片段包含",
    "此片段中",
    "此片段",
    "该片段",
    "当前片段",
    "在新文本中，",
    "在新文本中",
    "新文本中，",
    "新文本中",
    "在新片段中",
    "新片段中",
    "在本段中，",
    "在本段中",
    "在此段中",
    "本段中",
    "此段中",
    "本章节中",
    "此章节中",
    "本节中",
    "新情节中",
    "新文本",
    "新片段",
    "片段中",
];

pub fn strip_code_blocks(s: &str) -> String {
    let s = s.trim();
    if s.starts_with("```json") {
        s.trim_start_matches("```json").trim_end_matches("```").trim().to_string()
    } else if s.starts_with("```") {
        s.trim_start_matches("```").trim_end_matches("```").trim().to_string()
    } else {
        s.to_string()
    }
}

/// Removes incremental-processing phrasing so the result reads as a
/// single-pass analysis, then tidies doubled punctuation left behind.
pub fn sanitize_text(text: &str) -> String {
    let mut out = text.to_string();
    for marker in INCREMENTAL_MARKERS {
        if out.contains(marker) {
            out = out.replace(marker, "");
        }
    }
    let out = collapse_repeats(&out, '，');
    let out = collapse_repeats(&out, '。');
    let out = collapse_repeats(&out, ' ');
    out.trim().to_string()
}

fn collapse_repeats(s: &str, c: char) -> String {
    let mut out = String::with_capacity(s.len());
    let mut prev_was_c = false;
    for ch in s.chars() {
        if ch == c {
            if !prev_was_c {
                out.push(ch);
            }
            prev_was_c = true;
        } else {
            out.push(ch);
            prev_was_c = false;
        }
    }
    out
}

/// Length in characters, which is the unit every offset and threshold uses.
pub fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Replaces characters that are not allowed in file names.
pub fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c => c,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_code_blocks() {
        assert_eq!(strip_code_blocks("json"), "json");
        assert_eq!(strip_code_blocks("```json\n{}\n```"), "{}");
        assert_eq!(strip_code_blocks("```\n{}\n```"), "{}");
        assert_eq!(strip_code_blocks("  ```json  \n  {}  \n  ```  "), "{}");
    }

    #[test]
    fn test_sanitize_removes_markers() {
        assert_eq!(sanitize_text("本片段中，主角离开了家。"), "，主角离开了家。");
        assert_eq!(sanitize_text("他在新文本中，遇到了她。。"), "他遇到了她。");
        assert_eq!(sanitize_text("  plain   text "), "plain text");
    }

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("A/B: C?"), "A_B_ C_");
    }

    #[test]
    fn test_char_len_counts_scalars() {
        assert_eq!(char_len("胡安娜"), 3);
        assert_eq!(char_len("abc"), 3);
    }
}
