use serde::{Deserialize, Serialize};
use zhconv::{zhconv, Variant};

const NAME_PREFIXES: &[&str] = &[
    "后妈", "继母", "生母", "亲妈", "外婆", "奶奶", "爷爷", "外公", "老", "小", "大",
    "Mr. ", "Mrs. ", "Ms. ", "Miss ", "Dr. ", "Prof. ", "Professor ", "Sir ", "Lady ",
    "Lord ", "Aunt ", "Uncle ", "Father ", "Mother ",
];

const NAME_SUFFIXES: &[&str] = &[
    "先生", "太太", "小姐", "女士", "夫人", "阁下",
    "律师", "医生", "教授", "老师", "博士", "神父", "牧师",
    "爸爸", "妈妈", "父亲", "母亲", "舅舅", "姨父", "姨妈", "叔叔", "阿姨", "姑姑",
    "姑父", "伯父", "伯母", "哥哥", "弟弟", "姐姐", "妹妹", "表哥", "表弟", "表姐",
    "表妹", "堂哥", "堂弟", "堂姐", "堂妹",
];

/// Phrases marking a reference like "张三的父亲" that names nobody directly.
const RELATIONAL_PATTERNS: &[&str] = &[
    "的父亲", "的母亲", "的朋友", "的儿子", "的女儿", "的妻子", "的丈夫",
    "'s father", "'s mother", "'s friend", "'s son", "'s daughter", "'s wife",
    "'s husband",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RelationalNames {
    #[default]
    Drop,
    Keep,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NameNormalizer {
    relational: RelationalNames,
}

impl NameNormalizer {
    pub fn new(relational: RelationalNames) -> Self {
        Self { relational }
    }

    /// Dedup key for a character name, or `None` if the name should not
    /// become an entity.
    pub fn normalize(&self, raw: &str) -> Option<String> {
        let name = fold_script(&strip_parentheticals(raw));
        self.reduce(&name)
    }

    pub fn display_name(&self, raw: &str) -> Option<String> {
        let name = collapse_whitespace(&strip_parentheticals(raw));
        self.reduce(&name)
    }

    fn reduce(&self, name: &str) -> Option<String> {
        if name.is_empty() {
            return None;
        }
        if self.relational == RelationalNames::Drop && is_relational(name) {
            return None;
        }
        Some(strip_affixes(name))
    }

    pub fn fold_text(&self, text: &str) -> String {
        zhconv(text, Variant::ZhHans)
    }

    pub fn location_key(&self, raw: &str) -> Option<String> {
        let key = fold_script(raw);
        (!key.is_empty()).then_some(key)
    }
}

fn is_relational(name: &str) -> bool {
    let lower = name.to_lowercase();
    RELATIONAL_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Removes `(…)` and `（…）` annotations, including nested ones.
fn strip_parentheticals(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut depth = 0usize;
    for c in s.chars() {
        match c {
            '(' | '（' => depth += 1,
            ')' | '）' if depth > 0 => depth -= 1,
            _ if depth == 0 => out.push(c),
            _ => {}
        }
    }
    out
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn fold_script(s: &str) -> String {
    let dashed: String = s
        .chars()
        .map(|c| match c {
            '－' | '—' | '–' | '‐' | '‑' => '-',
            c => c,
        })
        .collect();
    collapse_whitespace(&zhconv(&dashed, Variant::ZhHans))
}

/// Strips prefixes and suffixes until none applies. Each strip must leave
/// something behind, so the result is never empty.
fn strip_affixes(name: &str) -> String {
    let mut current = name.trim().to_string();
    loop {
        let before = current.len();
        for prefix in NAME_PREFIXES {
            if let Some(rest) = current.strip_prefix(prefix) {
                let rest = rest.trim();
                if !rest.is_empty() {
                    current = rest.to_string();
                    break;
                }
            }
        }
        for suffix in NAME_SUFFIXES {
            if let Some(rest) = current.strip_suffix(suffix) {
                let rest = rest.trim();
                if !rest.is_empty() {
                    current = rest.to_string();
                    break;
                }
            }
        }
        if current.len() == before {
            return current;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parenthetical_and_honorific_forms_agree() {
        let n = NameNormalizer::default();
        assert_eq!(n.normalize("Juana (Mrs. Parra)").as_deref(), Some("Juana"));
        assert_eq!(n.normalize("Mrs. Juana").as_deref(), Some("Juana"));
        assert_eq!(n.normalize("胡安娜（帕拉太太）").as_deref(), Some("胡安娜"));
        assert_eq!(n.normalize("胡安娜太太").as_deref(), Some("胡安娜"));
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let n = NameNormalizer::default();
        for raw in [
            "Juana (Mrs. Parra)",
            "老小明",
            "張媽媽",
            "  Dr.  Who ",
            "王先生（律师）",
            "小",
            "Mrs. Mr. Smith",
        ] {
            let once = n.normalize(raw).expect("name kept");
            assert_eq!(n.normalize(&once).as_deref(), Some(once.as_str()), "{raw}");
        }
    }

    #[test]
    fn test_affix_stripping_keeps_non_empty_remainder() {
        let n = NameNormalizer::default();
        assert_eq!(n.normalize("小").as_deref(), Some("小"));
        assert_eq!(n.normalize("先生").as_deref(), Some("先生"));
        assert_eq!(n.normalize("王先生").as_deref(), Some("王"));
    }

    #[test]
    fn test_traditional_and_simplified_share_a_key() {
        let n = NameNormalizer::default();
        assert_eq!(n.normalize("張三"), n.normalize("张三"));
        assert_eq!(n.display_name("張三").as_deref(), Some("張三"));
    }

    #[test]
    fn test_relational_policy() {
        let drop = NameNormalizer::new(RelationalNames::Drop);
        let keep = NameNormalizer::new(RelationalNames::Keep);
        assert_eq!(drop.normalize("张三的父亲"), None);
        assert_eq!(drop.normalize("Anna's Father"), None);
        assert!(keep.normalize("张三的父亲").is_some());
        assert!(keep.normalize("Anna's father").is_some());
    }

    #[test]
    fn test_location_keys_fold_dashes() {
        let n = NameNormalizer::default();
        assert_eq!(n.location_key("圣—安东尼奥"), n.location_key("圣-安东尼奥"));
        assert_eq!(n.location_key("  "), None);
    }

    #[test]
    fn test_empty_after_annotation_is_rejected() {
        let n = NameNormalizer::default();
        assert_eq!(n.normalize("（旁白）"), None);
        assert_eq!(n.normalize(""), None);
    }
}
