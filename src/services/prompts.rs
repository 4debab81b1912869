use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Prompts {
    pub system_instruction: String,
    /// `{title}` `{author}` `{progress}` `{text}`
    pub chunk_summary: String,
    /// `{kind}` `{name}` `{description}`
    pub consolidate_description: String,
    /// `{title}` `{summary}`
    pub consolidate_summary: String,
    /// `{title}` `{progress}` `{existing}` `{new}`
    pub event_consolidation: String,
}

impl Default for Prompts {
    fn default() -> Self {
        Self {
            system_instruction: SYSTEM_INSTRUCTION.to_string(),
            chunk_summary: CHUNK_SUMMARY.to_string(),
            consolidate_description: CONSOLIDATE_DESCRIPTION.to_string(),
            consolidate_summary: CONSOLIDATE_SUMMARY.to_string(),
            event_consolidation: EVENT_CONSOLIDATION.to_string(),
        }
    }
}

impl Prompts {
    pub fn load(path: Option<&str>) -> Result<Self> {
        match path {
            Some(path) => {
                let content = std::fs::read_to_string(Path::new(path))
                    .with_context(|| format!("Failed to read prompts file {}", path))?;
                serde_json::from_str(&content)
                    .with_context(|| format!("Failed to parse prompts file {}", path))
            }
            None => Ok(Self::default()),
        }
    }

    pub fn chunk_summary(&self, title: &str, author: &str, progress: u8, text: &str) -> String {
        render(
            &self.chunk_summary,
            &[
                ("title", title),
                ("author", author),
                ("progress", &progress.to_string()),
                ("text", text),
            ],
        )
    }

    pub fn consolidate_description(&self, kind: &str, name: &str, description: &str) -> String {
        render(
            &self.consolidate_description,
            &[("kind", kind), ("name", name), ("description", description)],
        )
    }

    pub fn consolidate_summary(&self, title: &str, summary: &str) -> String {
        render(&self.consolidate_summary, &[("title", title), ("summary", summary)])
    }

    pub fn event_consolidation(&self, title: &str, progress: u8, existing: &str, new: &str) -> String {
        render(
            &self.event_consolidation,
            &[
                ("title", title),
                ("progress", &progress.to_string()),
                ("existing", existing),
                ("new", new),
            ],
        )
    }
}

/// Single left-to-right pass, so text inserted for one placeholder is never
/// scanned for another.
pub fn render(template: &str, values: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len() + values.iter().map(|(_, v)| v.len()).sum::<usize>());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let replaced = after.find('}').and_then(|close| {
            let key = &after[..close];
            values
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| (*v, close))
        });
        match replaced {
            Some((value, close)) => {
                out.push_str(value);
                rest = &after[close + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

const SYSTEM_INSTRUCTION: &str = "你是一位专业的文学分析助手，负责为电子书阅读器生成 X-Ray 资料（人物、地点、主题、时间线与剧情摘要）。\
你的分析必须忠实于原文，不得编造。请始终使用简体中文，并且只返回一个有效的 JSON 对象，不要附加任何解释或 Markdown。";

const CHUNK_SUMMARY: &str = r#"书名：《{title}》
作者：{author}
阅读进度：已读到全书约 {progress}%

请阅读下面这段正文，提取 X-Ray 信息。要求：
- 描述要像一次读完全书后写出的资料，不要出现“本片段”“新文本中”之类的说法；
- 人物名称使用原文中最完整、最常用的写法，不要加括号注释；
- 只记录对剧情有意义的人物和地点；
- 主题是关于内容的主题（如“贪婪”“亲情”），不要写叙事结构、视角等写作手法；
- events 按原文顺序列出本段的重要事件，position 为事件在本段中的相对位置（0 到 1），character 为主要相关人物，major 表示是否为全书级别的转折。

返回如下 JSON：
{"book_title": "书名（可选）", "author": "作者（可选）", "author_bio": "作者简介（可选）",
 "summary": "本段剧情概要",
 "characters": [{"name": "人物名", "description": "人物描述"}],
 "locations": [{"name": "地点名", "description": "地点描述"}],
 "themes": ["主题"],
 "events": [{"event": "事件", "character": "人物名", "position": 0.5, "major": false}]}

正文：
{text}"#;

const CONSOLIDATE_DESCRIPTION: &str = r#"下面是关于{kind}“{name}”的多段描述，来自同一本书的不同部分，可能有重复或前后矛盾。
请把它们整合成一段连贯、简洁的描述（不超过 300 字），保留关键身份、关系和经历，去掉重复内容，以后来的信息为准。

描述：
{description}

返回如下 JSON：
{"description": "整合后的描述"}"#;

const CONSOLIDATE_SUMMARY: &str = r#"下面是《{title}》按阅读顺序写成的多段剧情概要。
请把它们整合成一篇连贯的剧情摘要（不超过 800 字），按时间顺序叙述，保留主要转折，不要提及“片段”或“段落”。

概要：
{summary}

返回如下 JSON：
{"summary": "整合后的剧情摘要"}"#;

const EVENT_CONSOLIDATION: &str = r#"书名：《{title}》，当前阅读进度约 {progress}%。

已有时间线：
{existing}

新发现的事件：
{new}

请把新事件并入已有时间线：合并重复或相近的事件，保留对全书剧情最重要的事件。
每个事件标注 arc（setup、rising、climax、falling、resolution 之一）、importance（1 到 5）以及 book_position_pct（事件在全书中的位置，百分比）。
返回完整的时间线，按 book_position_pct 排序，如下 JSON：
{"events": [{"event": "事件", "arc": "rising", "importance": 3, "book_position_pct": 12.5}]}"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_fills_placeholders_once() {
        let out = render("{a} and {b} {unknown} {", &[("a", "{b}"), ("b", "2")]);
        assert_eq!(out, "{b} and 2 {unknown} {");
    }

    #[test]
    fn test_builtin_templates_keep_json_braces() {
        let prompts = Prompts::default();
        let out = prompts.consolidate_summary("珍珠", "甲。乙。");
        assert!(out.contains("《珍珠》"));
        assert!(out.contains("甲。乙。"));
        assert!(out.contains(r#"{"summary": "整合后的剧情摘要"}"#));

        let out = prompts.chunk_summary("珍珠", "斯坦贝克", 42, "正文内容");
        assert!(out.contains("42%"));
        assert!(out.ends_with("正文内容"));
    }

    #[test]
    fn test_partial_override_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("prompts.json");
        std::fs::write(&path, r#"{"consolidate_summary": "S:{summary}"}"#)?;

        let prompts = Prompts::load(Some(path.to_str().unwrap()))?;
        assert_eq!(prompts.consolidate_summary("t", "x"), "S:x");
        assert_eq!(prompts.system_instruction, Prompts::default().system_instruction);
        Ok(())
    }
}
