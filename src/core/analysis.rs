use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use std::collections::HashMap;

use crate::core::timeline::ArcTag;
use crate::utils::text::{sanitize_text, strip_code_blocks};

const MAX_THEMES_PER_CHUNK: usize = 8;

fn nullable<'de, D, T>(d: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(d)?.unwrap_or_default())
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ChunkAnalysis {
    pub book_title: Option<String>,
    pub author: Option<String>,
    pub author_bio: Option<String>,
    #[serde(deserialize_with = "nullable")]
    pub summary: String,
    #[serde(deserialize_with = "nullable")]
    pub characters: Vec<EntityMention>,
    #[serde(deserialize_with = "nullable")]
    pub locations: Vec<EntityMention>,
    #[serde(deserialize_with = "nullable")]
    pub themes: Vec<String>,
    #[serde(deserialize_with = "nullable")]
    pub events: Vec<EventMention>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct EntityMention {
    #[serde(deserialize_with = "nullable")]
    pub name: String,
    #[serde(deserialize_with = "nullable")]
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct EventDetail {
    #[serde(deserialize_with = "nullable")]
    pub event: String,
    /// Character the event belongs to.
    pub character: Option<String>,
    /// Relative position inside the chunk, 0.0 to 1.0.
    pub position: Option<f64>,
    pub arc: Option<String>,
    pub importance: Option<f64>,
    #[serde(deserialize_with = "nullable")]
    pub major: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum EventMention {
    Text(String),
    Detailed(EventDetail),
}

impl EventMention {
    pub fn detail(&self) -> EventDetail {
        match self {
            EventMention::Text(text) => EventDetail {
                event: text.clone(),
                ..Default::default()
            },
            EventMention::Detailed(detail) => detail.clone(),
        }
    }

    pub fn text(&self) -> &str {
        match self {
            EventMention::Text(text) => text,
            EventMention::Detailed(detail) => &detail.event,
        }
    }
}

impl EventDetail {
    pub fn arc_tag(&self) -> Option<ArcTag> {
        self.arc.as_deref().and_then(ArcTag::parse)
    }

    pub fn importance_level(&self) -> u8 {
        let base = self.importance.unwrap_or(if self.major { 5.0 } else { 3.0 });
        base.round().clamp(1.0, 5.0) as u8
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct DescriptionResponse {
    #[serde(deserialize_with = "nullable")]
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct SummaryResponse {
    #[serde(deserialize_with = "nullable")]
    pub summary: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct TimelineEntry {
    #[serde(deserialize_with = "nullable")]
    pub event: String,
    pub arc: Option<String>,
    pub importance: Option<f64>,
    pub book_position_pct: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum TimelineItem {
    Text(String),
    Detailed(TimelineEntry),
}

impl TimelineItem {
    pub fn entry(self) -> TimelineEntry {
        match self {
            TimelineItem::Text(event) => TimelineEntry {
                event,
                ..Default::default()
            },
            TimelineItem::Detailed(entry) => entry,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct TimelineResponse {
    #[serde(deserialize_with = "nullable")]
    pub events: Vec<TimelineItem>,
}

/// Strips code fences and checks the payload is a single JSON object.
pub fn parse_object(raw: &str) -> Result<serde_json::Value, String> {
    let cleaned = strip_code_blocks(raw);
    let value: serde_json::Value =
        serde_json::from_str(&cleaned).map_err(|e| format!("invalid JSON: {e}"))?;
    if !value.is_object() {
        return Err(format!("expected a JSON object, got: {}", preview(&cleaned)));
    }
    Ok(value)
}

pub fn decode<T: DeserializeOwned>(value: serde_json::Value) -> Result<T, String> {
    serde_json::from_value(value).map_err(|e| format!("unexpected shape: {e}"))
}

fn preview(s: &str) -> String {
    s.chars().take(120).collect()
}

impl ChunkAnalysis {
    /// Per-chunk tidy-up before the result touches the master state:
    /// incremental phrasing removed, repeated names collapsed keeping the
    /// longer description, blank entries and duplicate themes dropped.
    pub fn cleaned(mut self) -> Self {
        self.summary = sanitize_text(&self.summary);
        self.characters = dedupe_mentions(self.characters);
        self.locations = dedupe_mentions(self.locations);

        let mut themes: Vec<String> = Vec::new();
        for theme in self.themes.iter().map(|t| t.trim()) {
            if !theme.is_empty() && !themes.iter().any(|t| t == theme) {
                themes.push(theme.to_string());
            }
        }
        themes.truncate(MAX_THEMES_PER_CHUNK);
        self.themes = themes;

        self.events.retain(|e| !e.text().trim().is_empty());
        self
    }
}

fn dedupe_mentions(mentions: Vec<EntityMention>) -> Vec<EntityMention> {
    let mut out: Vec<EntityMention> = Vec::new();
    let mut seen: HashMap<String, usize> = HashMap::new();
    for mention in mentions {
        let name = mention.name.trim().to_string();
        if name.is_empty() {
            continue;
        }
        let description = sanitize_text(&mention.description);
        match seen.get(&name) {
            Some(&i) => {
                if description.chars().count() > out[i].description.chars().count() {
                    out[i].description = description;
                }
            }
            None => {
                seen.insert(name.clone(), out.len());
                out.push(EntityMention { name, description });
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_analysis_tolerates_nulls_and_string_events() {
        let raw = r#"```json
        {
            "summary": null,
            "characters": [{"name": "胡安娜", "description": null}],
            "locations": null,
            "themes": ["爱情"],
            "events": ["她离开了家", {"event": "他回来了", "character": "基诺", "position": 0.8, "major": true}]
        }
        ```"#;
        let analysis: ChunkAnalysis = decode(parse_object(raw).unwrap()).unwrap();
        assert_eq!(analysis.summary, "");
        assert_eq!(analysis.characters[0].description, "");
        assert!(analysis.locations.is_empty());
        assert_eq!(analysis.events.len(), 2);
        assert_eq!(analysis.events[0].text(), "她离开了家");

        let detail = analysis.events[1].detail();
        assert_eq!(detail.character.as_deref(), Some("基诺"));
        assert_eq!(detail.importance_level(), 5);
    }

    #[test]
    fn test_non_object_is_rejected() {
        assert!(parse_object("[1, 2]").is_err());
        assert!(parse_object("not json").is_err());
        assert!(parse_object("```json\n{}\n```").is_ok());
    }

    #[test]
    fn test_wrong_shape_is_rejected() {
        let value = parse_object(r#"{"characters": "everyone"}"#).unwrap();
        assert!(decode::<ChunkAnalysis>(value).is_err());
    }

    #[test]
    fn test_cleaned_keeps_longer_duplicate_description() {
        let analysis = ChunkAnalysis {
            summary: "本片段中，基诺找到了珍珠。".to_string(),
            characters: vec![
                EntityMention { name: "基诺".into(), description: "渔夫".into() },
                EntityMention { name: " 基诺 ".into(), description: "贫穷的渔夫".into() },
                EntityMention { name: "".into(), description: "无名".into() },
            ],
            themes: vec!["贪婪".into(), "贪婪".into(), " ".into()],
            events: vec![EventMention::Text("  ".into())],
            ..Default::default()
        }
        .cleaned();

        assert_eq!(analysis.summary, "，基诺找到了珍珠。");
        assert_eq!(analysis.characters.len(), 1);
        assert_eq!(analysis.characters[0].description, "贫穷的渔夫");
        assert_eq!(analysis.themes, vec!["贪婪".to_string()]);
        assert!(analysis.events.is_empty());
    }

    #[test]
    fn test_timeline_response_accepts_mixed_items() {
        let value = parse_object(
            r#"{"events": ["开场", {"event": "决战", "arc": "climax", "importance": 5, "book_position_pct": 71}]}"#,
        )
        .unwrap();
        let response: TimelineResponse = decode(value).unwrap();
        let entries: Vec<_> = response.events.into_iter().map(TimelineItem::entry).collect();
        assert_eq!(entries[0].event, "开场");
        assert_eq!(entries[1].book_position_pct, Some(71.0));
    }
}
