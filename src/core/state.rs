use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::core::analysis::ChunkAnalysis;
use crate::core::normalize::NameNormalizer;
use crate::core::timeline::{admit, normalize_timeline, ArcTag, SlotQuotas, TimelineEvent};

/// Structural or meta-narrative terms that describe how the book is written
/// rather than what it is about.
pub const META_THEMES: &[&str] = &[
    "文本过渡",
    "多重视角",
    "叙事结构",
    "文本结构",
    "视角转换",
    "章节划分",
    "结构特征",
    "叙事视角",
    "文本特点",
    "行文风格",
    "写作手法",
    "叙述方式",
];

const MAX_OUTPUT_THEMES: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TimelineMode {
    #[default]
    Positional,
    Curated,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StateSettings {
    pub timeline_mode: TimelineMode,
    pub pending_threshold: usize,
    pub quotas: SlotQuotas,
    pub summary_ceiling: usize,
}

impl Default for StateSettings {
    fn default() -> Self {
        Self {
            timeline_mode: TimelineMode::default(),
            pending_threshold: 8,
            quotas: SlotQuotas::default(),
            summary_ceiling: 1500,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityKind {
    Character,
    Location,
}

impl EntityKind {
    pub fn label(&self) -> &'static str {
        match self {
            EntityKind::Character => "人物",
            EntityKind::Location => "地点",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoryEvent {
    pub event: String,
    pub percent: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    pub key: String,
    pub display_name: String,
    pub fragments: Vec<String>,
    pub consolidated: Option<String>,
    pub events: Vec<StoryEvent>,
    first_seen: usize,
}

impl Entity {
    fn new(key: String, display_name: String, first_seen: usize) -> Self {
        Self {
            key,
            display_name,
            fragments: Vec::new(),
            consolidated: None,
            events: Vec::new(),
            first_seen,
        }
    }

    /// An entity whose stored description is final until a new fragment
    /// reopens it.
    fn settled(key: String, display_name: String, description: &str, first_seen: usize) -> Self {
        let mut entity = Self::new(key, display_name, first_seen);
        if !description.is_empty() {
            entity.fragments.push(description.to_string());
            entity.consolidated = Some(description.to_string());
        }
        entity
    }

    pub fn combined(&self) -> String {
        self.fragments.join(" ")
    }

    pub fn description(&self) -> String {
        self.consolidated.clone().unwrap_or_else(|| self.combined())
    }

    pub fn is_consolidated(&self) -> bool {
        self.consolidated.is_some()
    }

    /// `(count > 1 and length > 300) or length > 500`, for entities that
    /// still carry raw fragments.
    pub fn needs_consolidation(&self) -> bool {
        if self.consolidated.is_some() {
            return false;
        }
        let length = self.combined().chars().count();
        (self.fragments.len() > 1 && length > 300) || length > 500
    }

    /// Puts the consolidated text back in front of the fragment list so the
    /// next consolidation sees everything.
    fn reopen(&mut self) {
        if let Some(text) = self.consolidated.take() {
            if self.fragments.first() != Some(&text) {
                self.fragments.insert(0, text);
            }
        }
    }

    fn add_fragment(&mut self, fragment: String) {
        self.reopen();
        self.fragments.push(fragment);
    }

    fn importance(&self) -> usize {
        self.description().chars().count() + self.fragments.len() * 50
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DescriptionTask {
    pub kind: EntityKind,
    pub key: String,
    pub name: String,
    pub combined: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    pub new_characters: usize,
    pub new_locations: usize,
    pub timeline_due: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateStats {
    pub characters: usize,
    pub locations: usize,
    pub themes: usize,
    pub events: usize,
    pub summary_parts: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MasterState {
    pub book_title: String,
    pub author: String,
    pub author_bio: String,
    characters: BTreeMap<String, Entity>,
    locations: BTreeMap<String, Entity>,
    themes: Vec<String>,
    unattributed: Vec<StoryEvent>,
    timeline: Vec<TimelineEvent>,
    pending: Vec<TimelineEvent>,
    summary_parts: Vec<String>,
    next_ordinal: usize,
    settings: StateSettings,
    normalizer: NameNormalizer,
}

impl MasterState {
    pub fn new(
        book_title: &str,
        author: &str,
        settings: StateSettings,
        normalizer: NameNormalizer,
    ) -> Self {
        Self {
            book_title: book_title.to_string(),
            author: author.to_string(),
            author_bio: String::new(),
            characters: BTreeMap::new(),
            locations: BTreeMap::new(),
            themes: Vec::new(),
            unattributed: Vec::new(),
            timeline: Vec::new(),
            pending: Vec::new(),
            summary_parts: Vec::new(),
            next_ordinal: 0,
            settings,
            normalizer,
        }
    }

    pub fn settings(&self) -> &StateSettings {
        &self.settings
    }

    pub fn character(&self, key: &str) -> Option<&Entity> {
        self.characters.get(key)
    }

    pub fn location(&self, key: &str) -> Option<&Entity> {
        self.locations.get(key)
    }

    pub fn characters(&self) -> impl Iterator<Item = &Entity> {
        self.characters.values()
    }

    pub fn locations(&self) -> impl Iterator<Item = &Entity> {
        self.locations.values()
    }

    pub fn themes(&self) -> &[String] {
        &self.themes
    }

    pub fn summary_parts(&self) -> &[String] {
        &self.summary_parts
    }

    pub fn timeline(&self) -> &[TimelineEvent] {
        &self.timeline
    }

    pub fn pending_events(&self) -> &[TimelineEvent] {
        &self.pending
    }

    pub fn stats(&self) -> StateStats {
        let events = match self.settings.timeline_mode {
            TimelineMode::Positional => {
                self.unattributed.len()
                    + self.characters.values().map(|c| c.events.len()).sum::<usize>()
            }
            TimelineMode::Curated => self.timeline.len() + self.pending.len(),
        };
        StateStats {
            characters: self.characters.len(),
            locations: self.locations.len(),
            themes: self.themes.len(),
            events,
            summary_parts: self.summary_parts.len(),
        }
    }

    pub fn merge_chunk(&mut self, analysis: ChunkAnalysis, window: (f64, f64)) -> MergeOutcome {
        let mut outcome = MergeOutcome::default();

        for mention in &analysis.characters {
            let Some(key) = self.normalizer.normalize(&mention.name) else {
                continue;
            };
            if !self.characters.contains_key(&key) {
                let display = self
                    .normalizer
                    .display_name(&mention.name)
                    .unwrap_or_else(|| key.clone());
                let ordinal = self.bump_ordinal();
                self.characters
                    .insert(key.clone(), Entity::new(key.clone(), display, ordinal));
                outcome.new_characters += 1;
            }
            let description = self.normalizer.fold_text(mention.description.trim());
            if let Some(entity) = self.characters.get_mut(&key) {
                if !description.is_empty() {
                    entity.add_fragment(description);
                }
            }
        }

        for mention in &analysis.locations {
            let Some(key) = self.normalizer.location_key(&mention.name) else {
                continue;
            };
            if !self.locations.contains_key(&key) {
                let ordinal = self.bump_ordinal();
                self.locations.insert(
                    key.clone(),
                    Entity::new(key.clone(), mention.name.trim().to_string(), ordinal),
                );
                outcome.new_locations += 1;
            }
            let description = self.normalizer.fold_text(mention.description.trim());
            if let Some(entity) = self.locations.get_mut(&key) {
                if !description.is_empty() {
                    entity.add_fragment(description);
                }
            }
        }

        for theme in &analysis.themes {
            self.add_theme(theme);
        }

        outcome.timeline_due = self.merge_events(&analysis, window);

        let summary = analysis.summary.trim();
        if !summary.is_empty() {
            self.summary_parts.push(summary.to_string());
        }

        update_if_present(&mut self.book_title, analysis.book_title.as_deref());
        update_if_present(&mut self.author, analysis.author.as_deref());
        update_if_present(&mut self.author_bio, analysis.author_bio.as_deref());

        outcome
    }

    fn bump_ordinal(&mut self) -> usize {
        let ordinal = self.next_ordinal;
        self.next_ordinal += 1;
        ordinal
    }

    fn add_theme(&mut self, theme: &str) {
        let theme = theme.trim();
        if theme.is_empty() || META_THEMES.contains(&theme) {
            return;
        }
        if !self.themes.iter().any(|t| t == theme) {
            self.themes.push(theme.to_string());
        }
    }

    fn merge_events(&mut self, analysis: &ChunkAnalysis, (start, end): (f64, f64)) -> bool {
        let count = analysis.events.len();
        let mut major_seen = false;

        for (i, mention) in analysis.events.iter().enumerate() {
            let detail = mention.detail();
            let text = detail.event.trim().to_string();
            if text.is_empty() {
                continue;
            }
            let relative = detail
                .position
                .filter(|p| p.is_finite())
                .map(|p| p.clamp(0.0, 1.0))
                .unwrap_or((i as f64 + 0.5) / count as f64);
            let percent = start + relative * (end - start);

            match self.settings.timeline_mode {
                TimelineMode::Positional => {
                    let owner = detail
                        .character
                        .as_deref()
                        .and_then(|name| self.normalizer.normalize(name))
                        .filter(|key| self.characters.contains_key(key));
                    let event = StoryEvent { event: text, percent };
                    match owner.and_then(|key| self.characters.get_mut(&key)) {
                        Some(entity) => {
                            if !entity.events.iter().any(|e| e.event == event.event) {
                                entity.events.push(event);
                            }
                        }
                        None => {
                            if !self.unattributed.iter().any(|e| e.event == event.event) {
                                self.unattributed.push(event);
                            }
                        }
                    }
                }
                TimelineMode::Curated => {
                    major_seen |= detail.major;
                    self.pending.push(TimelineEvent {
                        arc: detail.arc_tag().unwrap_or_else(|| ArcTag::from_percent(percent)),
                        importance: detail.importance_level(),
                        event: text,
                        percent,
                    });
                }
            }
        }

        self.settings.timeline_mode == TimelineMode::Curated
            && !self.pending.is_empty()
            && (major_seen || self.pending.len() >= self.settings.pending_threshold)
    }

    pub fn description_tasks(&self) -> Vec<DescriptionTask> {
        let characters = self
            .characters
            .values()
            .map(|e| (EntityKind::Character, e));
        let locations = self.locations.values().map(|e| (EntityKind::Location, e));
        characters
            .chain(locations)
            .filter(|(_, e)| e.needs_consolidation())
            .map(|(kind, e)| DescriptionTask {
                kind,
                key: e.key.clone(),
                name: e.display_name.clone(),
                combined: e.combined(),
            })
            .collect()
    }

    pub fn summary_needs_consolidation(&self) -> bool {
        match self.summary_parts.as_slice() {
            [] => false,
            [only] => only.chars().count() > self.settings.summary_ceiling,
            _ => true,
        }
    }

    pub fn combined_summary(&self) -> String {
        self.summary_parts.join(" ")
    }

    pub fn apply_description(&mut self, kind: EntityKind, key: &str, text: &str) -> bool {
        let text = text.trim();
        let map = match kind {
            EntityKind::Character => &mut self.characters,
            EntityKind::Location => &mut self.locations,
        };
        match map.get_mut(key) {
            Some(entity) if !text.is_empty() => {
                entity.fragments = vec![text.to_string()];
                entity.consolidated = Some(text.to_string());
                true
            }
            _ => false,
        }
    }

    pub fn apply_summary(&mut self, text: &str) -> bool {
        let text = text.trim();
        if text.is_empty() {
            return false;
        }
        self.summary_parts = vec![text.to_string()];
        true
    }

    pub fn apply_timeline(&mut self, events: Vec<TimelineEvent>) {
        let mut timeline = Vec::with_capacity(events.len());
        for event in events {
            admit(&mut timeline, event, &self.settings.quotas);
        }
        normalize_timeline(&mut timeline, &self.settings.quotas);
        self.timeline = timeline;
        self.pending.clear();
    }

    pub fn admit_pending(&mut self) {
        let pending = std::mem::take(&mut self.pending);
        for event in pending {
            admit(&mut self.timeline, event, &self.settings.quotas);
        }
        normalize_timeline(&mut self.timeline, &self.settings.quotas);
    }

    fn ranked(entities: &BTreeMap<String, Entity>) -> Vec<NamedDescription> {
        let mut items: Vec<&Entity> = entities.values().collect();
        items.sort_by(|a, b| {
            b.importance()
                .cmp(&a.importance())
                .then(a.first_seen.cmp(&b.first_seen))
        });
        items
            .into_iter()
            .map(|e| NamedDescription {
                name: e.display_name.clone(),
                description: e.description(),
            })
            .collect()
    }

    fn timeline_records(&self) -> Vec<TimelineRecord> {
        let events: Vec<(String, ArcTag, f64)> = match self.settings.timeline_mode {
            TimelineMode::Positional => {
                let mut all: Vec<&StoryEvent> = self
                    .characters
                    .values()
                    .flat_map(|c| c.events.iter())
                    .chain(self.unattributed.iter())
                    .collect();
                all.sort_by(|a, b| a.percent.total_cmp(&b.percent));
                let mut seen = HashSet::new();
                all.into_iter()
                    .filter(|e| seen.insert(e.event.clone()))
                    .map(|e| (e.event.clone(), ArcTag::from_percent(e.percent), e.percent))
                    .collect()
            }
            TimelineMode::Curated => {
                let mut timeline = self.timeline.clone();
                timeline.sort_by(|a, b| a.percent.total_cmp(&b.percent));
                timeline
                    .into_iter()
                    .map(|e| (e.event, e.arc, e.percent))
                    .collect()
            }
        };

        events
            .into_iter()
            .enumerate()
            .map(|(i, (event, arc, percent))| TimelineRecord {
                sequence: i + 1,
                event,
                arc: Some(arc),
                book_position_pct: Some((percent * 10.0).round() / 10.0),
            })
            .collect()
    }

    pub fn to_document(&self, progress: u8) -> XrayDocument {
        XrayDocument {
            book_title: self.book_title.clone(),
            author: self.author.clone(),
            author_bio: self.author_bio.clone(),
            summary: self.combined_summary(),
            characters: Self::ranked(&self.characters),
            locations: Self::ranked(&self.locations),
            themes: self.themes.iter().take(MAX_OUTPUT_THEMES).cloned().collect(),
            timeline: self.timeline_records(),
            pending_events: self.pending.clone(),
            analysis_progress: progress,
        }
    }

    /// Rebuilds a state from a checkpoint. Stored descriptions become both
    /// the only fragment and the consolidated value, so they stay final
    /// until a new fragment for the same entity arrives.
    pub fn restore(doc: &XrayDocument, settings: StateSettings, normalizer: NameNormalizer) -> Self {
        let mut state = Self::new(&doc.book_title, &doc.author, settings, normalizer);
        state.author_bio = doc.author_bio.clone();

        for item in &doc.characters {
            let name = item.name.trim();
            if name.is_empty() {
                continue;
            }
            let key = state
                .normalizer
                .normalize(name)
                .unwrap_or_else(|| name.to_string());
            if state.characters.contains_key(&key) {
                continue;
            }
            let ordinal = state.bump_ordinal();
            state.characters.insert(
                key.clone(),
                Entity::settled(key, name.to_string(), item.description.trim(), ordinal),
            );
        }

        for item in &doc.locations {
            let name = item.name.trim();
            let Some(key) = state.normalizer.location_key(name) else {
                continue;
            };
            if state.locations.contains_key(&key) {
                continue;
            }
            let ordinal = state.bump_ordinal();
            state.locations.insert(
                key.clone(),
                Entity::settled(key, name.to_string(), item.description.trim(), ordinal),
            );
        }

        for theme in &doc.themes {
            state.add_theme(theme);
        }

        let count = doc.timeline.len().max(1) as f64;
        for (i, record) in doc.timeline.iter().enumerate() {
            let percent = record
                .book_position_pct
                .unwrap_or((i as f64 + 1.0) / count * f64::from(doc.analysis_progress));
            match state.settings.timeline_mode {
                TimelineMode::Positional => state.unattributed.push(StoryEvent {
                    event: record.event.clone(),
                    percent,
                }),
                TimelineMode::Curated => state.timeline.push(TimelineEvent {
                    event: record.event.clone(),
                    arc: record.arc.unwrap_or_else(|| ArcTag::from_percent(percent)),
                    percent,
                    importance: 3,
                }),
            }
        }

        if state.settings.timeline_mode == TimelineMode::Curated {
            state.pending = doc
                .pending_events
                .iter()
                .filter(|e| !e.event.trim().is_empty())
                .cloned()
                .collect();
        }

        if !doc.summary.trim().is_empty() {
            state.summary_parts.push(doc.summary.trim().to_string());
        }
        state
    }
}

fn update_if_present(field: &mut String, value: Option<&str>) {
    if let Some(value) = value.map(str::trim).filter(|v| !v.is_empty()) {
        *field = value.to_string();
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NamedDescription {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimelineRecord {
    pub sequence: usize,
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arc: Option<ArcTag>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub book_position_pct: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct XrayDocument {
    pub book_title: String,
    pub author: String,
    pub author_bio: String,
    pub summary: String,
    pub characters: Vec<NamedDescription>,
    pub locations: Vec<NamedDescription>,
    pub themes: Vec<String>,
    pub timeline: Vec<TimelineRecord>,
    /// Curated-mode events not yet merged into the timeline.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub pending_events: Vec<TimelineEvent>,
    pub analysis_progress: u8,
}
