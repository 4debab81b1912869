use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArcTag {
    Setup,
    Rising,
    Climax,
    Falling,
    Resolution,
}

impl ArcTag {
    pub const ALL: [ArcTag; 5] = [
        ArcTag::Setup,
        ArcTag::Rising,
        ArcTag::Climax,
        ArcTag::Falling,
        ArcTag::Resolution,
    ];

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "setup" | "exposition" | "开端" | "开篇" | "铺垫" => Some(ArcTag::Setup),
            "rising" | "rising_action" | "rising action" | "发展" | "上升" => Some(ArcTag::Rising),
            "climax" | "高潮" => Some(ArcTag::Climax),
            "falling" | "falling_action" | "falling action" | "回落" | "下降" => {
                Some(ArcTag::Falling)
            }
            "resolution" | "ending" | "denouement" | "结局" | "尾声" => Some(ArcTag::Resolution),
            _ => None,
        }
    }

    pub fn from_percent(percent: f64) -> Self {
        match percent {
            p if p < 20.0 => ArcTag::Setup,
            p if p < 60.0 => ArcTag::Rising,
            p if p < 75.0 => ArcTag::Climax,
            p if p < 90.0 => ArcTag::Falling,
            _ => ArcTag::Resolution,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ArcTag::Setup => "setup",
            ArcTag::Rising => "rising",
            ArcTag::Climax => "climax",
            ArcTag::Falling => "falling",
            ArcTag::Resolution => "resolution",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub event: String,
    pub arc: ArcTag,
    pub percent: f64,
    /// 1 (minor) to 5 (pivotal).
    pub importance: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlotQuotas {
    pub setup: usize,
    pub rising: usize,
    pub climax: usize,
    pub falling: usize,
    pub resolution: usize,
    pub max_events: usize,
}

impl Default for SlotQuotas {
    fn default() -> Self {
        Self {
            setup: 3,
            rising: 6,
            climax: 4,
            falling: 4,
            resolution: 3,
            max_events: 20,
        }
    }
}

impl SlotQuotas {
    pub fn limit(&self, arc: ArcTag) -> usize {
        match arc {
            ArcTag::Setup => self.setup,
            ArcTag::Rising => self.rising,
            ArcTag::Climax => self.climax,
            ArcTag::Falling => self.falling,
            ArcTag::Resolution => self.resolution,
        }
    }
}

/// Inserts `candidate` into `timeline` without breaking the quotas. When
/// the candidate's arc (or the whole timeline) is full, the least important
/// entry it competes with is replaced if the candidate outranks it.
/// Returns whether the candidate was kept.
pub fn admit(timeline: &mut Vec<TimelineEvent>, candidate: TimelineEvent, quotas: &SlotQuotas) -> bool {
    if timeline.iter().any(|e| e.event == candidate.event) {
        return false;
    }

    let arc_count = timeline.iter().filter(|e| e.arc == candidate.arc).count();
    let arc_full = arc_count >= quotas.limit(candidate.arc);
    let total_full = timeline.len() >= quotas.max_events;

    if !arc_full && !total_full {
        timeline.push(candidate);
        return true;
    }

    let weakest = timeline
        .iter()
        .enumerate()
        .filter(|(_, e)| !arc_full || e.arc == candidate.arc)
        .min_by(|(_, a), (_, b)| {
            a.importance
                .cmp(&b.importance)
                .then(b.percent.total_cmp(&a.percent))
        })
        .map(|(i, e)| (i, e.importance));

    match weakest {
        Some((i, importance)) if importance < candidate.importance => {
            timeline[i] = candidate;
            true
        }
        _ => false,
    }
}

/// Orders events by story position and trims anything over quota, which
/// can happen when a restored timeline predates smaller quotas.
pub fn normalize_timeline(timeline: &mut Vec<TimelineEvent>, quotas: &SlotQuotas) {
    let mut ranked = std::mem::take(timeline);
    ranked.sort_by(|a, b| b.importance.cmp(&a.importance).then(a.percent.total_cmp(&b.percent)));

    let mut per_arc: HashMap<ArcTag, usize> = HashMap::new();
    for event in ranked {
        let used = per_arc.entry(event.arc).or_default();
        if *used < quotas.limit(event.arc) && timeline.len() < quotas.max_events {
            *used += 1;
            timeline.push(event);
        }
    }
    timeline.sort_by(|a, b| a.percent.total_cmp(&b.percent));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(text: &str, arc: ArcTag, importance: u8, percent: f64) -> TimelineEvent {
        TimelineEvent {
            event: text.to_string(),
            arc,
            percent,
            importance,
        }
    }

    #[test]
    fn test_full_arc_replaces_least_important() {
        let quotas = SlotQuotas { setup: 2, ..Default::default() };
        let mut timeline = vec![
            event("a", ArcTag::Setup, 3, 1.0),
            event("b", ArcTag::Setup, 1, 2.0),
            event("c", ArcTag::Rising, 1, 30.0),
        ];

        assert!(admit(&mut timeline, event("d", ArcTag::Setup, 4, 5.0), &quotas));
        let texts: Vec<_> = timeline.iter().map(|e| e.event.as_str()).collect();
        assert_eq!(texts, vec!["a", "d", "c"]);

        assert!(!admit(&mut timeline, event("e", ArcTag::Setup, 2, 6.0), &quotas));
        assert_eq!(timeline.len(), 3);
    }

    #[test]
    fn test_total_cap_is_respected() {
        let quotas = SlotQuotas { max_events: 2, ..Default::default() };
        let mut timeline = vec![
            event("a", ArcTag::Setup, 2, 1.0),
            event("b", ArcTag::Rising, 3, 40.0),
        ];
        assert!(admit(&mut timeline, event("c", ArcTag::Climax, 5, 70.0), &quotas));
        assert_eq!(timeline.len(), 2);
        assert!(timeline.iter().all(|e| e.event != "a"));
    }

    #[test]
    fn test_duplicate_text_is_ignored() {
        let mut timeline = vec![event("a", ArcTag::Setup, 2, 1.0)];
        assert!(!admit(&mut timeline, event("a", ArcTag::Setup, 5, 1.0), &SlotQuotas::default()));
    }

    #[test]
    fn test_normalize_trims_and_sorts() {
        let quotas = SlotQuotas { climax: 1, ..Default::default() };
        let mut timeline = vec![
            event("late", ArcTag::Climax, 2, 72.0),
            event("early", ArcTag::Setup, 1, 3.0),
            event("peak", ArcTag::Climax, 5, 70.0),
        ];
        normalize_timeline(&mut timeline, &quotas);
        let texts: Vec<_> = timeline.iter().map(|e| e.event.as_str()).collect();
        assert_eq!(texts, vec!["early", "peak"]);
    }

    #[test]
    fn test_arc_parsing() {
        assert_eq!(ArcTag::parse("Climax"), Some(ArcTag::Climax));
        assert_eq!(ArcTag::parse("rising action"), Some(ArcTag::Rising));
        assert_eq!(ArcTag::parse("结局"), Some(ArcTag::Resolution));
        assert_eq!(ArcTag::parse("prologue"), None);
        assert_eq!(ArcTag::from_percent(95.0), ArcTag::Resolution);
    }
}
