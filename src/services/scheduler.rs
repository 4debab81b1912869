use futures_util::{stream, StreamExt, TryStreamExt};
use log::{debug, info};

use crate::core::error::AnalysisError;
use crate::core::state::{DescriptionTask, MasterState};
use crate::core::timeline::TimelineEvent;
use crate::services::analyzer::Analyzer;

/// A distillation the state currently needs.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsolidationJob {
    Description(DescriptionTask),
    Summary(String),
    Timeline {
        existing: Vec<TimelineEvent>,
        pending: Vec<TimelineEvent>,
    },
}

#[derive(Debug)]
enum JobResult {
    Description(DescriptionTask, String),
    Summary(String),
    Timeline(Vec<TimelineEvent>),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsolidationReport {
    pub descriptions: usize,
    pub summary: bool,
    pub timeline: bool,
}

impl ConsolidationJob {
    async fn execute(self, analyzer: &Analyzer, progress: u8) -> Result<JobResult, AnalysisError> {
        match self {
            ConsolidationJob::Description(task) => {
                let text = analyzer.consolidate_description(&task).await?;
                Ok(JobResult::Description(task, text))
            }
            ConsolidationJob::Summary(combined) => {
                Ok(JobResult::Summary(analyzer.consolidate_summary(&combined).await?))
            }
            ConsolidationJob::Timeline { existing, pending } => Ok(JobResult::Timeline(
                analyzer
                    .consolidate_timeline(&existing, &pending, progress)
                    .await?,
            )),
        }
    }
}

/// Decides which distillations are due after a merge and runs them on a
/// bounded pool. Results are applied to the state only after every job has
/// finished, so the state is never touched from a worker.
pub struct ConsolidationScheduler {
    analyzer: Analyzer,
    concurrency: usize,
}

impl ConsolidationScheduler {
    pub fn new(analyzer: Analyzer, concurrency: usize) -> Self {
        Self {
            analyzer,
            concurrency: concurrency.max(1),
        }
    }

    /// Jobs for the current state. `timeline_due` comes from the last merge;
    /// `force_timeline` flushes any pending events regardless.
    pub fn plan(state: &MasterState, timeline_due: bool, force_timeline: bool) -> Vec<ConsolidationJob> {
        let mut jobs: Vec<ConsolidationJob> = state
            .description_tasks()
            .into_iter()
            .map(ConsolidationJob::Description)
            .collect();

        if state.summary_needs_consolidation() {
            jobs.push(ConsolidationJob::Summary(state.combined_summary()));
        }

        let pending = state.pending_events();
        if (timeline_due || force_timeline) && !pending.is_empty() && !state.timeline().is_empty() {
            jobs.push(ConsolidationJob::Timeline {
                existing: state.timeline().to_vec(),
                pending: pending.to_vec(),
            });
        }
        jobs
    }

    pub async fn run(
        &self,
        state: &mut MasterState,
        timeline_due: bool,
        force_timeline: bool,
        progress: u8,
    ) -> Result<ConsolidationReport, AnalysisError> {
        // Nothing to merge into yet: the first batch is admitted locally.
        if (timeline_due || force_timeline)
            && state.timeline().is_empty()
            && !state.pending_events().is_empty()
        {
            debug!("Seeding timeline with {} events", state.pending_events().len());
            state.admit_pending();
        }

        let jobs = Self::plan(state, timeline_due, force_timeline);
        let mut report = ConsolidationReport::default();
        if jobs.is_empty() {
            return Ok(report);
        }
        debug!("Running {} consolidation jobs", jobs.len());

        let analyzer = &self.analyzer;
        let results: Vec<JobResult> = stream::iter(jobs)
            .map(|job| job.execute(analyzer, progress))
            .buffer_unordered(self.concurrency)
            .try_collect()
            .await?;

        for result in results {
            match result {
                JobResult::Description(task, text) => {
                    if state.apply_description(task.kind, &task.key, &text) {
                        report.descriptions += 1;
                    }
                }
                JobResult::Summary(text) => {
                    report.summary = state.apply_summary(&text);
                }
                JobResult::Timeline(events) => {
                    state.apply_timeline(events);
                    report.timeline = true;
                }
            }
        }

        if report != ConsolidationReport::default() {
            info!(
                "Consolidated {} descriptions{}{}",
                report.descriptions,
                if report.summary { ", summary" } else { "" },
                if report.timeline { ", timeline" } else { "" }
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::analysis::{ChunkAnalysis, EntityMention, EventMention};
    use crate::core::error::LlmError;
    use crate::core::io::NativeStorage;
    use crate::core::normalize::NameNormalizer;
    use crate::core::state::{EntityKind, StateSettings, TimelineMode};
    use crate::services::analyzer::RetryPolicy;
    use crate::services::cache::ResponseCache;
    use crate::services::llm::{ChatOptions, LlmClient};
    use crate::services::prompts::Prompts;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Debug)]
    struct MockLlmClient {
        call_count: Arc<Mutex<usize>>,
        fail: bool,
    }

    impl MockLlmClient {
        fn new() -> Self {
            Self {
                call_count: Arc::new(Mutex::new(0)),
                fail: false,
            }
        }
    }

    #[async_trait]
    impl LlmClient for MockLlmClient {
        async fn chat(&self, _system: &str, user: &str, _options: ChatOptions) -> Result<String, LlmError> {
            *self.call_count.lock().unwrap() += 1;
            if self.fail {
                return Err(LlmError::Refused("SAFETY".to_string()));
            }
            if user.contains("多段描述") {
                Ok(r#"{"description": "整合描述"}"#.to_string())
            } else if user.contains("剧情概要") {
                Ok(r#"{"summary": "整合摘要"}"#.to_string())
            } else if user.contains("已有时间线") {
                Ok(r#"{"events": [{"event": "合并事件", "arc": "rising", "importance": 4, "book_position_pct": 30}]}"#.to_string())
            } else {
                Ok("{}".to_string())
            }
        }
    }

    fn scheduler(llm: MockLlmClient) -> ConsolidationScheduler {
        let analyzer = Analyzer::new(
            Arc::new(llm),
            Arc::new(Prompts::default()),
            ResponseCache::disabled(Arc::new(NativeStorage::new())),
            RetryPolicy {
                retry_count: 0,
                base_delay: Duration::ZERO,
                parse_retries: 0,
            },
            ChatOptions::default(),
        );
        ConsolidationScheduler::new(analyzer, 2)
    }

    fn mention(name: &str, description: &str) -> EntityMention {
        EntityMention {
            name: name.to_string(),
            description: description.to_string(),
        }
    }

    fn crowded_state() -> MasterState {
        let mut state = MasterState::new("珍珠", "", StateSettings::default(), NameNormalizer::default());
        state.merge_chunk(
            ChunkAnalysis {
                summary: "第一段".into(),
                characters: vec![mention("基诺", &"甲".repeat(250)), mention("胡安娜", "妻子")],
                locations: vec![mention("海湾", &"乙".repeat(600))],
                ..Default::default()
            },
            (0.0, 50.0),
        );
        state.merge_chunk(
            ChunkAnalysis {
                summary: "第二段".into(),
                characters: vec![mention("基诺", &"丙".repeat(200))],
                ..Default::default()
            },
            (50.0, 100.0),
        );
        state
    }

    #[test]
    fn test_plan_lists_due_jobs_only() {
        let jobs = ConsolidationScheduler::plan(&crowded_state(), false, false);
        let descriptions: Vec<_> = jobs
            .iter()
            .filter_map(|j| match j {
                ConsolidationJob::Description(t) => Some((t.kind, t.key.as_str())),
                _ => None,
            })
            .collect();
        assert_eq!(
            descriptions,
            vec![(EntityKind::Character, "基诺"), (EntityKind::Location, "海湾")]
        );
        assert!(jobs.contains(&ConsolidationJob::Summary("第一段 第二段".into())));
    }

    #[tokio::test]
    async fn test_run_applies_every_result() -> Result<()> {
        let llm = MockLlmClient::new();
        let calls = llm.call_count.clone();
        let mut state = crowded_state();

        let report = scheduler(llm).run(&mut state, false, false, 100).await?;
        assert_eq!(report.descriptions, 2);
        assert!(report.summary);
        assert_eq!(*calls.lock().unwrap(), 3);

        assert_eq!(state.character("基诺").unwrap().description(), "整合描述");
        assert_eq!(state.character("胡安娜").unwrap().description(), "妻子");
        assert_eq!(state.summary_parts(), ["整合摘要".to_string()]);
        assert!(ConsolidationScheduler::plan(&state, false, false).is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_failure_leaves_state_untouched() {
        let mut llm = MockLlmClient::new();
        llm.fail = true;
        let mut state = crowded_state();
        let before = state.clone();

        let err = scheduler(llm).run(&mut state, false, false, 100).await.unwrap_err();
        assert!(matches!(err, AnalysisError::Content { .. }));
        assert_eq!(state, before);
    }

    #[tokio::test]
    async fn test_curated_timeline_seeds_then_consolidates() -> Result<()> {
        let settings = StateSettings {
            timeline_mode: TimelineMode::Curated,
            pending_threshold: 1,
            ..Default::default()
        };
        let mut state = MasterState::new("珍珠", "", settings, NameNormalizer::default());
        let events = |text: &str| ChunkAnalysis {
            events: vec![EventMention::Text(text.to_string())],
            ..Default::default()
        };

        let llm = MockLlmClient::new();
        let calls = llm.call_count.clone();
        let scheduler = scheduler(llm);

        let outcome = state.merge_chunk(events("开端"), (0.0, 10.0));
        scheduler.run(&mut state, outcome.timeline_due, false, 10).await?;
        assert_eq!(*calls.lock().unwrap(), 0);
        assert_eq!(state.timeline().len(), 1);
        assert!(state.pending_events().is_empty());

        let outcome = state.merge_chunk(events("发展"), (20.0, 30.0));
        let report = scheduler.run(&mut state, outcome.timeline_due, false, 30).await?;
        assert!(report.timeline);
        assert_eq!(*calls.lock().unwrap(), 1);
        assert_eq!(state.timeline()[0].event, "合并事件");
        assert!(state.pending_events().is_empty());
        Ok(())
    }
}
