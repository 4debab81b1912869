use log::{debug, warn};
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::core::analysis::{
    decode, parse_object, ChunkAnalysis, DescriptionResponse, SummaryResponse, TimelineResponse,
};
use crate::core::chunker::Chunk;
use crate::core::error::{AnalysisError, LlmError, Severity};
use crate::core::state::DescriptionTask;
use crate::core::timeline::{ArcTag, TimelineEvent};
use crate::services::cache::ResponseCache;
use crate::services::llm::{ChatOptions, LlmClient, LlmConfig};
use crate::services::prompts::Prompts;
use crate::utils::text::sanitize_text;

/// Consolidation answers should stay close to their inputs.
const CONSOLIDATION_TEMPERATURE: f32 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub retry_count: usize,
    pub base_delay: Duration,
    pub parse_retries: usize,
}

impl RetryPolicy {
    pub fn from_config(config: &LlmConfig, parse_retries: usize) -> Self {
        Self {
            retry_count: config.retry_count,
            base_delay: Duration::from_secs(config.retry_delay_seconds),
            parse_retries,
        }
    }

    /// `base · 2^attempt` plus up to half of that again as jitter.
    pub fn backoff(&self, attempt: usize) -> Duration {
        let exp = self.base_delay.saturating_mul(1u32 << attempt.min(16));
        let max_jitter = exp.as_millis() as u64 / 2;
        let jitter = if max_jitter == 0 {
            0
        } else {
            rand::rng().random_range(0..=max_jitter)
        };
        exp + Duration::from_millis(jitter)
    }
}

#[derive(Clone)]
pub struct Analyzer {
    llm: Arc<dyn LlmClient>,
    prompts: Arc<Prompts>,
    cache: ResponseCache,
    policy: RetryPolicy,
    options: ChatOptions,
    namespace: String,
    title: String,
    author: String,
}

impl Analyzer {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        prompts: Arc<Prompts>,
        cache: ResponseCache,
        policy: RetryPolicy,
        options: ChatOptions,
    ) -> Self {
        let namespace = llm.model_id();
        Self {
            llm,
            prompts,
            cache,
            policy,
            options,
            namespace,
            title: String::new(),
            author: String::new(),
        }
    }

    pub fn for_book(&self, title: &str, author: &str) -> Self {
        Self {
            title: title.to_string(),
            author: author.to_string(),
            ..self.clone()
        }
    }

    pub async fn analyze_chunk(&self, chunk: &Chunk, progress: u8) -> Result<ChunkAnalysis, AnalysisError> {
        if chunk.is_blank() {
            return Ok(ChunkAnalysis::default());
        }
        let task = format!("chunk {} ({})", chunk.index + 1, chunk.title());
        let prompt = self
            .prompts
            .chunk_summary(&self.title, &self.author, progress, &chunk.render());
        let analysis: ChunkAnalysis = self.request(&task, prompt, self.options.temperature).await?;
        Ok(analysis.cleaned())
    }

    pub async fn consolidate_description(&self, job: &DescriptionTask) -> Result<String, AnalysisError> {
        let task = format!("{} {}", job.kind.label(), job.name);
        let prompt = self
            .prompts
            .consolidate_description(job.kind.label(), &job.name, &job.combined);
        let response: DescriptionResponse =
            self.request(&task, prompt, CONSOLIDATION_TEMPERATURE).await?;
        let description = sanitize_text(&response.description);
        Ok(if description.is_empty() {
            job.combined.clone()
        } else {
            description
        })
    }

    pub async fn consolidate_summary(&self, combined: &str) -> Result<String, AnalysisError> {
        let prompt = self.prompts.consolidate_summary(&self.title, combined);
        let response: SummaryResponse = self
            .request("summary", prompt, CONSOLIDATION_TEMPERATURE)
            .await?;
        let summary = sanitize_text(&response.summary);
        Ok(if summary.is_empty() {
            combined.to_string()
        } else {
            summary
        })
    }

    /// Merges pending events into the curated timeline. Quotas are enforced
    /// by the caller; an empty answer keeps both lists unchanged.
    pub async fn consolidate_timeline(
        &self,
        existing: &[TimelineEvent],
        pending: &[TimelineEvent],
        progress: u8,
    ) -> Result<Vec<TimelineEvent>, AnalysisError> {
        let prompt = self.prompts.event_consolidation(
            &self.title,
            progress,
            &events_json(existing),
            &events_json(pending),
        );
        let response: TimelineResponse = self
            .request("timeline", prompt, CONSOLIDATION_TEMPERATURE)
            .await?;

        let known: Vec<&TimelineEvent> = existing.iter().chain(pending.iter()).collect();
        let events: Vec<TimelineEvent> = response
            .events
            .into_iter()
            .map(|item| item.entry())
            .filter(|entry| !entry.event.trim().is_empty())
            .map(|entry| {
                let text = entry.event.trim().to_string();
                let previous = known.iter().find(|e| e.event == text);
                let percent = entry
                    .book_position_pct
                    .filter(|p| p.is_finite())
                    .map(|p| p.clamp(0.0, 100.0))
                    .or(previous.map(|e| e.percent))
                    .unwrap_or(f64::from(progress));
                let arc = entry
                    .arc
                    .as_deref()
                    .and_then(ArcTag::parse)
                    .or(previous.map(|e| e.arc))
                    .unwrap_or_else(|| ArcTag::from_percent(percent));
                let importance = entry
                    .importance
                    .map(|i| i.round().clamp(1.0, 5.0) as u8)
                    .or(previous.map(|e| e.importance))
                    .unwrap_or(3);
                TimelineEvent {
                    event: text,
                    arc,
                    percent,
                    importance,
                }
            })
            .collect();

        if events.is_empty() {
            warn!("Timeline consolidation returned no events, keeping existing ones");
            return Ok(known.into_iter().cloned().collect());
        }
        debug!(
            "Timeline consolidated: {} + {} -> {}",
            existing.len(),
            pending.len(),
            events.len()
        );
        Ok(events)
    }

    async fn request<T: DeserializeOwned>(
        &self,
        task: &str,
        user: String,
        temperature: f32,
    ) -> Result<T, AnalysisError> {
        let key = ResponseCache::key(&self.namespace, &self.prompts.system_instruction, &user);
        if let Some(value) = self.cache.get(&key).await {
            match decode::<T>(value) {
                Ok(typed) => return Ok(typed),
                Err(e) => warn!("{}: cached answer unusable ({}), asking again", task, e),
            }
        }

        let options = ChatOptions {
            temperature,
            ..self.options
        };
        let mut attempts = 0;
        loop {
            attempts += 1;
            let raw = self.call(task, &user, options).await?;
            let parsed = parse_object(&raw)
                .and_then(|value| decode::<T>(value.clone()).map(|typed| (value, typed)));
            match parsed {
                Ok((value, typed)) => {
                    self.cache.put(&key, &value).await;
                    return Ok(typed);
                }
                Err(message) if attempts > self.policy.parse_retries => {
                    return Err(AnalysisError::Malformed {
                        task: task.to_string(),
                        attempts,
                        message,
                    });
                }
                Err(message) => {
                    warn!("{}: malformed answer ({}), asking again", task, message);
                }
            }
        }
    }

    async fn call(&self, task: &str, user: &str, options: ChatOptions) -> Result<String, AnalysisError> {
        let mut attempt = 0;
        loop {
            match self
                .llm
                .chat(&self.prompts.system_instruction, user, options)
                .await
            {
                Ok(text) => return Ok(text),
                Err(e) => match classify(e, attempt, self.policy.retry_count) {
                    Next::Retry(e) => {
                        let delay = self.policy.backoff(attempt);
                        warn!(
                            "{}: {} (retry {}/{} in {:.1}s)",
                            task,
                            e,
                            attempt + 1,
                            self.policy.retry_count,
                            delay.as_secs_f32()
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    Next::GiveUp(e) => {
                        return Err(AnalysisError::Exhausted {
                            task: task.to_string(),
                            attempts: attempt + 1,
                            source: e,
                        })
                    }
                    Next::Fail(e) => {
                        return Err(AnalysisError::Content {
                            task: task.to_string(),
                            source: e,
                        })
                    }
                },
            }
        }
    }
}

enum Next {
    Retry(LlmError),
    GiveUp(LlmError),
    Fail(LlmError),
}

fn classify(e: LlmError, attempt: usize, retry_count: usize) -> Next {
    match e.severity() {
        Severity::Retryable if attempt < retry_count => Next::Retry(e),
        Severity::Retryable => Next::GiveUp(e),
        Severity::Fatal => Next::Fail(e),
    }
}

#[derive(Serialize)]
struct EventRecord<'a> {
    event: &'a str,
    arc: &'static str,
    importance: u8,
    book_position_pct: f64,
}

fn events_json(events: &[TimelineEvent]) -> String {
    let records: Vec<EventRecord> = events
        .iter()
        .map(|e| EventRecord {
            event: &e.event,
            arc: e.arc.as_str(),
            importance: e.importance,
            book_position_pct: (e.percent * 10.0).round() / 10.0,
        })
        .collect();
    serde_json::to_string(&records).unwrap_or_else(|_| "[]".to_string())
}
