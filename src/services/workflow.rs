use anyhow::{Context, Result};
use futures_util::{stream, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, error, info, warn};
use std::fmt;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::Poll;
use tokio::task::{JoinError, JoinHandle};

use crate::core::analysis::ChunkAnalysis;
use crate::core::chunker::{chunk_sections, Chunk, ChunkPlan};
use crate::core::config::Config;
use crate::core::error::AnalysisError;
use crate::core::io::Storage;
use crate::core::normalize::NameNormalizer;
use crate::core::state::MasterState;
use crate::services::analyzer::{Analyzer, RetryPolicy};
use crate::services::cache::ResponseCache;
use crate::services::checkpoint::CheckpointManager;
use crate::services::epub::{Book, BookSource, EpubSource};
use crate::services::llm::{ChatOptions, LlmClient};
use crate::services::prompts::Prompts;
use crate::services::scheduler::ConsolidationScheduler;

/// Where a run currently is. Chunk-level phases carry the chunk index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Idle,
    Reading,
    Chunking,
    Dispatched(usize),
    Merged(usize),
    Consolidated(usize),
    Checkpointed(usize),
    Finalizing,
    Done,
    Aborted,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunPhase::Dispatched(i) => write!(f, "dispatched #{}", i + 1),
            RunPhase::Merged(i) => write!(f, "merged #{}", i + 1),
            RunPhase::Consolidated(i) => write!(f, "consolidated #{}", i + 1),
            RunPhase::Checkpointed(i) => write!(f, "checkpointed #{}", i + 1),
            other => write!(f, "{:?}", other),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub output_dir: String,
    pub total_chunks: usize,
    pub processed_chunks: usize,
    pub resumed_from: Option<u8>,
}

/// A spawned chunk analysis that is cancelled when dropped, so leaving the
/// merge loop early never leaves orphaned requests running.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Future for AbortOnDrop<T> {
    type Output = Result<T, JoinError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(cx)
    }
}

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pub struct WorkflowManager {
    config: Config,
    llm: Arc<dyn LlmClient>,
    prompts: Arc<Prompts>,
    storage: Arc<dyn Storage>,
    phase: RunPhase,
}

impl WorkflowManager {
    pub fn new(config: Config, llm: Box<dyn LlmClient>, storage: Arc<dyn Storage>) -> Result<Self> {
        let prompts = Prompts::load(config.analysis.prompts_file.as_deref())?;
        Ok(Self {
            config,
            llm: Arc::from(llm),
            prompts: Arc::new(prompts),
            storage,
            phase: RunPhase::Idle,
        })
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    fn enter(&mut self, phase: RunPhase) {
        debug!("Run phase: {} -> {}", self.phase, phase);
        self.phase = phase;
    }

    /// Processes every `.epub` in the input folder, stopping at the first
    /// book that fails.
    pub async fn run(&mut self) -> Result<()> {
        let entries = self.storage.list(&self.config.input_folder).await?;
        let books: Vec<String> = entries
            .into_iter()
            .filter(|e| e.to_lowercase().ends_with(".epub"))
            .collect();

        if books.is_empty() {
            println!("No .epub files found in {}", self.config.input_folder);
            return Ok(());
        }

        for path in &books {
            println!("Processing book: {}", path);
            let summary = self.process_source(&EpubSource::new(path)).await?;
            println!(
                "Book complete: {} ({} of {} chunks analyzed this run)",
                summary.output_dir, summary.processed_chunks, summary.total_chunks
            );
        }

        println!("All books processed!");
        Ok(())
    }

    pub async fn process_source(&mut self, source: &dyn BookSource) -> Result<RunSummary> {
        self.enter(RunPhase::Reading);
        let book = match source.load() {
            Ok(book) => book,
            Err(e) => {
                self.enter(RunPhase::Aborted);
                return Err(e);
            }
        };
        let result = self.process_book(&book).await;
        if result.is_err() {
            self.enter(RunPhase::Aborted);
        }
        result
    }

    fn output_dir(&self, book: &Book) -> String {
        Path::new(&self.config.output_folder)
            .join(book.sdr_name())
            .join("xray_analysis")
            .to_string_lossy()
            .to_string()
    }

    fn analyzer(&self) -> Analyzer {
        let cache = ResponseCache::new(
            Path::new(&self.config.build_folder)
                .join("cache")
                .to_string_lossy()
                .to_string(),
            self.storage.clone(),
            self.config.analysis.cache,
        );
        Analyzer::new(
            self.llm.clone(),
            self.prompts.clone(),
            cache,
            RetryPolicy::from_config(&self.config.llm, self.config.analysis.parse_retries),
            ChatOptions::from_config(&self.config.llm),
        )
    }

    async fn process_book(&mut self, book: &Book) -> Result<RunSummary> {
        self.enter(RunPhase::Chunking);
        let plan = chunk_sections(&book.sections, &self.config.analysis.chunker());
        info!(
            "\"{}\" by {}: {} sections, {} characters, {} chunks",
            book.title,
            book.author,
            book.sections.len(),
            plan.total_len,
            plan.len()
        );

        let output_dir = self.output_dir(book);
        let checkpoints = CheckpointManager::new(output_dir.clone(), self.storage.clone());
        let settings = self.config.analysis.state_settings();
        let normalizer = NameNormalizer::new(self.config.analysis.relational_names);

        let (mut state, resumed_from) = match checkpoints.latest().await? {
            Some((percent, doc)) => {
                println!("Resuming from {}%", percent);
                (MasterState::restore(&doc, settings, normalizer), Some(percent))
            }
            None => (
                MasterState::new(&book.title, &book.author, settings, normalizer),
                None,
            ),
        };

        let start = resumed_from.map_or(0, |p| plan.first_after(p));
        let mut summary = RunSummary {
            output_dir,
            total_chunks: plan.len(),
            processed_chunks: 0,
            resumed_from,
        };

        if start >= plan.len() && resumed_from.is_some() {
            println!("Analysis already complete, nothing to do.");
            self.enter(RunPhase::Done);
            return Ok(summary);
        }

        let analyzer = self.analyzer().for_book(&book.title, &book.author);
        let scheduler = ConsolidationScheduler::new(
            analyzer.clone(),
            self.config.analysis.consolidation_concurrency,
        );

        summary.processed_chunks = self
            .analyze_chunks(&plan, start, &analyzer, &scheduler, &mut state, &checkpoints)
            .await?;

        self.enter(RunPhase::Finalizing);
        // Whatever is still buffered goes into the final timeline.
        scheduler.run(&mut state, false, true, 100).await?;
        let path = checkpoints.finalize(&state.to_document(100)).await?;
        info!("Wrote {}", path);

        self.enter(RunPhase::Done);
        Ok(summary)
    }

    /// Dispatches chunks `start..` concurrently and merges the results
    /// strictly in chunk order. Returns how many chunks were merged.
    async fn analyze_chunks(
        &mut self,
        plan: &ChunkPlan,
        start: usize,
        analyzer: &Analyzer,
        scheduler: &ConsolidationScheduler,
        state: &mut MasterState,
        checkpoints: &CheckpointManager,
    ) -> Result<usize> {
        let remaining = &plan.chunks[start..];
        let pb = ProgressBar::new(plan.len() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
                .progress_chars("#>-"),
        );
        pb.set_position(start as u64);

        let mut results = stream::iter(remaining.iter().cloned())
            .map(|chunk| {
                let analyzer = analyzer.clone();
                let progress = plan.percent(&chunk);
                AbortOnDrop(tokio::spawn(async move {
                    let analysis = analyzer.analyze_chunk(&chunk, progress).await;
                    (chunk, analysis)
                }))
            })
            .buffered(self.config.analysis.chunk_concurrency.max(1));

        let mut merged = 0;
        for expected in remaining.iter().map(|c| c.index) {
            self.enter(RunPhase::Dispatched(expected));
            let joined = results
                .next()
                .await
                .context("Chunk stream ended early")?;
            let (chunk, analysis) = joined.map_err(|e| AnalysisError::Worker {
                task: format!("chunk {}", expected + 1),
                message: e.to_string(),
            })?;
            let analysis = match analysis {
                Ok(analysis) => analysis,
                Err(e) => {
                    error!("Aborting at chunk {} ({}): {}", chunk.index + 1, chunk.title(), e);
                    pb.abandon_with_message("aborted");
                    return Err(e.into());
                }
            };

            self.merge_and_save(plan, &chunk, analysis, scheduler, state, checkpoints)
                .await?;
            merged += 1;
            pb.inc(1);
            pb.set_message(format!("{}%", plan.percent(&chunk)));
        }

        pb.finish_with_message("analysis complete");
        Ok(merged)
    }

    async fn merge_and_save(
        &mut self,
        plan: &ChunkPlan,
        chunk: &Chunk,
        analysis: ChunkAnalysis,
        scheduler: &ConsolidationScheduler,
        state: &mut MasterState,
        checkpoints: &CheckpointManager,
    ) -> Result<()> {
        let percent = plan.percent(chunk);
        let outcome = state.merge_chunk(analysis, plan.window(chunk));
        self.enter(RunPhase::Merged(chunk.index));

        scheduler
            .run(state, outcome.timeline_due, false, percent)
            .await?;
        self.enter(RunPhase::Consolidated(chunk.index));

        checkpoints.save(&state.to_document(percent)).await?;
        self.enter(RunPhase::Checkpointed(chunk.index));

        let stats = state.stats();
        info!(
            "Chunk {}/{} [{}] -> {}%: +{} characters, +{} locations | {} characters, {} locations, {} themes, {} events",
            chunk.index + 1,
            plan.len(),
            chunk.title(),
            percent,
            outcome.new_characters,
            outcome.new_locations,
            stats.characters,
            stats.locations,
            stats.themes,
            stats.events
        );
        if chunk.is_blank() {
            warn!("Chunk {} has no text", chunk.index + 1);
        }
        Ok(())
    }
}
