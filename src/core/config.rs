use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::core::chunker::ChunkerConfig;
use crate::core::normalize::RelationalNames;
use crate::core::state::{StateSettings, TimelineMode};
use crate::core::timeline::SlotQuotas;
use crate::services::llm::{LlmConfig, OpenAIConfig};

pub const ENV_API_BASE: &str = "XRAY_API_BASE";
pub const ENV_API_KEY: &str = "XRAY_API_KEY";
pub const ENV_MODEL: &str = "XRAY_MODEL";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_input")]
    pub input_folder: String,

    #[serde(default = "default_output")]
    pub output_folder: String,

    #[serde(default = "default_build")]
    pub build_folder: String,

    pub llm: LlmConfig,

    #[serde(default)]
    pub analysis: AnalysisConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AnalysisConfig {
    #[serde(default = "default_max_chunk_chars")]
    pub max_chunk_chars: usize,
    #[serde(default = "default_split_lookback_chars")]
    pub split_lookback_chars: usize,
    #[serde(default = "default_chunk_concurrency")]
    pub chunk_concurrency: usize,
    #[serde(default = "default_consolidation_concurrency")]
    pub consolidation_concurrency: usize,
    /// Extra attempts when the service answers with malformed JSON.
    #[serde(default = "default_parse_retries")]
    pub parse_retries: usize,
    #[serde(default = "default_summary_ceiling")]
    pub summary_ceiling: usize,
    #[serde(default)]
    pub relational_names: RelationalNames,
    #[serde(default)]
    pub timeline_mode: TimelineMode,
    #[serde(default = "default_pending_threshold")]
    pub pending_threshold: usize,
    #[serde(default)]
    pub quotas: SlotQuotas,
    #[serde(default = "default_cache")]
    pub cache: bool,
    /// JSON file overriding the built-in prompt set.
    #[serde(default)]
    pub prompts_file: Option<String>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            max_chunk_chars: default_max_chunk_chars(),
            split_lookback_chars: default_split_lookback_chars(),
            chunk_concurrency: default_chunk_concurrency(),
            consolidation_concurrency: default_consolidation_concurrency(),
            parse_retries: default_parse_retries(),
            summary_ceiling: default_summary_ceiling(),
            relational_names: RelationalNames::default(),
            timeline_mode: TimelineMode::default(),
            pending_threshold: default_pending_threshold(),
            quotas: SlotQuotas::default(),
            cache: default_cache(),
            prompts_file: None,
        }
    }
}

impl AnalysisConfig {
    pub fn chunker(&self) -> ChunkerConfig {
        ChunkerConfig {
            max_chars: self.max_chunk_chars.max(1),
            lookback_chars: self.split_lookback_chars,
        }
    }

    pub fn state_settings(&self) -> StateSettings {
        StateSettings {
            timeline_mode: self.timeline_mode,
            pending_threshold: self.pending_threshold.max(1),
            quotas: self.quotas.clone(),
            summary_ceiling: self.summary_ceiling,
        }
    }
}

fn default_input() -> String {
    "input".to_string()
}
fn default_output() -> String {
    "output".to_string()
}
fn default_build() -> String {
    "build".to_string()
}
fn default_max_chunk_chars() -> usize {
    15000
}
fn default_split_lookback_chars() -> usize {
    500
}
fn default_chunk_concurrency() -> usize {
    4
}
fn default_consolidation_concurrency() -> usize {
    4
}
fn default_parse_retries() -> usize {
    2
}
fn default_summary_ceiling() -> usize {
    1500
}
fn default_pending_threshold() -> usize {
    8
}
fn default_cache() -> bool {
    true
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from("config.yml")
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            anyhow::bail!("{} not found. Please create one.", path.display());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let mut config: Config = serde_yaml_ng::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Environment overrides for the OpenAI-compatible endpoint. Setting any
    /// of them selects the `openai` provider.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let base = lookup(ENV_API_BASE).filter(|v| !v.is_empty());
        let key = lookup(ENV_API_KEY).filter(|v| !v.is_empty());
        let model = lookup(ENV_MODEL).filter(|v| !v.is_empty());
        if base.is_none() && key.is_none() && model.is_none() {
            return;
        }

        let openai = self.llm.openai.get_or_insert_with(|| OpenAIConfig {
            api_key: String::new(),
            model: String::new(),
            base_url: None,
        });
        if let Some(base) = base {
            openai.base_url = Some(base);
        }
        if let Some(key) = key {
            openai.api_key = key;
        }
        if let Some(model) = model {
            openai.model = model;
        }
        self.llm.provider = "openai".to_string();
    }

    pub fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.input_folder)?;
        fs::create_dir_all(&self.output_folder)?;
        fs::create_dir_all(&self.build_folder)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const MINIMAL: &str = r#"
llm:
  provider: gemini
  gemini:
    api_key: "k"
    model: "gemini-2.5-flash"
"#;

    #[test]
    fn test_defaults_fill_missing_sections() {
        let config: Config = serde_yaml_ng::from_str(MINIMAL).unwrap();
        assert_eq!(config.input_folder, "input");
        assert_eq!(config.analysis.max_chunk_chars, 15000);
        assert_eq!(config.analysis.split_lookback_chars, 500);
        assert_eq!(config.analysis.parse_retries, 2);
        assert_eq!(config.analysis.quotas.max_events, 20);
        assert_eq!(config.analysis.timeline_mode, TimelineMode::Positional);
        assert_eq!(config.llm.retry_count, 3);
        assert!(config.analysis.cache);
    }

    #[test]
    fn test_analysis_section_overrides() {
        let yaml = format!(
            "{MINIMAL}\nanalysis:\n  timeline_mode: curated\n  relational_names: keep\n  quotas:\n    climax: 2\n"
        );
        let config: Config = serde_yaml_ng::from_str(&yaml).unwrap();
        assert_eq!(config.analysis.timeline_mode, TimelineMode::Curated);
        assert_eq!(config.analysis.relational_names, RelationalNames::Keep);
        assert_eq!(config.analysis.quotas.climax, 2);
        assert_eq!(config.analysis.quotas.rising, 6);
    }

    #[test]
    fn test_env_overrides_select_openai() {
        let mut config: Config = serde_yaml_ng::from_str(MINIMAL).unwrap();
        let env: HashMap<&str, &str> = [
            (ENV_API_BASE, "http://localhost:8080/v1"),
            (ENV_MODEL, "qwen"),
        ]
        .into_iter()
        .collect();
        config.apply_env(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.llm.provider, "openai");
        let openai = config.llm.openai.unwrap();
        assert_eq!(openai.base_url.as_deref(), Some("http://localhost:8080/v1"));
        assert_eq!(openai.model, "qwen");
        assert_eq!(openai.api_key, "");
    }

    #[test]
    fn test_no_env_keeps_provider() {
        let mut config: Config = serde_yaml_ng::from_str(MINIMAL).unwrap();
        config.apply_env(|_| None);
        assert_eq!(config.llm.provider, "gemini");
        assert!(config.llm.openai.is_none());
    }

    #[test]
    fn test_load_from_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("config.yml");
        fs::write(&path, MINIMAL)?;
        let config = Config::load_from(&path)?;
        assert_eq!(config.build_folder, "build");
        assert!(Config::load_from(dir.path().join("missing.yml")).is_err());
        Ok(())
    }
}
