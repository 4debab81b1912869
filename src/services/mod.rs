pub mod analyzer;
pub mod cache;
pub mod checkpoint;
pub mod epub;
pub mod llm;
pub mod prompts;
pub mod scheduler;
pub mod workflow;
