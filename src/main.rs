use anyhow::Result;
use std::sync::Arc;

use novel2xray::core::config::Config;
use novel2xray::core::io::NativeStorage;
use novel2xray::services::llm::create_llm;
use novel2xray::services::workflow::WorkflowManager;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    // XRAY_API_BASE / XRAY_API_KEY / XRAY_MODEL override config.yml.
    let config = match Config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config: {}", e);
            eprintln!("Please ensure 'config.yml' exists with valid LLM settings.");
            return Err(e);
        }
    };

    config.ensure_directories()?;

    let llm = create_llm(&config.llm)?;
    let storage = Arc::new(NativeStorage::new());

    let mut manager = WorkflowManager::new(config, llm, storage)?;
    manager.run().await?;

    Ok(())
}
