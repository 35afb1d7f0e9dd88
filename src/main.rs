//! llmhost - local LLM and image engine host
//!
#![doc = "llmhost - local LLM and image engine host"]
#![doc = "Main entry point for the llmhost application."]

use anyhow::Result;

use llmhost::cli::{Cli, Commands};
use llmhost::commands;
use llmhost::config::Config;
use llmhost::llm::SamplingParams;
use llmhost::logging::init_logging;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let cli = Cli::parse_args();

    // Load configuration
    let config_path = cli.config.as_deref().unwrap_or("config/config.yaml");
    let config = Config::load(config_path, &cli)?;

    init_logging(&config.logging, cli.verbose)?;

    // Validate configuration
    config.validate()?;

    // Execute command
    match cli.command {
        Commands::Chat { user, channel } => {
            tracing::info!("Starting console chat");
            commands::chat::run_chat(config, user, channel).await
        }
        Commands::Prompt {
            message,
            system,
            seed,
            temperature,
        } => {
            let params = SamplingParams {
                seed,
                temperature,
                max_tokens: None,
            };
            commands::prompt::run_prompt(config, message, system, params).await
        }
        Commands::Models { json } => commands::models::list_models(&config, json),
        Commands::Health { remote } => commands::health::run_health(&remote).await,
    }
}
