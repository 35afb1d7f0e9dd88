//! Command-line interface definition for llmhost
//!
//! This module defines the CLI structure using clap's derive API,
//! providing commands for chatting, one-shot prompts, model listing and
//! engine health checks.

use clap::{Parser, Subcommand};

/// llmhost - local LLM and image engine host
///
/// Starts and supervises inference engines, then serves chat and image
/// requests through bounded queues.
#[derive(Parser, Debug, Clone)]
#[command(name = "llmhost")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/config.yaml")]
    pub config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for llmhost
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Chat with the bot from the console
    Chat {
        /// User name the conversation is remembered under
        #[arg(short, long, default_value = "console")]
        user: String,

        /// Channel name the conversation is remembered under
        #[arg(long, default_value = "console")]
        channel: String,
    },

    /// Send one prompt and stream the reply to stdout
    Prompt {
        /// Message to send
        #[arg(short, long)]
        message: String,

        /// System prompt; defaults to the configured one
        #[arg(long)]
        system: Option<String>,

        /// Sampling seed
        #[arg(long, default_value_t = 1)]
        seed: i64,

        /// Sampling temperature
        #[arg(long, default_value_t = 1.0)]
        temperature: f64,
    },

    /// List known models and the protocol each one uses
    Models {
        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Probe a running engine
    Health {
        /// Engine address in the form host:port
        #[arg(short, long)]
        remote: String,
    },
}

impl Cli {
    /// Parse command line arguments
    ///
    /// # Returns
    ///
    /// Returns the parsed CLI structure
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

impl Default for Cli {
    fn default() -> Self {
        Self {
            config: Some("config/config.yaml".to_string()),
            verbose: false,
            command: Commands::Models { json: false },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_default() {
        let cli = Cli::default();
        assert_eq!(cli.config, Some("config/config.yaml".to_string()));
        assert!(!cli.verbose);
        assert!(matches!(cli.command, Commands::Models { json: false }));
    }

    #[test]
    fn test_cli_parse_chat_defaults() {
        let cli = Cli::try_parse_from(["llmhost", "chat"]).unwrap();
        if let Commands::Chat { user, channel } = cli.command {
            assert_eq!(user, "console");
            assert_eq!(channel, "console");
        } else {
            panic!("Expected Chat command");
        }
    }

    #[test]
    fn test_cli_parse_chat_with_user() {
        let cli = Cli::try_parse_from(["llmhost", "chat", "--user", "alice"]).unwrap();
        assert!(matches!(cli.command, Commands::Chat { ref user, .. } if user == "alice"));
    }

    #[test]
    fn test_cli_parse_prompt() {
        let cli = Cli::try_parse_from([
            "llmhost",
            "prompt",
            "--message",
            "Hello",
            "--seed",
            "42",
            "--temperature",
            "0.5",
        ])
        .unwrap();
        if let Commands::Prompt {
            message,
            system,
            seed,
            temperature,
        } = cli.command
        {
            assert_eq!(message, "Hello");
            assert_eq!(system, None);
            assert_eq!(seed, 42);
            assert_eq!(temperature, 0.5);
        } else {
            panic!("Expected Prompt command");
        }
    }

    #[test]
    fn test_cli_parse_prompt_requires_message() {
        assert!(Cli::try_parse_from(["llmhost", "prompt"]).is_err());
    }

    #[test]
    fn test_cli_parse_models_json() {
        let cli = Cli::try_parse_from(["llmhost", "models", "--json"]).unwrap();
        assert!(matches!(cli.command, Commands::Models { json: true }));
    }

    #[test]
    fn test_cli_parse_health() {
        let cli = Cli::try_parse_from(["llmhost", "health", "--remote", "localhost:8031"]).unwrap();
        assert!(matches!(cli.command, Commands::Health { ref remote } if remote == "localhost:8031"));
    }

    #[test]
    fn test_cli_parse_with_config_and_verbose() {
        let cli =
            Cli::try_parse_from(["llmhost", "--config", "custom.yaml", "-v", "models"]).unwrap();
        assert_eq!(cli.config, Some("custom.yaml".to_string()));
        assert!(cli.verbose);
    }

    #[test]
    fn test_cli_parse_missing_command() {
        assert!(Cli::try_parse_from(["llmhost"]).is_err());
    }

    #[test]
    fn test_cli_parse_invalid_command() {
        assert!(Cli::try_parse_from(["llmhost", "invalid"]).is_err());
    }
}
