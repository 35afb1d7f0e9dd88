//! Configuration management for llmhost
//!
//! This module handles loading, parsing, validating, and managing
//! configuration from a YAML file, environment variables, and CLI overrides.

use crate::error::{LlmHostError, Result};
use crate::imagegen::{ImageOptions, DEFAULT_STEPS};
use crate::llm::session::{SessionOptions, DEFAULT_LLM_PORT};
use crate::llm::KnownModel;
use crate::scheduler::{CHAT_QUEUE_CAPACITY, IMAGE_QUEUE_CAPACITY};

use directories::ProjectDirs;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

/// Main configuration structure for llmhost
///
/// Holds the engines to bring up, the known model catalog, and the
/// ambient settings for scheduling, persistence and logging.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Which engines the bot uses
    #[serde(default)]
    pub bot: BotConfig,
    /// Models the host knows how to fetch and drive
    #[serde(default)]
    pub known_llms: Vec<KnownModel>,
    /// Chat behavior
    #[serde(default)]
    pub settings: Settings,
    /// Where binaries, models and engine logs live
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    /// Conversation memory file; defaults to `<cache_dir>/memory.json`
    #[serde(default)]
    pub memory_path: Option<PathBuf>,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub process: ProcessConfig,
    #[serde(default)]
    pub huggingface: HuggingFaceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Engines used by the bot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BotConfig {
    /// LLM engine; disabled when the model is empty
    #[serde(default)]
    pub llm: LlmConfig,
    /// Image engine; disabled when neither command nor remote is set
    #[serde(default)]
    pub image_gen: ImageGenConfig,
}

/// LLM engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Model identifier with its quantization suffix
    #[serde(default)]
    pub model: String,
    /// `host:port` of an engine to use instead of starting one
    #[serde(default)]
    pub remote: Option<String>,
}

/// Image engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageGenConfig {
    /// Program and arguments starting the engine
    #[serde(default)]
    pub command: Vec<String>,
    /// `host:port` of an engine to use instead of starting one
    #[serde(default)]
    pub remote: Option<String>,
    /// Denoising steps once the engine is ready
    #[serde(default = "default_steps")]
    pub steps: u32,
}

fn default_steps() -> u32 {
    DEFAULT_STEPS
}

impl Default for ImageGenConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            remote: None,
            steps: default_steps(),
        }
    }
}

/// Chat settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// System prompt seeded into every new conversation.
    ///
    /// May reference `{{Now}}` and `{{Model}}`.
    #[serde(default = "default_prompt_system")]
    pub prompt_system: String,
}

fn default_prompt_system() -> String {
    "You are a terse assistant. You reply with short answers. You are often joyful, sometimes \
     humorous, sometimes sarcastic. The current time is {{Now}}. You are running the model \
     {{Model}}."
        .to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            prompt_system: default_prompt_system(),
        }
    }
}

/// Queue capacities
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_chat_capacity")]
    pub chat_capacity: usize,
    #[serde(default = "default_image_capacity")]
    pub image_capacity: usize,
}

fn default_chat_capacity() -> usize {
    CHAT_QUEUE_CAPACITY
}

fn default_image_capacity() -> usize {
    IMAGE_QUEUE_CAPACITY
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            chat_capacity: default_chat_capacity(),
            image_capacity: default_image_capacity(),
        }
    }
}

/// Engine process supervision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessConfig {
    /// Seconds between SIGINT and SIGKILL on shutdown
    #[serde(default = "default_grace_period")]
    pub grace_period_seconds: u64,
}

fn default_grace_period() -> u64 {
    30
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            grace_period_seconds: default_grace_period(),
        }
    }
}

/// Model download source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HuggingFaceConfig {
    #[serde(default = "default_hf_base_url")]
    pub base_url: String,
}

fn default_hf_base_url() -> String {
    "https://huggingface.co".to_string()
}

impl Default for HuggingFaceConfig {
    fn default() -> Self {
        Self {
            base_url: default_hf_base_url(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Enable JSON-formatted logs
    #[serde(default)]
    pub json_format: bool,

    /// Log file path (if None, stderr only)
    #[serde(default)]
    pub file_path: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_format: false,
            file_path: None,
        }
    }
}

/// Returns true if `s` looks like `host:port`.
///
/// Accepts IPv4 addresses, bracketed IPv6 addresses and host names; the
/// port is mandatory.
///
/// # Examples
///
/// ```
/// use llmhost::config::is_host_port;
///
/// assert!(is_host_port("localhost:8031"));
/// assert!(is_host_port("[::1]:8080"));
/// assert!(!is_host_port("localhost"));
/// ```
pub fn is_host_port(s: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        let ipv4 = r"\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}";
        let ipv6 = r"\[[a-fA-F0-9:]+\]";
        let hostname = r"[a-zA-Z0-9\-\.]{2,}";
        Regex::new(&format!(r"^(?:{}|{}|{}):\d{{1,5}}$", ipv4, ipv6, hostname))
            .expect("valid host:port regex")
    })
    .is_match(s)
}

impl Config {
    /// Load configuration from file with environment variable overrides
    ///
    /// # Arguments
    ///
    /// * `path` - Path to configuration file
    /// * `cli` - CLI arguments for overrides
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read or parsed
    pub fn load(path: &str, cli: &crate::cli::Cli) -> Result<Self> {
        let mut config = if Path::new(path).exists() {
            Self::from_file(path)?
        } else {
            tracing::warn!("Config file not found at {}, using defaults", path);
            Self::default()
        };

        config.apply_env_vars();
        config.apply_cli_overrides(cli);

        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| LlmHostError::Config(format!("Failed to read config file: {}", e)))?;
        serde_yaml::from_str(&contents)
            .map_err(|e| LlmHostError::Config(format!("Failed to parse config: {}", e)).into())
    }

    fn apply_env_vars(&mut self) {
        if let Ok(model) = std::env::var("LLMHOST_LLM_MODEL") {
            self.bot.llm.model = model;
        }

        if let Ok(remote) = std::env::var("LLMHOST_LLM_REMOTE") {
            self.bot.llm.remote = Some(remote).filter(|r| !r.is_empty());
        }

        if let Ok(remote) = std::env::var("LLMHOST_IMAGE_REMOTE") {
            self.bot.image_gen.remote = Some(remote).filter(|r| !r.is_empty());
        }

        if let Ok(dir) = std::env::var("LLMHOST_CACHE_DIR") {
            self.cache_dir = Some(PathBuf::from(dir));
        }

        if let Ok(level) = std::env::var("LLMHOST_LOG_LEVEL") {
            self.logging.level = level;
        }
    }

    fn apply_cli_overrides(&mut self, cli: &crate::cli::Cli) {
        if cli.verbose {
            self.logging.level = "debug".to_string();
        }
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `LlmHostError::Config` if any check fails
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.chat_capacity == 0 {
            return Err(LlmHostError::Config(
                "scheduler.chat_capacity must be greater than 0".to_string(),
            )
            .into());
        }

        if self.scheduler.image_capacity == 0 {
            return Err(LlmHostError::Config(
                "scheduler.image_capacity must be greater than 0".to_string(),
            )
            .into());
        }

        for known in &self.known_llms {
            known.validate()?;
        }

        for (name, remote) in [
            ("bot.llm.remote", &self.bot.llm.remote),
            ("bot.image_gen.remote", &self.bot.image_gen.remote),
        ] {
            if let Some(remote) = remote {
                if !is_host_port(remote) {
                    return Err(LlmHostError::Config(format!(
                        "{} {:?} is not of the form 'host:port'",
                        name, remote
                    ))
                    .into());
                }
            }
        }

        if !self.bot.llm.model.is_empty() {
            KnownModel::select(&self.known_llms, &self.bot.llm.model)?;
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(LlmHostError::Config(format!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            ))
            .into());
        }

        Ok(())
    }

    /// Resolved cache directory
    ///
    /// # Errors
    ///
    /// Returns `LlmHostError::Config` when no directory is configured and
    /// the platform cache location cannot be determined.
    pub fn cache_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.cache_dir {
            return Ok(dir.clone());
        }
        let proj_dirs = ProjectDirs::from("", "", "llmhost").ok_or_else(|| {
            LlmHostError::Config("Could not determine cache directory".to_string())
        })?;
        Ok(proj_dirs.cache_dir().to_path_buf())
    }

    /// Resolved memory file path
    pub fn memory_path(&self, cache_dir: &Path) -> PathBuf {
        self.memory_path
            .clone()
            .unwrap_or_else(|| cache_dir.join("memory.json"))
    }

    fn grace_period(&self) -> Duration {
        Duration::from_secs(self.process.grace_period_seconds)
    }

    /// Options for the LLM session, `None` when no model is configured.
    pub fn session_options(&self) -> Option<SessionOptions> {
        if self.bot.llm.model.is_empty() {
            return None;
        }
        Some(SessionOptions {
            model: self.bot.llm.model.clone(),
            remote: self.bot.llm.remote.clone(),
            hf_base_url: self.huggingface.base_url.clone(),
            grace_period: self.grace_period(),
            preferred_port: DEFAULT_LLM_PORT,
        })
    }

    /// Options for the image session, `None` when not configured.
    pub fn image_options(&self) -> Option<ImageOptions> {
        let image = &self.bot.image_gen;
        if image.remote.is_none() && image.command.is_empty() {
            return None;
        }
        Some(ImageOptions {
            command: image.command.clone(),
            remote: image.remote.clone(),
            steps: image.steps,
            grace_period: self.grace_period(),
        })
    }
}
