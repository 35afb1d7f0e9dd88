//! llmhost - local LLM and image engine host library
//!
//! This library starts and supervises local inference engines, talks to
//! them over streaming HTTP, serializes requests through bounded queues and
//! remembers recent conversations.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//!
//! - `process`: child process supervision with graceful termination
//! - `llm`: protocol clients, model acquisition and the inference session
//! - `imagegen`: the image generation engine session
//! - `scheduler`: bounded single-worker request queues
//! - `memory`: per user and channel conversations with idle eviction
//! - `bot`: chat and image request handling on top of the above
//! - `models`: concurrent engine bring-up
//! - `config`: Configuration management and validation
//! - `error`: Error types and result aliases
//! - `cli`: Command-line interface definition
//!
//! # Example
//!
//! ```no_run
//! use llmhost::{Config, Memory};
//! use llmhost::models::load_models;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.yaml", &Default::default())?;
//!     config.validate()?;
//!
//!     let cache_dir = config.cache_dir()?;
//!     let models = load_models(&config, &cache_dir, CancellationToken::new()).await?;
//!     let memory = Memory::new();
//!     memory.load_file(&config.memory_path(&cache_dir))?;
//!     // Bot usage would go here
//!     models.close().await
//! }
//! ```

pub mod bot;
pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod imagegen;
pub mod llm;
pub mod logging;
pub mod memory;
pub mod models;
pub mod process;
pub mod scheduler;

// Re-export commonly used types
pub use bot::{Bot, ChatEvent, ChatRequest, ImageReply, ImageRequest, Submission};
pub use config::Config;
pub use error::{LlmHostError, Result};
pub use imagegen::{ImageOptions, ImageSession};
pub use llm::{Message, Role, Session, SessionOptions, SessionState};
pub use memory::Memory;
pub use process::ProcessHandle;
