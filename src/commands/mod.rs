//! Command handlers for llmhost
//!
//! Each subcommand of the CLI maps onto a function here. `main` loads and
//! validates the configuration, then dispatches.

pub mod models;
pub mod special_commands;

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::Result;
use crate::memory::Memory;

/// Cancel `token` on the first Ctrl-C. Abort the returned handle once the
/// guarded phase is over.
fn cancel_on_ctrl_c(token: &CancellationToken) -> tokio::task::JoinHandle<()> {
    let token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupted, cancelling");
            token.cancel();
        }
    })
}

/// Resolve and create the cache directory.
fn prepare_cache_dir(config: &Config) -> Result<PathBuf> {
    let cache_dir = config.cache_dir()?;
    std::fs::create_dir_all(&cache_dir)?;
    Ok(cache_dir)
}

/// Load conversation memory, starting empty when the file is unreadable.
fn load_memory(path: &std::path::Path) -> Arc<Memory> {
    let memory = Memory::new();
    if let Err(e) = memory.load_file(path) {
        tracing::warn!(path = %path.display(), error = %e, "failed to load memory, starting empty");
    }
    Arc::new(memory)
}

// Console chat through the bot and its queues
pub mod chat {
    use super::*;
    use crate::bot::{Bot, ChatEvent, ChatRequest, ImageReply, ImageRequest, Submission};
    use crate::commands::special_commands::{parse_special_command, print_help, SpecialCommand};
    use crate::models::load_models;
    use colored::Colorize;
    use rustyline::error::ReadlineError;
    use rustyline::DefaultEditor;
    use std::io::Write;
    use tokio::sync::{mpsc, oneshot};

    /// Run the interactive console chat.
    ///
    /// # Errors
    ///
    /// Returns an error if the engines fail to start or the console cannot
    /// be opened.
    pub async fn run_chat(config: Config, user: String, channel: String) -> Result<()> {
        let cache_dir = prepare_cache_dir(&config)?;
        let memory_path = config.memory_path(&cache_dir);
        let memory = load_memory(&memory_path);

        let cancel = CancellationToken::new();
        let guard = cancel_on_ctrl_c(&cancel);
        println!("{}", "Starting engines, this may take a while...".cyan());
        let models = load_models(&config, &cache_dir, cancel).await;
        guard.abort();
        let models = models?;

        let mut bot = Bot::new(
            models.llm.clone(),
            models.image.clone(),
            Arc::clone(&memory),
            config.settings.clone(),
        );
        bot.spawn_workers(&config.scheduler);

        let mut rl = DefaultEditor::new()?;
        println!(
            "{}",
            "Ready. Type /help for commands, /exit to leave.".green()
        );
        let prompt = format!("{}> ", user);

        loop {
            match rl.readline(&prompt) {
                Ok(line) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    let _ = rl.add_history_entry(trimmed);

                    match parse_special_command(trimmed) {
                        Ok(SpecialCommand::Forget(system)) => {
                            println!("{}\n", bot.forget(&user, &channel, system.as_deref()));
                        }
                        Ok(SpecialCommand::Image(description)) => {
                            image(&bot, &user, &channel, description, &cache_dir).await;
                        }
                        Ok(SpecialCommand::Help) => print_help(),
                        Ok(SpecialCommand::Exit) => break,
                        Ok(SpecialCommand::None) => {
                            chat(&bot, &user, &channel, trimmed).await;
                        }
                        Err(e) => eprintln!("{}\n", e.to_string().red()),
                    }
                }
                Err(ReadlineError::Interrupted) => {
                    println!("CTRL-C");
                    break;
                }
                Err(ReadlineError::Eof) => {
                    println!("CTRL-D");
                    break;
                }
                Err(err) => {
                    tracing::error!("Readline error: {:?}", err);
                    break;
                }
            }
        }

        bot.shutdown().await;
        if let Err(e) = memory.save_file(&memory_path) {
            tracing::error!(path = %memory_path.display(), error = %e, "failed to save memory");
        }
        if let Err(e) = models.close().await {
            tracing::warn!(error = %e, "engine shutdown");
        }
        println!("Goodbye!");
        Ok(())
    }

    async fn chat(bot: &Bot, user: &str, channel: &str, message: &str) {
        let (tx, mut rx) = mpsc::channel(32);
        let request = ChatRequest {
            user: user.to_string(),
            channel: channel.to_string(),
            message: message.to_string(),
            reply: tx,
        };
        if let Submission::Rejected(text) = bot.submit_chat(request) {
            println!("{}\n", text.yellow());
            return;
        }
        let mut stdout = std::io::stdout();
        println!();
        while let Some(event) = rx.recv().await {
            match event {
                ChatEvent::Fragment(fragment) => {
                    print!("{}", fragment);
                    let _ = stdout.flush();
                }
                ChatEvent::Done(_) => {
                    println!("\n");
                    break;
                }
                ChatEvent::Failed(text) => {
                    eprintln!("\n{}\n", text.red());
                    break;
                }
            }
        }
    }

    async fn image(
        bot: &Bot,
        user: &str,
        channel: &str,
        description: String,
        cache_dir: &std::path::Path,
    ) {
        let (tx, rx) = oneshot::channel();
        let request = ImageRequest {
            user: user.to_string(),
            channel: channel.to_string(),
            prompt: description,
            seed: rand::random::<u32>() as i64 + 1,
            reply: tx,
        };
        if let Submission::Rejected(text) = bot.submit_image(request) {
            println!("{}\n", text.yellow());
            return;
        }
        match rx.await {
            Ok(ImageReply::Image(png)) => {
                let dir = cache_dir.join("images");
                let path = dir.join(format!(
                    "{}.png",
                    chrono::Utc::now().format("%Y%m%d-%H%M%S")
                ));
                let written = std::fs::create_dir_all(&dir).and_then(|()| std::fs::write(&path, &png));
                match written {
                    Ok(()) => println!("Image saved to {}\n", path.display().to_string().green()),
                    Err(e) => eprintln!("{}\n", format!("Failed to save image: {}", e).red()),
                }
            }
            Ok(ImageReply::Failed(text)) => eprintln!("{}\n", text.red()),
            Err(_) => eprintln!("{}\n", "Image worker went away".red()),
        }
    }
}

// One-shot streaming prompt
pub mod prompt {
    use super::*;
    use crate::error::LlmHostError;
    use crate::llm::{Message, SamplingParams, Session};
    use std::io::Write;
    use tokio::sync::mpsc;

    /// Start the LLM, stream one reply to stdout, then shut it down.
    ///
    /// # Errors
    ///
    /// Returns `Config` when no model is configured, or the startup or
    /// generation error.
    pub async fn run_prompt(
        config: Config,
        message: String,
        system: Option<String>,
        params: SamplingParams,
    ) -> Result<()> {
        let opts = config.session_options().ok_or_else(|| {
            LlmHostError::Config("bot.llm.model must be set to send a prompt".to_string())
        })?;
        let cache_dir = prepare_cache_dir(&config)?;

        let cancel = CancellationToken::new();
        let guard = cancel_on_ctrl_c(&cancel);
        let session = Session::start(&opts, &config.known_llms, &cache_dir, cancel.clone()).await;
        let session = match session {
            Ok(session) => session,
            Err(e) => {
                guard.abort();
                return Err(e);
            }
        };

        let system = system.unwrap_or_else(|| config.settings.prompt_system.clone());
        let mut msgs = Vec::new();
        if !system.is_empty() {
            msgs.push(Message::system(system));
        }
        msgs.push(Message::user(message));

        let (tx, mut rx) = mpsc::channel::<String>(32);
        let print = async {
            let mut stdout = std::io::stdout();
            while let Some(fragment) = rx.recv().await {
                print!("{}", fragment);
                let _ = stdout.flush();
            }
            println!();
        };
        let (outcome, ()) = tokio::join!(
            session.prompt_streaming(&msgs, &params, tx, cancel.clone()),
            print
        );
        guard.abort();

        let closed = session.close().await;
        outcome.into_result()?;
        closed
    }
}

// Engine health probe
pub mod health {
    use super::*;
    use crate::config::is_host_port;
    use crate::error::LlmHostError;
    use crate::llm::session::{fetch_metrics, http_client, probe_health};

    /// Print the health status and, when available, the engine counters.
    ///
    /// # Errors
    ///
    /// Returns `Config` for a malformed address and `Protocol` when the
    /// engine does not answer.
    pub async fn run_health(remote: &str) -> Result<()> {
        if !is_host_port(remote) {
            return Err(LlmHostError::Config(format!(
                "invalid remote {:?}; use form 'host:port'",
                remote
            ))
            .into());
        }
        let http = http_client()?;
        let base_url = format!("http://{}", remote);
        let status = probe_health(&http, &base_url).await?;
        println!("status: {}", status);

        match fetch_metrics(&http, &base_url).await {
            Ok(m) => {
                println!(
                    "prompt: {} tokens at {:.1} tok/s",
                    m.prompt.count,
                    m.prompt.rate()
                );
                println!(
                    "generated: {} tokens at {:.1} tok/s",
                    m.generated.count,
                    m.generated.rate()
                );
                println!(
                    "kv cache: {:.1}% ({} tokens)",
                    m.kv_cache_usage * 100.0,
                    m.kv_cache_tokens
                );
                println!(
                    "requests: {} processing, {} pending",
                    m.requests_processing, m.requests_pending
                );
            }
            // Only exposed when the engine runs with --metrics.
            Err(e) => tracing::debug!(error = %e, "no metrics"),
        }
        Ok(())
    }
}
