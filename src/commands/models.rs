//! Known model listing

use crate::config::Config;
use crate::error::Result;
use crate::llm::{acquire, KnownModel};
use prettytable::{row, Table};
use serde::Serialize;

/// One row of the listing
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelRow {
    pub repo: String,
    pub basename: String,
    pub upstream: String,
    /// Wire protocol the session will speak
    pub protocol: &'static str,
    /// True for the model configured in `bot.llm.model`
    pub active: bool,
}

impl ModelRow {
    fn from_known(known: &KnownModel, active_model: &str) -> Self {
        Self {
            repo: known.repo.clone(),
            basename: known.basename.clone(),
            upstream: known.upstream.clone(),
            protocol: if known.prompt_encoding.is_some() {
                "llamacpp"
            } else {
                "openai"
            },
            active: !active_model.is_empty() && active_model.starts_with(&known.basename),
        }
    }
}

/// Rows for every known model, in configuration order.
pub fn model_rows(config: &Config) -> Vec<ModelRow> {
    config
        .known_llms
        .iter()
        .map(|k| ModelRow::from_known(k, &config.bot.llm.model))
        .collect()
}

/// Print the known models as a table or JSON.
///
/// # Errors
///
/// Returns an error if JSON serialization fails.
pub fn list_models(config: &Config, json: bool) -> Result<()> {
    let rows = model_rows(config);

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if rows.is_empty() {
        println!("No known models; add them to the known_llms section of the config");
        return Ok(());
    }

    let mut table = Table::new();
    table.add_row(row!["Repo", "Basename", "Upstream", "Protocol", "Active"]);
    for r in &rows {
        table.add_row(row![
            r.repo,
            r.basename,
            r.upstream,
            r.protocol,
            if r.active { "*" } else { "" }
        ]);
    }

    println!("\nKnown models:\n");
    table.printstd();

    if !config.bot.llm.model.is_empty() {
        match acquire::quantization(&config.bot.llm.model) {
            Ok(q) => println!("\nActive model: {} ({})", config.bot.llm.model, q),
            Err(e) => println!("\nActive model: {} ({})", config.bot.llm.model, e),
        }
    }
    println!();
    Ok(())
}
