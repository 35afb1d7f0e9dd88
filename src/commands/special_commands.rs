//! Special commands parser for the console chat
//!
//! Commands are prefixed with `/` and are case-insensitive. Anything else
//! is sent to the bot as a chat message.

use thiserror::Error;

/// Errors that can occur when parsing special commands
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// Unknown command was entered
    #[error("Unknown command: {0}\n\nType '/help' to see available commands")]
    UnknownCommand(String),

    /// Command requires an argument but none was provided
    #[error("Command {command} requires an argument\n\nUsage: {usage}")]
    MissingArgument { command: String, usage: String },
}

/// Special commands that can be executed during the console chat
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpecialCommand {
    /// Reset the conversation, optionally replacing the system prompt
    Forget(Option<String>),

    /// Generate an image from the prompt
    Image(String),

    /// Display help information
    Help,

    /// Exit the console
    Exit,

    /// Not a special command
    None,
}

/// Parse one line of console input.
///
/// # Errors
///
/// Returns `CommandError` for an unknown `/command` or a missing argument.
///
/// # Examples
///
/// ```
/// use llmhost::commands::special_commands::{parse_special_command, SpecialCommand};
///
/// assert_eq!(parse_special_command("/forget").unwrap(), SpecialCommand::Forget(None));
/// assert_eq!(parse_special_command("hello").unwrap(), SpecialCommand::None);
/// ```
pub fn parse_special_command(input: &str) -> Result<SpecialCommand, CommandError> {
    let input = input.trim();
    if !input.starts_with('/') {
        return Ok(SpecialCommand::None);
    }

    let (command, rest) = match input.split_once(char::is_whitespace) {
        Some((command, rest)) => (command, rest.trim()),
        None => (input, ""),
    };

    match command.to_lowercase().as_str() {
        "/forget" => Ok(SpecialCommand::Forget(
            Some(rest.to_string()).filter(|r| !r.is_empty()),
        )),
        "/image" => {
            if rest.is_empty() {
                return Err(CommandError::MissingArgument {
                    command: "/image".to_string(),
                    usage: "/image <description>".to_string(),
                });
            }
            Ok(SpecialCommand::Image(rest.to_string()))
        }
        "/help" | "/?" => Ok(SpecialCommand::Help),
        "/exit" | "/quit" => Ok(SpecialCommand::Exit),
        _ => Err(CommandError::UnknownCommand(command.to_string())),
    }
}

/// Print the list of special commands
pub fn print_help() {
    println!(
        r#"
Special commands:
  /forget [system prompt]  Reset the conversation, optionally with a new system prompt
  /image <description>     Generate an image
  /help                    Show this help
  /exit, /quit             Leave the chat
"#
    );
}
