//! Common LLM types
//!
//! Message and role types shared by both wire protocols, the known model
//! descriptors loaded from configuration, sampling parameters, and the
//! stop-marker normalization applied to every reply.

use crate::error::{LlmHostError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Role of a message in a conversation
///
/// `AvailableTools`, `ToolCall` and `ToolCallResult` are only meaningful
/// for models whose prompt encoding defines literals for them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Instruction prompt, first message when present
    System,
    /// End user input
    User,
    /// Model output
    Assistant,
    /// JSON description of tools the model may call
    AvailableTools,
    /// A tool invocation emitted by the model
    ToolCall,
    /// The result of a tool invocation
    ToolCallResult,
}

impl Role {
    /// Small integer used by the compact memory file format.
    pub fn code(self) -> u8 {
        match self {
            Self::System => 0,
            Self::User => 1,
            Self::Assistant => 2,
            Self::AvailableTools => 3,
            Self::ToolCall => 4,
            Self::ToolCallResult => 5,
        }
    }

    /// Inverse of [`Role::code`].
    ///
    /// # Errors
    ///
    /// Returns `LlmHostError::Memory` for an unknown code.
    pub fn from_code(code: u8) -> Result<Self> {
        Ok(match code {
            0 => Self::System,
            1 => Self::User,
            2 => Self::Assistant,
            3 => Self::AvailableTools,
            4 => Self::ToolCall,
            5 => Self::ToolCallResult,
            other => {
                return Err(LlmHostError::Memory(format!("unknown role {}", other)).into());
            }
        })
    }

    /// Wire name of the role
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::AvailableTools => "available_tools",
            Self::ToolCall => "tool_call",
            Self::ToolCallResult => "tool_call_result",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message sent to the LLM as part of the exchange
///
/// # Examples
///
/// ```
/// use llmhost::llm::{Message, Role};
///
/// let msg = Message::user("Hello!");
/// assert_eq!(msg.role, Role::User);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Role of the sender
    pub role: Role,
    /// Text content
    pub content: String,
}

impl Message {
    /// Creates a message with an explicit role
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    /// Creates a new system message
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    /// Creates a new user message
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// Creates a new assistant message
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Literal tokens used to flatten a message list into a single prompt
///
/// Only used by the native completion protocol. Its presence on a
/// [`KnownModel`] selects that protocol for the session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PromptEncoding {
    #[serde(default)]
    pub begin_of_text: String,
    #[serde(default)]
    pub system_token_start: String,
    #[serde(default)]
    pub system_token_end: String,
    #[serde(default)]
    pub user_token_start: String,
    #[serde(default)]
    pub user_token_end: String,
    #[serde(default)]
    pub assistant_token_start: String,
    #[serde(default)]
    pub assistant_token_end: String,
    #[serde(default)]
    pub tools_available_token_start: String,
    #[serde(default)]
    pub tools_available_token_end: String,
    #[serde(default)]
    pub tool_call_token_start: String,
    #[serde(default)]
    pub tool_call_token_end: String,
    #[serde(default)]
    pub tool_call_result_token_start: String,
    #[serde(default)]
    pub tool_call_result_token_end: String,
}

impl PromptEncoding {
    /// Start and end literals wrapping a message of `role`.
    pub fn delimiters(&self, role: Role) -> (&str, &str) {
        match role {
            Role::System => (&self.system_token_start, &self.system_token_end),
            Role::User => (&self.user_token_start, &self.user_token_end),
            Role::Assistant => (&self.assistant_token_start, &self.assistant_token_end),
            Role::AvailableTools => (
                &self.tools_available_token_start,
                &self.tools_available_token_end,
            ),
            Role::ToolCall => (&self.tool_call_token_start, &self.tool_call_token_end),
            Role::ToolCallResult => (
                &self.tool_call_result_token_start,
                &self.tool_call_result_token_end,
            ),
        }
    }
}

/// File format a model is published in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackagingType {
    /// Quantized single-file packed format
    Gguf,
    /// Raw weights
    Safetensors,
}

/// Static descriptor of a model the host knows how to fetch and drive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownModel {
    /// Repository in the form `<author>/<repo>`
    pub repo: String,
    /// File format used by the repository
    #[serde(rename = "packagingtype", alias = "packaging_type")]
    pub packaging_type: PackagingType,
    /// Base filename; a model identifier matches when it starts with it
    pub basename: String,
    /// Upstream repository the model is derived from
    #[serde(default)]
    pub upstream: String,
    /// Literal tokens for the native completion protocol
    #[serde(default)]
    pub prompt_encoding: Option<PromptEncoding>,
}

impl KnownModel {
    /// Canonical URL for this repository.
    pub fn url(&self) -> String {
        format!("https://huggingface.co/{}", self.repo)
    }

    /// Checks for obvious errors in the fields.
    ///
    /// # Errors
    ///
    /// Returns `LlmHostError::Config` if the repo or upstream are not in
    /// `<author>/<repo>` form, or if the basename is empty.
    pub fn validate(&self) -> Result<()> {
        if self.repo.matches('/').count() != 1 {
            return Err(LlmHostError::Config(format!("invalid repo {:?}", self.repo)).into());
        }
        if self.upstream.matches('/').count() != 1 {
            return Err(
                LlmHostError::Config(format!("invalid upstream {:?}", self.upstream)).into(),
            );
        }
        if self.basename.is_empty() {
            return Err(LlmHostError::Config(format!(
                "empty basename for repo {:?}",
                self.repo
            ))
            .into());
        }
        Ok(())
    }

    /// Finds the descriptor whose basename prefixes `model`.
    ///
    /// # Errors
    ///
    /// Returns `LlmHostError::UnknownModel` when nothing matches.
    pub fn select<'a>(known: &'a [KnownModel], model: &str) -> Result<&'a KnownModel> {
        known
            .iter()
            .find(|k| model.starts_with(&k.basename))
            .ok_or_else(|| LlmHostError::UnknownModel(model.to_string()).into())
    }
}

/// Sampling parameters for one generation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    /// Non-zero seed gives deterministic output without strong guarantees
    pub seed: i64,
    /// Below 1.0 is more repetitive, above 1.0 more creative
    pub temperature: f64,
    /// Upper bound on generated tokens
    pub max_tokens: Option<u32>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            seed: 1,
            temperature: 1.0,
            max_tokens: None,
        }
    }
}

/// End-of-turn literals emitted by several open model families
/// (Llama-3, Gemma-2, Phi-3, Mistral).
pub const STOP_MARKERS: &[&str] = &[
    "<|eot_id|>",
    "<end_of_turn>",
    "<|end|>",
    "<|endoftext|>",
    "</s>",
];

/// Returns true when a streamed fragment is exactly an end-of-turn literal.
pub fn is_stop_marker(fragment: &str) -> bool {
    STOP_MARKERS.contains(&fragment)
}

/// Splits a streamed fragment that ends with an end-of-turn literal.
///
/// Returns the text before the marker, or `None` when the fragment does not
/// end the turn.
pub fn split_stop_marker(fragment: &str) -> Option<&str> {
    let trimmed = fragment.trim_end();
    STOP_MARKERS
        .iter()
        .find_map(|marker| trimmed.strip_suffix(marker))
}

/// Strips trailing end-of-turn literals and surrounding whitespace.
///
/// # Examples
///
/// ```
/// use llmhost::llm::strip_stop_markers;
///
/// assert_eq!(strip_stop_markers(" Hi there<|eot_id|>"), "Hi there");
/// ```
pub fn strip_stop_markers(reply: &str) -> String {
    let mut out = reply.trim_end();
    loop {
        let before = out.len();
        for marker in STOP_MARKERS {
            out = out.strip_suffix(marker).unwrap_or(out).trim_end();
        }
        if out.len() == before {
            break;
        }
    }
    out.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn known(basename: &str) -> KnownModel {
        KnownModel {
            repo: "bartowski/Meta-Llama-3-8B-Instruct-GGUF".to_string(),
            packaging_type: PackagingType::Gguf,
            basename: basename.to_string(),
            upstream: "meta-llama/Meta-Llama-3-8B-Instruct".to_string(),
            prompt_encoding: None,
        }
    }

    #[test]
    fn test_role_codes_are_stable() {
        let roles = [
            Role::System,
            Role::User,
            Role::Assistant,
            Role::AvailableTools,
            Role::ToolCall,
            Role::ToolCallResult,
        ];
        for (i, role) in roles.iter().enumerate() {
            assert_eq!(role.code() as usize, i);
            assert_eq!(Role::from_code(i as u8).unwrap(), *role);
        }
        assert!(Role::from_code(6).is_err());
    }

    #[test]
    fn test_role_serializes_snake_case() {
        let json = serde_json::to_string(&Message::new(Role::AvailableTools, "[]")).unwrap();
        assert_eq!(json, r#"{"role":"available_tools","content":"[]"}"#);
    }

    #[test]
    fn test_known_model_validate() {
        assert!(known("Meta-Llama-3-8B-Instruct-").validate().is_ok());

        let mut bad = known("x");
        bad.repo = "no-slash".to_string();
        assert!(bad.validate().is_err());

        let mut bad = known("x");
        bad.upstream = "a/b/c".to_string();
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_known_model_select_by_prefix() {
        let models = vec![known("Mistral-7B-"), known("Meta-Llama-3-8B-Instruct-")];
        let k = KnownModel::select(&models, "Meta-Llama-3-8B-Instruct-Q5_K_M").unwrap();
        assert_eq!(k.basename, "Meta-Llama-3-8B-Instruct-");
        assert!(KnownModel::select(&models, "gemma-2").is_err());
    }

    #[test]
    fn test_known_model_from_yaml() {
        let yaml = r#"
repo: bartowski/Mistral-7B-Instruct-v0.3-GGUF
packagingtype: gguf
basename: Mistral-7B-Instruct-v0.3-
upstream: mistralai/Mistral-7B-Instruct-v0.3
prompt_encoding:
  begin_of_text: "<s>"
  user_token_start: "[INST]"
  user_token_end: "[/INST]"
"#;
        let k: KnownModel = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(k.packaging_type, PackagingType::Gguf);
        let enc = k.prompt_encoding.unwrap();
        assert_eq!(enc.delimiters(Role::User), ("[INST]", "[/INST]"));
        assert_eq!(enc.delimiters(Role::System), ("", ""));
    }

    #[test]
    fn test_strip_stop_markers() {
        assert_eq!(strip_stop_markers("Hello<|eot_id|>"), "Hello");
        assert_eq!(strip_stop_markers("Hello<|end|><|endoftext|>"), "Hello");
        assert_eq!(strip_stop_markers("  Hello <end_of_turn>\n"), "Hello");
        assert_eq!(strip_stop_markers("no marker"), "no marker");
    }

    #[test]
    fn test_is_stop_marker() {
        assert!(is_stop_marker("<|eot_id|>"));
        assert!(!is_stop_marker("hello"));
        assert!(!is_stop_marker(""));
    }

    #[test]
    fn test_split_stop_marker() {
        assert_eq!(split_stop_marker("<|eot_id|>"), Some(""));
        assert_eq!(split_stop_marker("ok<end_of_turn>\n"), Some("ok"));
        assert_eq!(split_stop_marker("ok</s>"), Some("ok"));
        assert_eq!(split_stop_marker("ok"), None);
        assert_eq!(split_stop_marker("<|eot_id|> more"), None);
    }
}
