//! LLM engine support
//!
//! - `base`: messages, known models, sampling parameters
//! - `protocol`: the OpenAI-compatible and native llama.cpp clients
//! - `acquire`: locating the engine binary and downloading models
//! - `session`: the supervised engine lifecycle
//! - `metrics`: Prometheus text parsing
//! - `template`: system prompt placeholders

pub mod acquire;
pub mod base;
pub mod metrics;
pub mod protocol;
pub mod session;
pub mod template;

pub use base::{
    is_stop_marker, split_stop_marker, strip_stop_markers, KnownModel, Message, PackagingType, PromptEncoding, Role,
    SamplingParams, STOP_MARKERS,
};
pub use metrics::Metrics;
pub use protocol::{create_client, CompletionClient, StreamOutcome};
pub use session::{Backend, Session, SessionOptions, SessionState};
