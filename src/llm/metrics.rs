//! Engine performance counters
//!
//! llama-server started with `--metrics` exposes Prometheus text on
//! `/metrics`. Only the handful of counters we report are extracted.

use std::time::Duration;

use crate::error::{LlmHostError, Result};

/// Token count and the time spent producing it
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TokenPerformance {
    pub count: u64,
    pub duration: Duration,
}

impl TokenPerformance {
    /// Tokens per second, 0 when no time was recorded.
    pub fn rate(&self) -> f64 {
        let secs = self.duration.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.count as f64 / secs
    }
}

/// Snapshot of the engine counters
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Metrics {
    pub prompt: TokenPerformance,
    pub generated: TokenPerformance,
    pub kv_cache_usage: f64,
    pub kv_cache_tokens: u64,
    pub requests_processing: u64,
    pub requests_pending: u64,
}

impl Metrics {
    /// Parse the Prometheus text exposition returned by the engine.
    ///
    /// Comment lines are skipped and unrecognized metrics ignored.
    ///
    /// # Errors
    ///
    /// Returns `LlmHostError::Protocol` for a line that is not
    /// `<name> <value>` or whose value is not a number.
    pub fn parse(text: &str) -> Result<Self> {
        let mut m = Self::default();
        for line in text.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() != 2 {
                return Err(LlmHostError::Protocol(format!("failed to parse line {:?}", line)).into());
            }
            let value: f64 = parts[1].parse().map_err(|e| {
                LlmHostError::Protocol(format!("failed to parse line {:?}: {}", line, e))
            })?;
            let count = value.max(0.0) as u64;
            match parts[0] {
                "llamacpp:prompt_tokens_total" => m.prompt.count = count,
                "llamacpp:prompt_seconds_total" => m.prompt.duration = secs(value),
                "llamacpp:tokens_predicted_total" => m.generated.count = count,
                "llamacpp:tokens_predicted_seconds_total" => m.generated.duration = secs(value),
                "llamacpp:kv_cache_usage_ratio" => m.kv_cache_usage = value,
                "llamacpp:kv_cache_tokens" => m.kv_cache_tokens = count,
                "llamacpp:requests_processing" => m.requests_processing = count,
                "llamacpp:requests_deferred" => m.requests_pending = count,
                other => tracing::trace!(metric = other, "ignoring metric"),
            }
        }
        Ok(m)
    }
}

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or_default()
}
