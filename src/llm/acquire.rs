//! Engine binary discovery and model download
//!
//! Everything the local backends need before the first process is spawned:
//! locating `llama-server` or `llamafile`, checking the requested model
//! identifier, and fetching the GGUF file into the cache when missing.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use futures::StreamExt;
use tokio::io::AsyncWriteExt;

use crate::error::{LlmHostError, Result};
use crate::llm::session::Backend;
use crate::llm::{KnownModel, PackagingType};

/// Quantizations the engine is known to load
pub const KNOWN_QUANTIZATIONS: &[&str] = &[
    "F32", "F16", "FP16", "BF16", "Q8_0", "Q6_K", "Q5_K_S", "Q5_K_M", "Q5_1", "Q5_0", "Q4_K_S",
    "Q4_K_M", "Q4_K", "Q4_1", "Q4_0", "Q3_K_S", "Q3_K_M", "Q3_K_L", "Q2_K", "IQ4_NL", "IQ3_XXS",
    "IQ3_XS", "IQ3_S", "IQ3_M", "IQ2_XXS", "IQ2_XS", "IQ2_S", "IQ2_M", "IQ1_S", "IQ1_M",
];

/// Extract and check the quantization suffix of `model`.
///
/// The suffix is the text after the last `-`, then after the last `.`,
/// compared case-insensitively. `Mistral-7B-Instruct-v0.3-Q3_K_M` yields
/// `Q3_K_M`.
///
/// # Errors
///
/// Returns `LlmHostError::QuantizationSuffix` when the suffix is missing,
/// is the file extension, or is not a known quantization.
pub fn quantization(model: &str) -> Result<String> {
    let upper = model.to_uppercase();
    let mut token = upper.as_str();
    let mut separated = false;
    if let Some(i) = token.rfind('-') {
        if i > 0 {
            token = &token[i + 1..];
            separated = true;
        }
    }
    if let Some(i) = token.rfind('.') {
        token = &token[i + 1..];
        separated = true;
    }
    // A bare name carries no suffix at all.
    if !separated {
        token = "";
    }

    match token {
        "GGUF" => Err(LlmHostError::QuantizationSuffix(format!(
            "do not include the .gguf suffix for model {:?}",
            model
        ))
        .into()),
        "" => Err(LlmHostError::QuantizationSuffix(format!(
            "missing quantization suffix like 'BF16', 'F16', 'Q8_0' or 'Q5_K_M' for model {:?}",
            model
        ))
        .into()),
        t if KNOWN_QUANTIZATIONS.contains(&t) => {
            if t == "BF16" && cfg!(target_os = "macos") {
                tracing::warn!(model, "bfloat16 may not be fully supported on Apple Silicon");
            }
            Ok(t.to_string())
        }
        t => Err(LlmHostError::QuantizationSuffix(format!(
            "unknown quantization {:?} for model {:?}, did you forget a suffix like 'BF16' or 'Q5_K_M'?",
            t, model
        ))
        .into()),
    }
}

/// Make sure `<models_dir>/<model>.gguf` exists, downloading it if needed.
///
/// An existing file is returned without touching the network. Downloads
/// stream into a `.part` file that is renamed once complete.
///
/// # Errors
///
/// Returns `LlmHostError::QuantizationSuffix` for a bad identifier and
/// `LlmHostError::Acquisition` when the file cannot be fetched.
pub async fn ensure_model(
    http: &reqwest::Client,
    hf_base: &str,
    model: &str,
    known: &KnownModel,
    models_dir: &Path,
) -> Result<PathBuf> {
    quantization(model)?;

    let dst = models_dir.join(format!("{}.gguf", model));
    if tokio::fs::metadata(&dst).await.is_ok() {
        tracing::debug!(model, path = %dst.display(), "model already cached");
        return Ok(dst);
    }
    tracing::info!(model, state = "missing", "model not in cache");

    match known.packaging_type {
        PackagingType::Gguf => {}
        other => {
            return Err(LlmHostError::Acquisition(format!(
                "can't fetch model {:?}: packaging {:?} is not supported",
                model, other
            ))
            .into());
        }
    }

    tokio::fs::create_dir_all(models_dir).await?;
    let url = format!(
        "{}/{}/resolve/main/{}.gguf",
        hf_base.trim_end_matches('/'),
        known.repo,
        model
    );
    let part = dst.with_extension("gguf.part");

    if let Err(e) = download(http, &url, &part).await {
        let _ = tokio::fs::remove_file(&part).await;
        return Err(LlmHostError::Acquisition(format!(
            "can't download model {:?} from {} to {}: {} (see {} for available files)",
            model,
            url,
            dst.display(),
            e,
            known.url()
        ))
        .into());
    }
    tokio::fs::rename(&part, &dst).await?;
    tracing::info!(model, path = %dst.display(), "model downloaded");
    Ok(dst)
}

async fn download(http: &reqwest::Client, url: &str, dst: &Path) -> Result<u64> {
    tracing::info!(url, "downloading");
    let response = http.get(url).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(LlmHostError::Acquisition(format!("HTTP {}", status)).into());
    }

    let mut file = tokio::fs::File::create(dst).await?;
    let mut written: u64 = 0;
    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    tracing::debug!(url, bytes = written, "download complete");
    Ok(written)
}

/// Located inference engine executable
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineBinary {
    pub path: PathBuf,
    pub backend: Backend,
}

impl EngineBinary {
    /// Full command line for `args`.
    ///
    /// llamafile is an Actually Portable Executable and must go through
    /// `/bin/sh` on Unix.
    pub fn command(&self, args: &[String]) -> Vec<String> {
        let mut cmd = Vec::with_capacity(args.len() + 1);
        cmd.push(self.path.display().to_string());
        cmd.extend(args.iter().cloned());
        if self.backend == Backend::Llamafile && cfg!(unix) {
            let script = cmd.iter().map(|a| shell_quote(a)).collect::<Vec<_>>().join(" ");
            return vec!["/bin/sh".to_string(), "-c".to_string(), script];
        }
        cmd
    }

    /// Runs the engine with `--version` and returns its output.
    ///
    /// # Errors
    ///
    /// Returns `LlmHostError::Acquisition` if the binary does not run.
    pub async fn version(&self) -> Result<String> {
        let cmd = self.command(&["--version".to_string()]);
        let output = tokio::process::Command::new(&cmd[0])
            .args(&cmd[1..])
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                LlmHostError::Acquisition(format!(
                    "failed to run {}: {}",
                    self.path.display(),
                    e
                ))
            })?;
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        if !output.status.success() {
            return Err(LlmHostError::Acquisition(format!(
                "failed to get engine version: {}\n{}",
                output.status,
                text.trim()
            ))
            .into());
        }
        Ok(text.trim().to_string())
    }
}

/// Single-quote `arg` for `/bin/sh`, escaping embedded quotes.
fn shell_quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', r"'\''"))
}

const EXE_SUFFIX: &str = std::env::consts::EXE_SUFFIX;

/// Find `llama-server` or `llamafile` on `PATH`, then in `cache_dir`.
///
/// # Errors
///
/// Returns `LlmHostError::Acquisition` naming every searched location.
pub fn find_engine(cache_dir: &Path) -> Result<EngineBinary> {
    find_engine_in(std::env::var_os("PATH"), cache_dir)
}

/// Same as [`find_engine`] with an explicit search path.
pub fn find_engine_in(path_var: Option<OsString>, cache_dir: &Path) -> Result<EngineBinary> {
    let dirs: Vec<PathBuf> = path_var
        .map(|p| std::env::split_paths(&p).collect())
        .unwrap_or_default();

    let candidates = [
        ("llama-server", Backend::LlamaServer),
        ("llamafile", Backend::Llamafile),
    ];
    for (name, backend) in candidates {
        let file = format!("{}{}", name, EXE_SUFFIX);
        if let Some(path) = dirs.iter().map(|d| d.join(&file)).find(|p| p.is_file()) {
            return Ok(EngineBinary { path, backend });
        }
    }
    for (name, backend) in candidates {
        let path = cache_dir.join(format!("{}{}", name, EXE_SUFFIX));
        if path.is_file() {
            return Ok(EngineBinary { path, backend });
        }
    }

    Err(LlmHostError::Acquisition(format!(
        "neither llama-server nor llamafile found in PATH ({}) or in {}",
        dirs.iter()
            .map(|d| d.display().to_string())
            .collect::<Vec<_>>()
            .join(", "),
        cache_dir.display()
    ))
    .into())
}
