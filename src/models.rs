//! Concurrent engine bring-up

use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::Result;
use crate::imagegen::ImageSession;
use crate::llm::Session;

/// Engines started by [`load_models`]
#[derive(Debug, Default)]
pub struct Models {
    pub llm: Option<Arc<Session>>,
    pub image: Option<Arc<ImageSession>>,
}

impl Models {
    /// Close every started engine, returning the first error.
    pub async fn close(&self) -> Result<()> {
        let (llm, image) = tokio::join!(
            async {
                match &self.llm {
                    Some(s) => s.close().await,
                    None => Ok(()),
                }
            },
            async {
                match &self.image {
                    Some(s) => s.close().await,
                    None => Ok(()),
                }
            }
        );
        llm.and(image)
    }
}

/// Start the configured LLM and image engines concurrently.
///
/// An engine that is not configured is skipped. If either fails, the other
/// one is closed before the error is returned.
///
/// # Errors
///
/// Returns the first startup error, the LLM's when both fail.
pub async fn load_models(
    config: &Config,
    cache_dir: &Path,
    cancel: CancellationToken,
) -> Result<Models> {
    let llm_opts = config.session_options();
    let image_opts = config.image_options();

    let (llm, image) = tokio::join!(
        async {
            match &llm_opts {
                Some(opts) => {
                    Session::start(opts, &config.known_llms, cache_dir, cancel.clone())
                        .await
                        .map(Some)
                }
                None => Ok(None),
            }
        },
        async {
            match &image_opts {
                Some(opts) => ImageSession::start(opts, cache_dir, cancel.clone())
                    .await
                    .map(Some),
                None => Ok(None),
            }
        }
    );

    match (llm, image) {
        (Ok(llm), Ok(image)) => Ok(Models {
            llm: llm.map(Arc::new),
            image: image.map(Arc::new),
        }),
        (Err(e), image) => {
            if let Ok(Some(image)) = image {
                if let Err(close_err) = image.close().await {
                    tracing::warn!(error = %close_err, "closing image engine");
                }
            }
            Err(e)
        }
        (Ok(llm), Err(e)) => {
            if let Some(llm) = llm {
                if let Err(close_err) = llm.close().await {
                    tracing::warn!(error = %close_err, "closing llm");
                }
            }
            Err(e)
        }
    }
}
