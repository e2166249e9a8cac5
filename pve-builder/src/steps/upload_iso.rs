use crate::multistep::{StateBag, Step, StepAction};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use url::{ParseError, Url};
use tokio::fs::File;

const ISO_CONTENT_TYPE: &str = "iso";

/// Uploads the downloaded ISO to Proxmox storage so the VM can boot from it.
pub struct StepUploadIso;

#[async_trait]
impl Step for StepUploadIso {
    fn name(&self) -> &'static str {
        "upload_iso"
    }

    async fn run(&self, state: &mut StateBag) -> StepAction {
        let config = state.config();
        if !config.should_upload_iso() {
            let iso_file = config.iso_file.clone();
            state.put_iso_file(iso_file);
            return StepAction::Continue;
        }

        match self.upload(state).await {
            Ok(iso_file) => {
                state.ui().say(&format!("Uploaded ISO to {}", iso_file));
                state.put_iso_file(iso_file);
                StepAction::Continue
            }
            Err(e) => state.halt(e),
        }
    }
}

impl StepUploadIso {
    async fn upload(&self, state: &StateBag) -> Result<String> {
        let config = state.config();

        let downloaded = state
            .download_path()
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or_else(|| anyhow!("Path to downloaded ISO was empty"))?;

        // Unresolvable links are left for the open below to report.
        let iso_path = match tokio::fs::canonicalize(downloaded).await {
            Ok(resolved) => resolved,
            Err(e) => {
                tracing::debug!(
                    "Could not resolve symlinks for {}: {}",
                    downloaded.display(),
                    e
                );
                downloaded.to_path_buf()
            }
        };
        let file = File::open(&iso_path)
            .await
            .with_context(|| format!("Failed to open ISO {}", iso_path.display()))?;

        let source = config
            .iso_urls
            .first()
            .ok_or_else(|| anyhow!("No ISO URL configured"))?;
        let filename = iso_filename(source)?;

        let uploader = state
            .uploader()
            .ok_or_else(|| anyhow!("Proxmox client is not connected"))?;

        state.ui().say(&format!(
            "Uploading {} to {} on node {}",
            filename, config.iso_storage_pool, config.node
        ));
        if config.iso_upload_chunk_size > 0 {
            uploader
                .upload_chunked(
                    &config.node,
                    &config.iso_storage_pool,
                    ISO_CONTENT_TYPE,
                    &filename,
                    file,
                    config.iso_upload_chunk_size,
                )
                .await?;
        } else {
            uploader
                .upload(
                    &config.node,
                    &config.iso_storage_pool,
                    ISO_CONTENT_TYPE,
                    &filename,
                    file,
                )
                .await?;
        }

        Ok(format!(
            "{}:{}/{}",
            config.iso_storage_pool, ISO_CONTENT_TYPE, filename
        ))
    }
}

/// Recover the original file name from an ISO source URL: the escaped path
/// is query-unescaped as a whole and its last component kept, so encoded
/// separators never reach the name. Plain paths are accepted as references
/// relative to `file:///`.
pub fn iso_filename(source: &str) -> Result<String> {
    let url = match Url::parse(source) {
        Ok(url) => url,
        Err(ParseError::RelativeUrlWithoutBase) => Url::parse("file:///")
            .and_then(|base| base.join(source))
            .with_context(|| format!("Invalid ISO URL: {}", source))?,
        Err(e) => return Err(e).with_context(|| format!("Invalid ISO URL: {}", source)),
    };

    let path = query_unescape(url.path());
    let filename = path.rsplit('/').next().unwrap_or_default();
    if matches!(filename, "" | "." | "..") {
        return Err(anyhow!("ISO URL has no file name: {}", source));
    }
    Ok(filename.to_string())
}

/// `+` reads as a space; bad escapes leave the path as it was.
fn query_unescape(path: &str) -> String {
    let spaced = path.replace('+', " ");
    match urlencoding::decode(&spaced) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => spaced,
    }
}

#[cfg(test)]
#[path = "upload_iso_tests.rs"]
mod upload_iso_tests;
